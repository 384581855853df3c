//! Executes attachment plans against the platform.
//!
//! Planning is done by [`pvx_reconcile::plan_attachments`]; this module turns
//! the plan into configuration writes, volume moves and resizes. Volume
//! references the platform assigns are picked up by the caller's next read.

use std::collections::BTreeMap;

use pvx_id::SlotKey;
use pvx_reconcile::{plan_attachments, AttachmentPlan, PlanError};
use tracing::{debug, info};

use crate::api::{ConfigUpdate, GuestRef, PlatformApi};
use crate::config::AttachmentMode;
use crate::error::EngineError;
use crate::model::{Attachment, VolumeSize};
use crate::translate::{ConfigDraft, Translator};
use crate::validate::ValidationError;

/// Pushes `draft` to an existing guest, reconciling its devices onto
/// `desired`.
///
/// Any failing call aborts the remaining steps; earlier steps stay applied.
pub async fn apply_config(
    api: &dyn PlatformApi,
    translator: &dyn Translator,
    guest: &GuestRef,
    draft: &ConfigDraft,
    desired: &BTreeMap<SlotKey, Attachment>,
    mode: AttachmentMode,
) -> Result<(), EngineError> {
    let config = api
        .guest_config(guest)
        .await
        .map_err(EngineError::api("read configuration", Some(guest.vmid)))?;
    let previous = translator.attachments_from_remote(&config)?;

    let plan = plan_attachments(&previous, desired).map_err(|e| match e {
        PlanError::ProtectedSlot { slot, reason } => {
            EngineError::Validation(ValidationError::new(format!("attachments.{}", slot), reason))
        }
    })?;

    if !plan.is_empty() {
        info!(
            guest = %guest,
            deletes = plan.deletes.len(),
            writes = plan.writes.len(),
            moves = plan.moves.len(),
            resizes = plan.resizes.len(),
            "reconciling attachments"
        );
    }

    match mode {
        AttachmentMode::Staged => {
            if !plan.deletes.is_empty() {
                let update = plan
                    .deletes
                    .iter()
                    .fold(ConfigUpdate::new(), |update, slot| update.delete(slot.to_string()));
                send_update(api, guest, &update, "delete attachments").await?;
            }
            if !plan.writes.is_empty() {
                let update = ConfigUpdate::new().extend(format_writes(translator, &plan)?);
                send_update(api, guest, &update, "attach devices").await?;
            }
            run_moves_and_resizes(api, guest, &plan).await?;

            let update = draft.update();
            if !update.is_empty() {
                send_update(api, guest, &update, "update configuration").await?;
            }
        }
        AttachmentMode::Inline => {
            let update = plan
                .bare_deletes()
                .iter()
                .fold(draft.update(), |update, slot| update.delete(slot.to_string()))
                .extend(format_writes(translator, &plan)?);
            if !update.is_empty() {
                send_update(api, guest, &update, "update configuration").await?;
            }
            run_moves_and_resizes(api, guest, &plan).await?;
        }
    }
    Ok(())
}

fn format_writes(
    translator: &dyn Translator,
    plan: &AttachmentPlan<Attachment>,
) -> Result<Vec<(String, String)>, EngineError> {
    plan.writes
        .iter()
        .map(|(slot, attachment)| {
            translator
                .format_attachment(*slot, attachment)
                .map(|value| (slot.to_string(), value))
        })
        .collect()
}

async fn send_update(
    api: &dyn PlatformApi,
    guest: &GuestRef,
    update: &ConfigUpdate,
    operation: &'static str,
) -> Result<(), EngineError> {
    debug!(
        guest = %guest,
        set = update.params.len(),
        delete = ?update.delete_list(),
        "{}", operation
    );
    api.update_config(guest, update)
        .await
        .map_err(EngineError::api(operation, Some(guest.vmid)))
}

async fn run_moves_and_resizes(
    api: &dyn PlatformApi,
    guest: &GuestRef,
    plan: &AttachmentPlan<Attachment>,
) -> Result<(), EngineError> {
    for step in &plan.moves {
        debug!(guest = %guest, slot = %step.slot, storage = %step.storage, "moving volume");
        api.move_volume(guest, step.slot, &step.storage)
            .await
            .map_err(EngineError::api("move volume", Some(guest.vmid)))?;
    }
    for step in &plan.resizes {
        let size = VolumeSize::from_kib(step.size_kib).to_string();
        debug!(guest = %guest, slot = %step.slot, size = %size, "resizing volume");
        api.resize_volume(guest, step.slot, &size)
            .await
            .map_err(EngineError::api("resize volume", Some(guest.vmid)))?;
    }
    Ok(())
}
