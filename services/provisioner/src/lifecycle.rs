//! Lifecycle orchestration.
//!
//! [`Engine`] is the entry point the host calls per operation. It sequences
//! allocation, translation, attachment reconciliation, power changes and
//! read-back against a platform that offers no transactions: each step is
//! applied immediately and a failing step aborts the rest.
//!
//! ## Create
//!
//! ```text
//! validate -> translate -> [resolve clone source]
//!          -> loop { allocate id -> create | clone } (retry auto ids on collision)
//!          -> [clone: push config, restart if pending]
//!          -> start if desired running -> read everything
//! ```
//!
//! ## Update
//!
//! ```text
//! validate -> translate -> reconcile attachments + push config
//!          -> restart if pending -> read everything
//!          -> start/stop if power state differs -> read status
//! ```

use std::sync::Arc;

use pvx_id::GuestId;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::allocator::{Allocation, IdAllocator};
use crate::api::{CloneRequest, GuestKind, GuestRef, GuestSummary, PlatformApi, PowerState};
use crate::attachments::apply_config;
use crate::config::{EngineConfig, RestartStrategy};
use crate::drift::{carry_over, ReadOutcome};
use crate::error::EngineError;
use crate::model::{CloneSource, GuestSpec, TrackedGuest};
use crate::state::{StateMask, StateReader};
use crate::translate::{translator, ConfigDraft};
use crate::validate::{validate_for_create, validate_spec, ValidationError};

/// Reconciles guests against the platform.
pub struct Engine {
    api: Arc<dyn PlatformApi>,
    config: EngineConfig,
    allocator: IdAllocator,
    shutdown: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(api: Arc<dyn PlatformApi>, config: EngineConfig) -> Self {
        let (_tx, shutdown) = watch::channel(false);
        Self {
            allocator: IdAllocator::new(api.clone()),
            api,
            config,
            shutdown,
        }
    }

    /// Stops address polling when `shutdown` flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn reader(&self) -> StateReader {
        StateReader::new(
            self.api.clone(),
            self.config.poll_interval,
            self.config.poll_deadline,
            self.shutdown.clone(),
        )
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates the guest described by `spec` and returns its observed state.
    pub async fn create(&self, spec: &GuestSpec) -> Result<TrackedGuest, EngineError> {
        validate_for_create(spec)?;
        let kind = spec.kind();
        let translator = translator(kind);
        let draft = translator.to_remote(spec)?;

        let source = match &spec.clone {
            Some(source) => Some(self.resolve_clone_source(source).await?),
            None => None,
        };

        let guest = self.create_with_retry(spec, source.as_ref(), &draft).await?;
        let vmid = guest.vmid;

        if source.is_some() {
            // The clone call only takes a name; everything else follows.
            apply_config(
                &*self.api,
                translator,
                &guest,
                &draft,
                &spec.attachments,
                self.config.attachment_mode(kind),
            )
            .await?;
            if self.needs_restart(&guest).await? {
                self.restart(&guest).await?;
            }
        }

        if spec.status == PowerState::Running {
            info!(vmid = %vmid, "starting guest");
            self.api
                .start(&guest)
                .await
                .map_err(EngineError::api("start guest", Some(vmid)))?;
        }

        let tracked = self.observe(&guest, spec).await?;
        info!(vmid = %vmid, node = %guest.node, kind = %kind, "guest created");
        Ok(tracked)
    }

    async fn create_with_retry(
        &self,
        spec: &GuestSpec,
        source: Option<&GuestRef>,
        draft: &ConfigDraft,
    ) -> Result<GuestRef, EngineError> {
        let kind = spec.kind();
        let policy = &self.config.create_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let allocation = self.allocator.allocate(spec.vmid).await?;
            let vmid = allocation.vmid();
            let guest = GuestRef::new(spec.node.clone(), vmid, kind);

            let (operation, result) = match source {
                Some(source) => {
                    info!(vmid = %vmid, source = %source, "cloning guest");
                    let request = CloneRequest {
                        target: vmid,
                        node: spec.node.clone(),
                        name: spec.name.clone(),
                        full: false,
                    };
                    ("clone guest", self.api.clone_guest(source, &request).await)
                }
                None => {
                    info!(vmid = %vmid, node = %spec.node, kind = %kind, "creating guest");
                    let params = draft.create_params();
                    (
                        "create guest",
                        self.api.create_guest(&spec.node, kind, vmid, &params).await,
                    )
                }
            };

            match result {
                Ok(()) => return Ok(guest),
                Err(e) if e.is_id_collision() => match allocation {
                    Allocation::Explicit(vmid) => return Err(EngineError::AlreadyExists { vmid }),
                    Allocation::Auto(vmid) => {
                        if !policy.should_retry(attempt) {
                            return Err(EngineError::IdRaceExhausted { attempts: attempt });
                        }
                        let backoff = policy.backoff(attempt);
                        warn!(
                            vmid = %vmid,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "guest id taken concurrently, retrying with a new id"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                },
                Err(e) => return Err(EngineError::api(operation, Some(vmid))(e)),
            }
        }
    }

    /// Finds the clone source by id, or by name among virtual machines.
    async fn resolve_clone_source(&self, source: &CloneSource) -> Result<GuestRef, EngineError> {
        let guests = self.list_guests().await?;
        let found = guests.iter().find(|g| {
            g.kind == GuestKind::Qemu
                && match source {
                    CloneSource::Id(id) => g.vmid == *id,
                    CloneSource::Name(name) => g.name.as_deref() == Some(name.as_str()),
                }
        });
        match found {
            Some(summary) => {
                debug!(source = %source, vmid = %summary.vmid, "resolved clone source");
                Ok(summary.guest_ref())
            }
            None => Err(EngineError::TemplateNotFound(source.to_string())),
        }
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Refreshes a tracked guest. A guest that no longer exists is
    /// [`ReadOutcome::Gone`], not an error.
    pub async fn read(&self, prior: &TrackedGuest) -> Result<ReadOutcome, EngineError> {
        let Some(summary) = self.find_guest(prior.vmid).await? else {
            info!(vmid = %prior.vmid, "guest no longer exists, dropping it");
            return Ok(ReadOutcome::Gone);
        };
        let guest = summary.guest_ref();
        let tracked = self.observe(&guest, &prior.spec).await?;
        Ok(ReadOutcome::Present(tracked))
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Converges an existing guest onto `desired`.
    pub async fn update(
        &self,
        prior: &TrackedGuest,
        desired: &GuestSpec,
    ) -> Result<TrackedGuest, EngineError> {
        validate_spec(desired)?;
        if desired.kind() != prior.kind {
            return Err(ValidationError::new(
                "kind",
                format!("a {} cannot become a {}", prior.kind, desired.kind()),
            )
            .into());
        }

        let guest = prior.guest_ref();
        let vmid = guest.vmid;
        let translator = translator(guest.kind);
        let draft = translator.to_remote(desired)?;

        info!(vmid = %vmid, "updating guest");
        apply_config(
            &*self.api,
            translator,
            &guest,
            &draft,
            &desired.attachments,
            self.config.attachment_mode(guest.kind),
        )
        .await?;

        if self.needs_restart(&guest).await? {
            self.restart(&guest).await?;
        }

        // Container template, password and keys are create-only, so the
        // prior belief stands. The clone marker follows the operator.
        let mut tracked = self.observe(&guest, &prior.spec).await?;
        tracked.spec.clone.clone_from(&desired.clone);

        if tracked.spec.status != desired.status {
            match desired.status {
                PowerState::Running => {
                    info!(vmid = %vmid, "starting guest");
                    self.api
                        .start(&guest)
                        .await
                        .map_err(EngineError::api("start guest", Some(vmid)))?;
                }
                PowerState::Stopped => {
                    info!(vmid = %vmid, "stopping guest");
                    self.api
                        .stop(&guest)
                        .await
                        .map_err(EngineError::api("stop guest", Some(vmid)))?;
                }
            }
            self.reader()
                .read(&guest, &mut tracked.spec, StateMask::STATUS)
                .await?;
        }

        Ok(tracked)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Destroys a guest. Deleting a guest that is already gone succeeds.
    pub async fn delete(&self, prior: &TrackedGuest) -> Result<(), EngineError> {
        let Some(summary) = self.find_guest(prior.vmid).await? else {
            info!(vmid = %prior.vmid, "guest already gone");
            return Ok(());
        };
        let guest = summary.guest_ref();
        let vmid = guest.vmid;

        if self.power_state(&guest).await? == PowerState::Running {
            info!(vmid = %vmid, "stopping guest before delete");
            self.api
                .stop(&guest)
                .await
                .map_err(EngineError::api("stop guest", Some(vmid)))?;
        }

        info!(vmid = %vmid, "deleting guest");
        self.api
            .delete_guest(&guest)
            .await
            .map_err(EngineError::api("delete guest", Some(vmid)))
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Adopting existing guests is not supported.
    pub async fn import(&self, _id: &str) -> Result<TrackedGuest, EngineError> {
        Err(EngineError::ImportUnsupported)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Reads everything into a fresh spec and carries over untracked fields
    /// from `prior`.
    async fn observe(
        &self,
        guest: &GuestRef,
        prior: &GuestSpec,
    ) -> Result<TrackedGuest, EngineError> {
        let mut observed = GuestSpec::new(guest.node.clone(), guest.kind);
        self.reader()
            .read(guest, &mut observed, StateMask::EVERYTHING)
            .await?;
        carry_over(prior, &mut observed);
        Ok(TrackedGuest::new(guest.vmid, observed))
    }

    async fn list_guests(&self) -> Result<Vec<GuestSummary>, EngineError> {
        self.api
            .list_guests()
            .await
            .map_err(EngineError::api("list guests", None))
    }

    async fn find_guest(&self, vmid: GuestId) -> Result<Option<GuestSummary>, EngineError> {
        Ok(self
            .list_guests()
            .await?
            .into_iter()
            .find(|g| g.vmid == vmid))
    }

    /// True when a running guest has configuration waiting for a restart.
    async fn needs_restart(&self, guest: &GuestRef) -> Result<bool, EngineError> {
        let pending = self
            .api
            .has_pending_changes(guest)
            .await
            .map_err(EngineError::api("read pending changes", Some(guest.vmid)))?;
        Ok(pending && self.power_state(guest).await? == PowerState::Running)
    }

    async fn power_state(&self, guest: &GuestRef) -> Result<PowerState, EngineError> {
        self.api
            .power_state(guest)
            .await
            .map_err(EngineError::api("read power state", Some(guest.vmid)))
    }

    /// Applies pending configuration by restarting the guest.
    async fn restart(&self, guest: &GuestRef) -> Result<(), EngineError> {
        let vmid = Some(guest.vmid);
        info!(
            vmid = %guest.vmid,
            strategy = ?self.config.restart_strategy,
            "restarting guest to apply pending changes"
        );
        match self.config.restart_strategy {
            RestartStrategy::StopStart => {
                self.api
                    .stop(guest)
                    .await
                    .map_err(EngineError::api("stop guest", vmid))?;
                self.api
                    .start(guest)
                    .await
                    .map_err(EngineError::api("start guest", vmid))
            }
            RestartStrategy::Reboot => self
                .api
                .reboot(guest)
                .await
                .map_err(EngineError::api("reboot guest", vmid)),
        }
    }
}
