//! Translation between [`GuestSpec`] and the platform's flat configuration.
//!
//! One [`Translator`] per guest kind. Both directions go through the same
//! attachment formatting so a spec read back from the platform formats to
//! the same device strings it was written with.

use std::collections::BTreeMap;

use pvx_id::SlotKey;

use crate::api::{ConfigUpdate, GuestKind, RemoteConfig};
use crate::error::EngineError;
use crate::model::{Attachment, GuestSpec};

mod lxc;
mod property;
mod qemu;

pub use lxc::LxcTranslator;
pub use property::PropertyString;
pub use qemu::QemuTranslator;

/// Remote configuration built from a spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDraft {
    /// Keys written on create and update.
    pub params: BTreeMap<String, String>,

    /// Keys the platform only accepts on create.
    pub create_only: BTreeMap<String, String>,

    /// Device strings per slot. Present even when empty, meaning the guest
    /// should have no devices.
    pub attachments: BTreeMap<SlotKey, String>,

    /// Keys the guest spec leaves unset and which should be removed remotely.
    pub unset: Vec<String>,
}

impl ConfigDraft {
    /// Parameters of a create call.
    pub fn create_params(&self) -> BTreeMap<String, String> {
        let mut params = self.params.clone();
        params.extend(self.create_only.clone());
        params.extend(
            self.attachments
                .iter()
                .map(|(slot, value)| (slot.to_string(), value.clone())),
        );
        params
    }

    /// The configuration update for an existing guest, without devices.
    pub fn update(&self) -> ConfigUpdate {
        self.unset
            .iter()
            .fold(ConfigUpdate::new().extend(self.params.clone()), |update, key| {
                update.delete(key.clone())
            })
    }
}

/// Converts between one guest kind's spec and its remote configuration.
pub trait Translator: Send + Sync {
    fn kind(&self) -> GuestKind;

    /// Builds the remote configuration for `spec`.
    fn to_remote(&self, spec: &GuestSpec) -> Result<ConfigDraft, EngineError> {
        let mut draft = self.base_params(spec)?;
        for (slot, attachment) in &spec.attachments {
            let value = self.format_attachment(*slot, attachment)?;
            draft.attachments.insert(*slot, value);
        }
        Ok(draft)
    }

    /// Non-device keys of `spec`.
    fn base_params(&self, spec: &GuestSpec) -> Result<ConfigDraft, EngineError>;

    /// Device string for one attachment.
    fn format_attachment(&self, slot: SlotKey, attachment: &Attachment)
        -> Result<String, EngineError>;

    /// Overwrites the platform-tracked fields of `spec` from `config`.
    fn from_remote(&self, config: &RemoteConfig, spec: &mut GuestSpec) -> Result<(), EngineError>;

    /// The devices in `config` this translator manages.
    fn attachments_from_remote(
        &self,
        config: &RemoteConfig,
    ) -> Result<BTreeMap<SlotKey, Attachment>, EngineError>;
}

/// The translator for a guest kind.
pub fn translator(kind: GuestKind) -> &'static dyn Translator {
    match kind {
        GuestKind::Qemu => &QemuTranslator,
        GuestKind::Lxc => &LxcTranslator,
    }
}

/// Device slots present in `config`, with their raw values.
pub(crate) fn remote_slots(config: &RemoteConfig) -> impl Iterator<Item = (SlotKey, &str)> {
    config
        .iter()
        .filter_map(|(key, value)| key.parse::<SlotKey>().ok().map(|slot| (slot, value.as_str())))
}

/// Non-empty value of `key`.
pub(crate) fn remote_value(config: &RemoteConfig, key: &str) -> Option<String> {
    config
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Numeric value of `key`, or `default` when absent.
pub(crate) fn remote_number(
    config: &RemoteConfig,
    key: &str,
    default: u32,
) -> Result<u32, EngineError> {
    match remote_value(config, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            EngineError::translation(format!("platform reported non-numeric {} '{}'", key, raw))
        }),
    }
}

/// Legacy `1`/`0` flag, possibly inside a property string (`enabled=1,...`).
pub(crate) fn remote_flag(config: &RemoteConfig, key: &str) -> bool {
    match config.get(key) {
        None => false,
        Some(raw) => {
            let prop = PropertyString::parse(raw);
            prop.positional().or_else(|| prop.get("enabled")) == Some("1")
        }
    }
}

pub(crate) fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn mismatch(slot: SlotKey, attachment: &Attachment) -> EngineError {
    EngineError::translation(format!(
        "slot {} cannot hold a {} attachment",
        slot,
        attachment.kind_name()
    ))
}
