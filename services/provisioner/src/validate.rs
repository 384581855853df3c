//! Desired-state validation.
//!
//! Runs before anything is sent to the platform.

use pvx_id::{SlotFamily, SlotKey};
use thiserror::Error;

use crate::model::{Attachment, GuestExtras, GuestSpec};

/// Smallest memory size the platform accepts, in MB.
pub const MIN_MEMORY_MB: u32 = 16;

/// A malformed attribute.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Checks a spec for create, where create-only fields are required.
pub fn validate_for_create(spec: &GuestSpec) -> Result<(), ValidationError> {
    validate_spec(spec)?;

    if let GuestExtras::Lxc { ostemplate, .. } = &spec.extras {
        if ostemplate.as_deref().map_or(true, str::is_empty) {
            return Err(ValidationError::new(
                "ostemplate",
                "containers need an OS template",
            ));
        }
    }

    Ok(())
}

/// Checks a spec for anything but create.
pub fn validate_spec(spec: &GuestSpec) -> Result<(), ValidationError> {
    if spec.node.trim().is_empty() {
        return Err(ValidationError::new("node", "must not be empty"));
    }
    if spec.cores < 1 {
        return Err(ValidationError::new("cores", "must be at least 1"));
    }
    if spec.memory < MIN_MEMORY_MB {
        return Err(ValidationError::new(
            "memory",
            format!("must be at least {} MB", MIN_MEMORY_MB),
        ));
    }

    match &spec.extras {
        GuestExtras::Qemu { sockets, .. } => {
            if *sockets < 1 {
                return Err(ValidationError::new("sockets", "must be at least 1"));
            }
        }
        GuestExtras::Lxc { .. } => {
            if spec.clone.is_some() {
                return Err(ValidationError::new(
                    "clone",
                    "only virtual machines can be cloned",
                ));
            }
        }
    }

    for (slot, attachment) in &spec.attachments {
        validate_attachment(spec, *slot, attachment)?;
    }

    Ok(())
}

fn validate_attachment(
    spec: &GuestSpec,
    slot: SlotKey,
    attachment: &Attachment,
) -> Result<(), ValidationError> {
    let field = format!("attachments.{}", slot);
    let is_vm = matches!(spec.extras, GuestExtras::Qemu { .. });

    let allowed = match (slot.family(), attachment) {
        (SlotFamily::Virtio, Attachment::Disk(_)) => is_vm,
        (SlotFamily::Ide, Attachment::Optical { .. }) => is_vm,
        (SlotFamily::Net, Attachment::Network(_)) => true,
        (SlotFamily::Mp | SlotFamily::RootFs, Attachment::Disk(_)) => !is_vm,
        _ => false,
    };
    if !allowed {
        return Err(ValidationError::new(
            field,
            format!(
                "a {} attachment cannot sit in this slot of a {}",
                attachment.kind_name(),
                spec.kind()
            ),
        ));
    }

    match attachment {
        Attachment::Disk(disk) => {
            if disk.volume.is_none() {
                if disk.storage.as_deref().map_or(true, str::is_empty) {
                    return Err(ValidationError::new(field, "storage must be set"));
                }
                match disk.size {
                    None => return Err(ValidationError::new(field, "size must be set")),
                    Some(size) if size.kib() == 0 => {
                        return Err(ValidationError::new(field, "size must be positive"))
                    }
                    Some(size) if is_vm && !size.is_whole_gib() => {
                        return Err(ValidationError::new(
                            field,
                            "virtual machine disks are sized in whole gigabytes",
                        ))
                    }
                    Some(_) => {}
                }
            }
            if slot.family() == SlotFamily::Mp
                && disk.mount_path.as_deref().map_or(true, str::is_empty)
            {
                return Err(ValidationError::new(field, "mount points need a mount path"));
            }
            if is_vm && disk.mount_path.is_some() {
                return Err(ValidationError::new(
                    field,
                    "mount paths only apply to containers",
                ));
            }
        }
        Attachment::Network(net) => {
            if net.bridge.is_empty() {
                return Err(ValidationError::new(field, "bridge must be set"));
            }
            if is_vm && (net.ip.is_some() || net.gateway.is_some()) {
                return Err(ValidationError::new(
                    field,
                    "addresses of virtual machine interfaces are assigned inside the guest",
                ));
            }
        }
        Attachment::Optical { .. } => {}
    }

    Ok(())
}
