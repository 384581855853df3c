use std::collections::BTreeMap;

use pvx_id::{SlotFamily, SlotKey};
use pvx_networking::MacAddr;

use super::{
    flag, mismatch, remote_flag, remote_number, remote_slots, remote_value, ConfigDraft,
    PropertyString, Translator,
};
use crate::api::{GuestKind, RemoteConfig};
use crate::error::EngineError;
use crate::model::{
    default_memory, Attachment, DiskAttachment, DiskFormat, GuestExtras, GuestSpec,
    NetworkAttachment, OpticalAttachment, VolumeSize,
};

/// NIC model when none is given.
pub const DEFAULT_NIC_MODEL: &str = "virtio";

/// NIC models the platform stores as `<model>=<mac>`.
const NIC_MODELS: &[&str] = &[
    "virtio", "e1000", "e1000e", "rtl8139", "vmxnet3", "ne2k_pci", "pcnet", "i82551",
    "i82557b", "i82559er", "ne2k_isa",
];

/// Virtual machine translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct QemuTranslator;

impl Translator for QemuTranslator {
    fn kind(&self) -> GuestKind {
        GuestKind::Qemu
    }

    fn base_params(&self, spec: &GuestSpec) -> Result<ConfigDraft, EngineError> {
        let (agent, sockets) = match &spec.extras {
            GuestExtras::Qemu { agent, sockets } => (*agent, *sockets),
            GuestExtras::Lxc { .. } => {
                return Err(EngineError::translation(
                    "container settings handed to the virtual machine translator",
                ))
            }
        };

        let mut draft = ConfigDraft::default();
        match &spec.name {
            Some(name) if !name.is_empty() => {
                draft.params.insert("name".to_string(), name.clone());
            }
            _ => draft.unset.push("name".to_string()),
        }
        match &spec.description {
            Some(description) if !description.is_empty() => {
                draft.params.insert("description".to_string(), description.clone());
            }
            _ => draft.unset.push("description".to_string()),
        }
        draft.params.insert("agent".to_string(), flag(agent).to_string());
        draft.params.insert("sockets".to_string(), sockets.to_string());
        draft.params.insert("cores".to_string(), spec.cores.to_string());
        draft.params.insert("memory".to_string(), spec.memory.to_string());
        Ok(draft)
    }

    fn format_attachment(
        &self,
        slot: SlotKey,
        attachment: &Attachment,
    ) -> Result<String, EngineError> {
        match (slot.family(), attachment) {
            (SlotFamily::Virtio, Attachment::Disk(disk)) => format_disk(slot, disk),
            (SlotFamily::Ide, Attachment::Optical { iso }) => {
                let mut prop = PropertyString::with_positional(iso.volume_id());
                prop.set("media", "cdrom");
                Ok(prop.to_string())
            }
            (SlotFamily::Net, Attachment::Network(net)) => Ok(format_network(net)),
            _ => Err(mismatch(slot, attachment)),
        }
    }

    fn from_remote(&self, config: &RemoteConfig, spec: &mut GuestSpec) -> Result<(), EngineError> {
        spec.name = remote_value(config, "name");
        spec.description = remote_value(config, "description");
        spec.cores = remote_number(config, "cores", 1)?;
        spec.memory = remote_number(config, "memory", default_memory(GuestKind::Qemu))?;
        spec.extras = GuestExtras::Qemu {
            agent: remote_flag(config, "agent"),
            sockets: remote_number(config, "sockets", 1)?,
        };
        spec.attachments = self.attachments_from_remote(config)?;
        Ok(())
    }

    fn attachments_from_remote(
        &self,
        config: &RemoteConfig,
    ) -> Result<BTreeMap<SlotKey, Attachment>, EngineError> {
        let mut attachments = BTreeMap::new();
        for (slot, raw) in remote_slots(config) {
            let prop = PropertyString::parse(raw);
            let attachment = match slot.family() {
                SlotFamily::Virtio => Some(parse_disk(slot, &prop)?),
                SlotFamily::Ide => parse_optical(&prop),
                SlotFamily::Net => Some(parse_network(slot, &prop)?),
                _ => None,
            };
            if let Some(attachment) = attachment {
                attachments.insert(slot, attachment);
            }
        }
        Ok(attachments)
    }
}

fn format_disk(slot: SlotKey, disk: &DiskAttachment) -> Result<String, EngineError> {
    let mut prop = match (&disk.volume, &disk.storage, disk.size) {
        (Some(volume), _, size) => {
            let mut prop = PropertyString::with_positional(volume.clone());
            prop.set_opt("size", size);
            prop
        }
        (None, Some(storage), Some(size)) => {
            PropertyString::with_positional(format!("{}:{}", storage, size.gib()))
        }
        _ => {
            return Err(EngineError::translation(format!(
                "disk {} has neither a volume nor storage and size",
                slot
            )))
        }
    };
    if disk.volume.is_none() {
        prop.set("format", disk.format.unwrap_or_default().as_str());
    }
    Ok(prop.to_string())
}

fn format_network(net: &NetworkAttachment) -> String {
    let model = net.model.as_deref().unwrap_or(DEFAULT_NIC_MODEL);
    let mut prop = PropertyString::new();
    match &net.mac {
        Some(mac) => prop.set(model, mac.to_string()),
        None => prop.set("model", model),
    };
    prop.set("bridge", net.bridge.clone());
    prop.to_string()
}

fn parse_disk(slot: SlotKey, prop: &PropertyString) -> Result<Attachment, EngineError> {
    let volume = prop
        .positional()
        .or_else(|| prop.get("file"))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::translation(format!("disk {} has no volume", slot)))?;
    let storage = volume.split_once(':').map(|(storage, _)| storage.to_string());
    let size = match prop.get("size") {
        Some(raw) => Some(VolumeSize::from_platform(raw).ok_or_else(|| {
            EngineError::translation(format!("disk {} has unreadable size '{}'", slot, raw))
        })?),
        None => None,
    };
    let format = match prop.get("format") {
        Some(raw) => raw.parse().map_err(EngineError::translation)?,
        None => DiskFormat::default(),
    };
    Ok(Attachment::Disk(DiskAttachment {
        storage,
        size,
        format: Some(format),
        mount_path: None,
        volume: Some(volume.to_string()),
    }))
}

/// Only optical drives with media are managed; `none` is an empty drive.
fn parse_optical(prop: &PropertyString) -> Option<Attachment> {
    if prop.get("media") != Some("cdrom") {
        return None;
    }
    let file = prop.positional().or_else(|| prop.get("file"))?;
    if file == "none" || file == "cdrom" {
        return None;
    }
    let iso: OpticalAttachment = file.parse().ok()?;
    Some(Attachment::Optical { iso })
}

fn parse_network(slot: SlotKey, prop: &PropertyString) -> Result<Attachment, EngineError> {
    let mut net = NetworkAttachment::default();
    for (key, value) in prop.entries() {
        match key {
            "bridge" => net.bridge = value.to_string(),
            "model" => net.model = Some(value.to_string()),
            "macaddr" => net.mac = Some(parse_mac(slot, value)?),
            model if NIC_MODELS.contains(&model) => {
                net.model = Some(model.to_string());
                if !value.is_empty() {
                    net.mac = Some(parse_mac(slot, value)?);
                }
            }
            _ => {}
        }
    }
    Ok(Attachment::Network(net))
}

fn parse_mac(slot: SlotKey, value: &str) -> Result<MacAddr, EngineError> {
    value.parse().map_err(|e| {
        EngineError::translation(format!("interface {} has unreadable MAC: {}", slot, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> RemoteConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn virtio0() -> SlotKey {
        SlotKey::virtio(0).unwrap()
    }

    #[test]
    fn test_new_disk_requests_storage_in_gigabytes() {
        let disk = Attachment::Disk(DiskAttachment::new("local-lvm", VolumeSize::from_gib(30)));
        let value = QemuTranslator.format_attachment(virtio0(), &disk).unwrap();
        assert_eq!(value, "local-lvm:30,format=raw");
    }

    #[test]
    fn test_existing_disk_references_volume() {
        let disk = Attachment::Disk(DiskAttachment {
            volume: Some("local-lvm:vm-100-disk-0".to_string()),
            ..DiskAttachment::new("local-lvm", VolumeSize::from_gib(30))
        });
        let value = QemuTranslator.format_attachment(virtio0(), &disk).unwrap();
        assert_eq!(value, "local-lvm:vm-100-disk-0,size=30G");
    }

    #[test]
    fn test_optical_and_network_formats() {
        let iso = Attachment::Optical {
            iso: "local:iso/debian.iso".parse().unwrap(),
        };
        assert_eq!(
            QemuTranslator
                .format_attachment(SlotKey::ide(2).unwrap(), &iso)
                .unwrap(),
            "local:iso/debian.iso,media=cdrom"
        );

        let mut net = NetworkAttachment::bridged("vmbr0");
        let net0 = SlotKey::net(0).unwrap();
        assert_eq!(
            QemuTranslator
                .format_attachment(net0, &Attachment::Network(net.clone()))
                .unwrap(),
            "model=virtio,bridge=vmbr0"
        );
        net.mac = Some("bc:24:11:00:00:01".parse().unwrap());
        assert_eq!(
            QemuTranslator
                .format_attachment(net0, &Attachment::Network(net))
                .unwrap(),
            "virtio=BC:24:11:00:00:01,bridge=vmbr0"
        );
    }

    #[test]
    fn test_slot_mismatch_is_translation_error() {
        let net = Attachment::Network(NetworkAttachment::bridged("vmbr0"));
        assert!(matches!(
            QemuTranslator.format_attachment(virtio0(), &net),
            Err(EngineError::Translation(_))
        ));
    }

    #[test]
    fn test_from_remote() {
        let remote = config(&[
            ("name", "web"),
            ("description", ""),
            ("memory", "32"),
            ("cores", "2"),
            ("agent", "1"),
            ("virtio0", "local-lvm:vm-100-disk-0,size=30G"),
            ("ide2", "none,media=cdrom"),
            ("ide0", "local:iso/debian.iso,media=cdrom"),
            ("net0", "virtio=BC:24:11:00:00:01,bridge=vmbr0,firewall=1"),
            ("scsihw", "virtio-scsi-pci"),
            ("digest", "abc"),
        ]);

        let mut spec = GuestSpec::new("pve", GuestKind::Qemu);
        QemuTranslator.from_remote(&remote, &mut spec).unwrap();

        assert_eq!(spec.name.as_deref(), Some("web"));
        assert_eq!(spec.description, None);
        assert_eq!(spec.memory, 32);
        assert_eq!(spec.cores, 2);
        assert!(spec.agent_enabled());
        assert_eq!(spec.attachments.len(), 3);

        let disk = spec.attachments[&virtio0()].as_disk().unwrap();
        assert_eq!(disk.storage.as_deref(), Some("local-lvm"));
        assert_eq!(disk.size, Some(VolumeSize::from_gib(30)));
        assert_eq!(disk.format, Some(DiskFormat::Raw));

        let net = spec.primary_network().unwrap();
        assert_eq!(net.model.as_deref(), Some("virtio"));
        assert_eq!(net.mac.unwrap().to_string(), "BC:24:11:00:00:01");
    }

    #[test]
    fn test_round_trip_of_existing_disk_is_stable() {
        let remote = config(&[("virtio1", "fast:vm-100-disk-1,size=8G")]);
        let attachments = QemuTranslator.attachments_from_remote(&remote).unwrap();
        let slot = SlotKey::virtio(1).unwrap();
        let value = QemuTranslator
            .format_attachment(slot, &attachments[&slot])
            .unwrap();
        assert_eq!(value, "fast:vm-100-disk-1,size=8G");
    }

    #[test]
    fn test_empty_name_is_unset() {
        let draft = QemuTranslator
            .to_remote(&GuestSpec::new("pve", GuestKind::Qemu))
            .unwrap();
        assert!(draft.unset.contains(&"name".to_string()));
        assert_eq!(draft.params.get("agent").map(String::as_str), Some("0"));
        assert!(draft.attachments.is_empty());
    }
}
