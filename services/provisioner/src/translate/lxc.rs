use std::collections::BTreeMap;

use pvx_id::{SlotFamily, SlotKey};

use super::{
    flag, mismatch, remote_flag, remote_number, remote_slots, remote_value, ConfigDraft,
    PropertyString, Translator,
};
use crate::api::{GuestKind, RemoteConfig};
use crate::error::EngineError;
use crate::model::{
    default_memory, AddressAssignment, Attachment, DiskAttachment, GuestExtras, GuestSpec,
    NetworkAttachment, VolumeSize,
};

/// Container translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LxcTranslator;

impl Translator for LxcTranslator {
    fn kind(&self) -> GuestKind {
        GuestKind::Lxc
    }

    fn base_params(&self, spec: &GuestSpec) -> Result<ConfigDraft, EngineError> {
        let GuestExtras::Lxc {
            ostemplate,
            unprivileged,
            ostype,
            password,
            ssh_public_keys,
        } = &spec.extras
        else {
            return Err(EngineError::translation(
                "virtual machine settings handed to the container translator",
            ));
        };

        let mut draft = ConfigDraft::default();
        if let Some(hostname) = spec.name.as_ref().filter(|n| !n.is_empty()) {
            draft.params.insert("hostname".to_string(), hostname.clone());
        }
        match &spec.description {
            Some(description) if !description.is_empty() => {
                draft.params.insert("description".to_string(), description.clone());
            }
            _ => draft.unset.push("description".to_string()),
        }
        draft.params.insert("cores".to_string(), spec.cores.to_string());
        draft.params.insert("memory".to_string(), spec.memory.to_string());

        let create_only = [
            ("ostemplate", ostemplate.clone()),
            ("ostype", ostype.clone()),
            ("password", password.clone()),
            ("ssh-public-keys", ssh_public_keys.clone()),
            ("unprivileged", Some(flag(*unprivileged).to_string())),
        ];
        for (key, value) in create_only {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                draft.create_only.insert(key.to_string(), value);
            }
        }

        Ok(draft)
    }

    fn format_attachment(
        &self,
        slot: SlotKey,
        attachment: &Attachment,
    ) -> Result<String, EngineError> {
        match (slot.family(), attachment) {
            (SlotFamily::RootFs | SlotFamily::Mp, Attachment::Disk(disk)) => {
                format_volume(slot, disk)
            }
            (SlotFamily::Net, Attachment::Network(net)) => Ok(format_network(slot, net)),
            _ => Err(mismatch(slot, attachment)),
        }
    }

    fn from_remote(&self, config: &RemoteConfig, spec: &mut GuestSpec) -> Result<(), EngineError> {
        spec.name = remote_value(config, "hostname");
        spec.description = remote_value(config, "description");
        spec.cores = remote_number(config, "cores", 1)?;
        spec.memory = remote_number(config, "memory", default_memory(GuestKind::Lxc))?;

        // The platform does not report the template, password or keys back.
        let unprivileged = remote_flag(config, "unprivileged");
        let ostype = remote_value(config, "ostype");
        spec.extras = match std::mem::replace(&mut spec.extras, GuestExtras::lxc()) {
            GuestExtras::Lxc {
                ostemplate,
                password,
                ssh_public_keys,
                ..
            } => GuestExtras::Lxc {
                ostemplate,
                unprivileged,
                ostype,
                password,
                ssh_public_keys,
            },
            GuestExtras::Qemu { .. } => GuestExtras::Lxc {
                ostemplate: None,
                unprivileged,
                ostype,
                password: None,
                ssh_public_keys: None,
            },
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
                SlotFamily::RootFs | SlotFamily::Mp => parse_volume(slot, &prop)?,
                SlotFamily::Net => parse_network(slot, &prop)?,
                _ => continue,
            };
            attachments.insert(slot, attachment);
        }
        Ok(attachments)
    }
}

fn format_volume(slot: SlotKey, disk: &DiskAttachment) -> Result<String, EngineError> {
    let mut prop = match (&disk.volume, &disk.storage, disk.size) {
        (Some(volume), _, size) => {
            let mut prop = PropertyString::with_positional(volume.clone());
            prop.set_opt("size", size);
            prop
        }
        (None, Some(storage), Some(size)) => {
            PropertyString::with_positional(format!("{}:{}", storage, size.allocation_gib()))
        }
        _ => {
            return Err(EngineError::translation(format!(
                "volume {} has neither a volume nor storage and size",
                slot
            )))
        }
    };
    if slot.family() == SlotFamily::Mp {
        prop.set_opt("mp", disk.mount_path.as_ref());
    }
    Ok(prop.to_string())
}

fn format_network(slot: SlotKey, net: &NetworkAttachment) -> String {
    let name = net
        .name
        .clone()
        .unwrap_or_else(|| format!("eth{}", slot.index()));
    let mut prop = PropertyString::new();
    prop.set("name", name)
        .set("bridge", net.bridge.clone())
        .set_opt("ip", net.ip)
        .set_opt("gw", net.gateway)
        .set_opt("hwaddr", net.mac);
    prop.to_string()
}

fn parse_volume(slot: SlotKey, prop: &PropertyString) -> Result<Attachment, EngineError> {
    let volume = prop
        .positional()
        .or_else(|| prop.get("volume"))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::translation(format!("volume {} has no reference", slot)))?;
    let (storage, rest) = volume.split_once(':').unwrap_or((volume, ""));

    let size = match prop.get("size") {
        Some(raw) => Some(VolumeSize::from_platform(raw).ok_or_else(|| {
            EngineError::translation(format!("volume {} has unreadable size '{}'", slot, raw))
        })?),
        // Legacy `local-lvm:3` references carry the size in gigabytes.
        None => rest.parse::<u64>().ok().map(VolumeSize::from_gib),
    };

    Ok(Attachment::Disk(DiskAttachment {
        storage: Some(storage.to_string()),
        size,
        format: None,
        mount_path: prop.get("mp").map(str::to_string),
        volume: Some(volume.to_string()),
    }))
}

fn parse_network(slot: SlotKey, prop: &PropertyString) -> Result<Attachment, EngineError> {
    let bad = |what: &str, value: &str| {
        EngineError::translation(format!("interface {} has unreadable {} '{}'", slot, what, value))
    };

    let mut net = NetworkAttachment::default();
    for (key, value) in prop.entries() {
        match key {
            "name" => net.name = Some(value.to_string()),
            "bridge" => net.bridge = value.to_string(),
            "ip" => net.ip = Some(value.parse::<AddressAssignment>().map_err(|_| bad("ip", value))?),
            "gw" => net.gateway = Some(value.parse().map_err(|_| bad("gateway", value))?),
            "hwaddr" => net.mac = Some(value.parse().map_err(|_| bad("MAC", value))?),
            _ => {}
        }
    }
    Ok(Attachment::Network(net))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> GuestSpec {
        let mut spec = GuestSpec::new("pve", GuestKind::Lxc);
        spec.name = Some("ct1".to_string());
        spec.extras = GuestExtras::Lxc {
            ostemplate: Some("local:vztmpl/debian-12.tar.zst".to_string()),
            unprivileged: true,
            ostype: None,
            password: Some("hunter2".to_string()),
            ssh_public_keys: None,
        };
        spec
    }

    #[test]
    fn test_create_only_keys_are_separate() {
        let draft = LxcTranslator.to_remote(&container()).unwrap();
        assert_eq!(draft.params.get("hostname").map(String::as_str), Some("ct1"));
        assert!(!draft.params.contains_key("ostemplate"));
        assert_eq!(
            draft.create_only.get("ostemplate").map(String::as_str),
            Some("local:vztmpl/debian-12.tar.zst")
        );
        assert_eq!(draft.create_only.get("unprivileged").map(String::as_str), Some("1"));
        assert!(!draft.create_only.contains_key("ssh-public-keys"));
    }

    #[test]
    fn test_volume_formats() {
        let rootfs = Attachment::Disk(DiskAttachment::new("local-lvm", VolumeSize::from_mib(512)));
        assert_eq!(
            LxcTranslator.format_attachment(SlotKey::ROOTFS, &rootfs).unwrap(),
            "local-lvm:0.5"
        );

        let mp = Attachment::Disk(
            DiskAttachment::new("local-lvm", VolumeSize::from_gib(4)).with_mount_path("/data"),
        );
        assert_eq!(
            LxcTranslator
                .format_attachment(SlotKey::mp(0).unwrap(), &mp)
                .unwrap(),
            "local-lvm:4,mp=/data"
        );

        let existing = Attachment::Disk(DiskAttachment {
            volume: Some("local-lvm:vm-101-disk-0".to_string()),
            ..DiskAttachment::new("local-lvm", VolumeSize::from_gib(8))
        });
        assert_eq!(
            LxcTranslator
                .format_attachment(SlotKey::ROOTFS, &existing)
                .unwrap(),
            "local-lvm:vm-101-disk-0,size=8G"
        );
    }

    #[test]
    fn test_network_format() {
        let net = NetworkAttachment {
            ip: Some("10.0.0.5/24".parse().unwrap()),
            gateway: Some("10.0.0.1".parse().unwrap()),
            ..NetworkAttachment::bridged("vmbr0")
        };
        assert_eq!(
            LxcTranslator
                .format_attachment(SlotKey::net(1).unwrap(), &Attachment::Network(net))
                .unwrap(),
            "name=eth1,bridge=vmbr0,ip=10.0.0.5/24,gw=10.0.0.1"
        );
    }

    #[test]
    fn test_from_remote_keeps_untracked_fields() {
        let remote: RemoteConfig = [
            ("hostname", "ct1"),
            ("memory", "1024"),
            ("unprivileged", "1"),
            ("rootfs", "local-lvm:3"),
            ("mp0", "local-lvm:vm-101-disk-1,mp=/data,size=4G"),
            ("net0", "name=eth0,bridge=vmbr0,ip=dhcp,hwaddr=BC:24:11:00:00:02"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut spec = container();
        LxcTranslator.from_remote(&remote, &mut spec).unwrap();

        assert_eq!(spec.memory, 1024);
        let GuestExtras::Lxc {
            ostemplate,
            unprivileged,
            password,
            ..
        } = &spec.extras
        else {
            panic!("expected container extras");
        };
        assert!(*unprivileged);
        assert_eq!(ostemplate.as_deref(), Some("local:vztmpl/debian-12.tar.zst"));
        assert_eq!(password.as_deref(), Some("hunter2"));

        let rootfs = spec.attachments[&SlotKey::ROOTFS].as_disk().unwrap();
        assert_eq!(rootfs.size, Some(VolumeSize::from_gib(3)));
        assert_eq!(rootfs.storage.as_deref(), Some("local-lvm"));

        let mp = spec.attachments[&SlotKey::mp(0).unwrap()].as_disk().unwrap();
        assert_eq!(mp.mount_path.as_deref(), Some("/data"));
        assert_eq!(mp.size, Some(VolumeSize::from_gib(4)));

        let net = spec.primary_network().unwrap();
        assert_eq!(net.ip, Some(AddressAssignment::Dhcp));
        assert_eq!(net.name.as_deref(), Some("eth0"));
    }
}
