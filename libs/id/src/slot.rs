//! Attachment slot keys.
//!
//! A slot is the positional name under which the platform stores a device in a
//! guest's configuration (`virtio0`, `net0`, `rootfs`, ...). Slots are the keys
//! of every attachment collection the engine diffs.

use crate::IdError;

/// Device family a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotFamily {
    /// VM VirtIO block device.
    Virtio,
    /// VM IDE device (optical media).
    Ide,
    /// Network interface (VMs and containers).
    Net,
    /// Container mount point volume.
    Mp,
    /// Container root filesystem.
    RootFs,
}

impl SlotFamily {
    /// Configuration key prefix used by the platform.
    pub const fn prefix(&self) -> &'static str {
        match self {
            SlotFamily::Virtio => "virtio",
            SlotFamily::Ide => "ide",
            SlotFamily::Net => "net",
            SlotFamily::Mp => "mp",
            SlotFamily::RootFs => "rootfs",
        }
    }

    /// Number of indexed slots in the family (`None` for unindexed slots).
    pub const fn capacity(&self) -> Option<u16> {
        match self {
            SlotFamily::Virtio => Some(16),
            SlotFamily::Ide => Some(4),
            SlotFamily::Net => Some(32),
            SlotFamily::Mp => Some(256),
            SlotFamily::RootFs => None,
        }
    }

    /// True for families that hold storage volumes.
    pub const fn is_storage(&self) -> bool {
        matches!(self, SlotFamily::Virtio | SlotFamily::Mp | SlotFamily::RootFs)
    }
}

/// Positional key of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    family: SlotFamily,
    index: u16,
}

impl SlotKey {
    /// The container root filesystem slot.
    pub const ROOTFS: Self = Self {
        family: SlotFamily::RootFs,
        index: 0,
    };

    /// `net0`, the interface the guest agent is asked about.
    pub const PRIMARY_NET: Self = Self {
        family: SlotFamily::Net,
        index: 0,
    };

    /// Creates an indexed slot, checking the family's capacity.
    pub fn new(family: SlotFamily, index: u16) -> Result<Self, IdError> {
        match family.capacity() {
            None if index == 0 => Ok(Self { family, index }),
            None => Err(IdError::InvalidSlotIndex {
                slot: family.prefix().to_string(),
                message: "slot takes no index".to_string(),
            }),
            Some(cap) if index < cap => Ok(Self { family, index }),
            Some(cap) => Err(IdError::InvalidSlotIndex {
                slot: format!("{}{}", family.prefix(), index),
                message: format!("index must be below {}", cap),
            }),
        }
    }

    /// `virtioN`
    pub fn virtio(index: u16) -> Result<Self, IdError> {
        Self::new(SlotFamily::Virtio, index)
    }

    /// `ideN`
    pub fn ide(index: u16) -> Result<Self, IdError> {
        Self::new(SlotFamily::Ide, index)
    }

    /// `netN`
    pub fn net(index: u16) -> Result<Self, IdError> {
        Self::new(SlotFamily::Net, index)
    }

    /// `mpN`
    pub fn mp(index: u16) -> Result<Self, IdError> {
        Self::new(SlotFamily::Mp, index)
    }

    pub const fn family(&self) -> SlotFamily {
        self.family
    }

    pub const fn index(&self) -> u16 {
        self.index
    }

    /// True for the container root slot, which may never be deleted.
    pub const fn is_root(&self) -> bool {
        matches!(self.family, SlotFamily::RootFs)
    }

    /// Enumerates every slot of a family in index order.
    pub fn all(family: SlotFamily) -> impl Iterator<Item = SlotKey> {
        let count = family.capacity().unwrap_or(1);
        (0..count).map(move |index| SlotKey { family, index })
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.family.capacity() {
            None => f.write_str(self.family.prefix()),
            Some(_) => write!(f, "{}{}", self.family.prefix(), self.index),
        }
    }
}

impl std::str::FromStr for SlotKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s == SlotFamily::RootFs.prefix() {
            return Ok(Self::ROOTFS);
        }

        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| IdError::InvalidSlotIndex {
                slot: s.to_string(),
                message: "missing index".to_string(),
            })?;
        let (prefix, digits) = s.split_at(split);

        let family = match prefix {
            "virtio" => SlotFamily::Virtio,
            "ide" => SlotFamily::Ide,
            "net" => SlotFamily::Net,
            "mp" => SlotFamily::Mp,
            _ => return Err(IdError::UnknownSlotFamily(s.to_string())),
        };

        // Reject "virtio01" so every slot has exactly one spelling.
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(IdError::InvalidSlotIndex {
                slot: s.to_string(),
                message: "leading zero".to_string(),
            });
        }

        let index: u16 = digits.parse().map_err(|_| IdError::InvalidSlotIndex {
            slot: s.to_string(),
            message: "not a number".to_string(),
        })?;

        Self::new(family, index)
    }
}

impl serde::Serialize for SlotKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for SlotKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_display() {
        assert_eq!(SlotKey::virtio(3).unwrap().to_string(), "virtio3");
        assert_eq!(SlotKey::ide(2).unwrap().to_string(), "ide2");
        assert_eq!(SlotKey::net(0).unwrap().to_string(), "net0");
        assert_eq!(SlotKey::mp(12).unwrap().to_string(), "mp12");
        assert_eq!(SlotKey::ROOTFS.to_string(), "rootfs");
        assert_eq!(SlotKey::PRIMARY_NET, SlotKey::net(0).unwrap());
    }

    #[test]
    fn test_slot_parse() {
        assert_eq!("virtio15".parse::<SlotKey>().unwrap(), SlotKey::virtio(15).unwrap());
        assert_eq!("rootfs".parse::<SlotKey>().unwrap(), SlotKey::ROOTFS);
        assert!("rootfs".parse::<SlotKey>().unwrap().is_root());
    }

    #[test]
    fn test_slot_capacity_enforced() {
        assert!(SlotKey::virtio(16).is_err());
        assert!(SlotKey::ide(4).is_err());
        assert!("virtio16".parse::<SlotKey>().unwrap_err().is_slot_error());
        assert!(SlotKey::new(SlotFamily::RootFs, 1).is_err());
    }

    #[test]
    fn test_slot_parse_rejects_malformed() {
        assert!(matches!(
            "scsi0".parse::<SlotKey>().unwrap_err(),
            IdError::UnknownSlotFamily(_)
        ));
        assert!("virtio".parse::<SlotKey>().is_err());
        assert!("virtio01".parse::<SlotKey>().is_err());
        assert!("net0x".parse::<SlotKey>().is_err());
        assert!("".parse::<SlotKey>().unwrap_err().is_empty());
    }

    #[test]
    fn test_slot_ordering_groups_families() {
        let mut slots = vec![
            SlotKey::net(0).unwrap(),
            SlotKey::virtio(1).unwrap(),
            SlotKey::virtio(0).unwrap(),
        ];
        slots.sort();
        assert_eq!(slots[0], SlotKey::virtio(0).unwrap());
        assert_eq!(slots[2], SlotKey::net(0).unwrap());
    }

    #[test]
    fn test_slot_all() {
        assert_eq!(SlotKey::all(SlotFamily::Virtio).count(), 16);
        assert_eq!(
            SlotKey::all(SlotFamily::RootFs).collect::<Vec<_>>(),
            vec![SlotKey::ROOTFS]
        );
    }

    #[test]
    fn test_slot_json_as_string() {
        let json = serde_json::to_string(&SlotKey::mp(1).unwrap()).unwrap();
        assert_eq!(json, "\"mp1\"");
        let parsed: SlotKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SlotKey::mp(1).unwrap());
    }

    proptest::proptest! {
        #[test]
        fn prop_slot_string_form_is_canonical(family in 0usize..4, index in 0u16..256) {
            let family = [SlotFamily::Virtio, SlotFamily::Ide, SlotFamily::Net, SlotFamily::Mp][family];
            if let Ok(slot) = SlotKey::new(family, index) {
                let parsed: SlotKey = slot.to_string().parse().unwrap();
                proptest::prop_assert_eq!(parsed, slot);
            }
        }
    }
}
