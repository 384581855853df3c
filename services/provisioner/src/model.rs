//! Desired and observed guest state.
//!
//! A [`GuestSpec`] is used both for what the operator wants and for what the
//! platform reports; fields marked computed are only ever filled by reads.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use pvx_id::{GuestId, SlotKey};
use pvx_networking::{Ipv4Cidr, MacAddr};
use pvx_reconcile::Attachable;
use serde::{Deserialize, Serialize};

use crate::api::{GuestKind, GuestRef, PowerState};

const KIB_PER_MIB: u64 = 1024;
const KIB_PER_GIB: u64 = 1024 * 1024;
const KIB_PER_TIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Volume size
// =============================================================================

/// Size of a storage volume, normalized to KiB.
///
/// Written as a number with an optional `K`, `M` or `G` suffix; bare numbers
/// are gigabytes, matching how the platform allocates new volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeSize(u64);

impl VolumeSize {
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * KIB_PER_MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * KIB_PER_GIB)
    }

    pub const fn kib(&self) -> u64 {
        self.0
    }

    /// Whole gigabytes, rounded down.
    pub const fn gib(&self) -> u64 {
        self.0 / KIB_PER_GIB
    }

    pub const fn is_whole_gib(&self) -> bool {
        self.0 % KIB_PER_GIB == 0
    }

    /// Size in gigabytes as the platform expects it when allocating a new
    /// volume (`local-lvm:30`, `local-lvm:0.5`).
    pub fn allocation_gib(&self) -> String {
        if self.is_whole_gib() {
            return self.gib().to_string();
        }
        let gib = self.0 as f64 / KIB_PER_GIB as f64;
        let formatted = format!("{:.3}", gib);
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }

    /// Parses a size reported by the platform (`30G`, `512M`, `1.5T`, `8`).
    pub fn from_platform(s: &str) -> Option<Self> {
        let s = s.trim();
        let (number, unit) = match s.char_indices().last()? {
            (i, c) if c.is_ascii_alphabetic() => (&s[..i], c.to_ascii_uppercase()),
            _ => (s, 'G'),
        };
        let multiplier = match unit {
            'K' => 1,
            'M' => KIB_PER_MIB,
            'G' => KIB_PER_GIB,
            'T' => KIB_PER_TIB,
            _ => return None,
        };
        if let Ok(whole) = number.parse::<u64>() {
            return whole.checked_mul(multiplier).map(Self);
        }
        let fractional: f64 = number.parse().ok()?;
        if !fractional.is_finite() || fractional < 0.0 {
            return None;
        }
        Some(Self((fractional * multiplier as f64).round() as u64))
    }
}

impl std::fmt::Display for VolumeSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 % KIB_PER_GIB == 0 {
            write!(f, "{}G", self.0 / KIB_PER_GIB)
        } else if self.0 % KIB_PER_MIB == 0 {
            write!(f, "{}M", self.0 / KIB_PER_MIB)
        } else {
            write!(f, "{}K", self.0)
        }
    }
}

impl std::str::FromStr for VolumeSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            format!(
                "invalid size '{}': must be numbers only, possibly ending in K, M or G",
                s
            )
        };
        let (digits, multiplier) = match s.chars().last() {
            Some('K') => (&s[..s.len() - 1], 1),
            Some('M') => (&s[..s.len() - 1], KIB_PER_MIB),
            Some('G') => (&s[..s.len() - 1], KIB_PER_GIB),
            Some(_) => (s, KIB_PER_GIB),
            None => return Err(invalid()),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        value.checked_mul(multiplier).map(Self).ok_or_else(invalid)
    }
}

impl Serialize for VolumeSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VolumeSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // VM disks are usually written as a bare number of gigabytes.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Gib(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Gib(gib) => Ok(VolumeSize::from_gib(gib)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Attachments
// =============================================================================

/// VM disk image format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Raw,
    Cow,
    Qcow,
    Qed,
    Qcow2,
    Vmdk,
    Cloop,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Cow => "cow",
            DiskFormat::Qcow => "qcow",
            DiskFormat::Qed => "qed",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Cloop => "cloop",
        }
    }
}

impl std::str::FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(DiskFormat::Raw),
            "cow" => Ok(DiskFormat::Cow),
            "qcow" => Ok(DiskFormat::Qcow),
            "qed" => Ok(DiskFormat::Qed),
            "qcow2" => Ok(DiskFormat::Qcow2),
            "vmdk" => Ok(DiskFormat::Vmdk),
            "cloop" => Ok(DiskFormat::Cloop),
            other => Err(format!("unknown disk format '{}'", other)),
        }
    }
}

/// A storage volume (VM disk, container root or mount point).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAttachment {
    /// Storage backend, e.g. `local-lvm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<VolumeSize>,

    /// VM disks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<DiskFormat>,

    /// Container mount points only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    /// Platform-assigned volume reference (computed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
}

impl DiskAttachment {
    pub fn new(storage: impl Into<String>, size: VolumeSize) -> Self {
        Self {
            storage: Some(storage.into()),
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn with_mount_path(mut self, path: impl Into<String>) -> Self {
        self.mount_path = Some(path.into());
        self
    }

    pub fn with_format(mut self, format: DiskFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// An ISO image in a VM's optical drive, `storage:file.iso`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpticalAttachment {
    pub storage: String,
    pub file: String,
}

impl OpticalAttachment {
    /// Volume id as the platform writes it: `local:iso/debian.iso`.
    pub fn volume_id(&self) -> String {
        format!("{}:iso/{}", self.storage, self.file)
    }
}

impl std::fmt::Display for OpticalAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.storage, self.file)
    }
}

impl std::str::FromStr for OpticalAttachment {
    type Err = String;

    /// Accepts both `local:debian.iso` and `local:iso/debian.iso`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (storage, file) = s
            .split_once(':')
            .ok_or_else(|| format!("ISO reference '{}' must have the form storage:file", s))?;
        let file = file.strip_prefix("iso/").unwrap_or(file);
        if storage.is_empty() || file.is_empty() {
            return Err(format!("ISO reference '{}' must have the form storage:file", s));
        }
        Ok(Self {
            storage: storage.to_string(),
            file: file.to_string(),
        })
    }
}

impl Serialize for OpticalAttachment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OpticalAttachment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a container interface gets its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressAssignment {
    Dhcp,
    Static(Ipv4Cidr),
}

impl std::fmt::Display for AddressAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressAssignment::Dhcp => f.write_str("dhcp"),
            AddressAssignment::Static(cidr) => write!(f, "{}", cidr),
        }
    }
}

impl std::str::FromStr for AddressAssignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "dhcp" {
            return Ok(AddressAssignment::Dhcp);
        }
        Ipv4Cidr::from_cidr(s).map(AddressAssignment::Static).map_err(|_| {
            format!(
                "ip '{}' must be an IPv4 address with netmask in CIDR notation or \"dhcp\"",
                s
            )
        })
    }
}

impl Serialize for AddressAssignment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressAssignment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Interface name inside a container (`eth0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// VM NIC model (`virtio`, `e1000`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Host bridge to attach to.
    pub bridge: String,

    /// Container address assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<AddressAssignment>,

    /// Container default gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,

    /// Hardware address; assigned by the platform when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
}

impl NetworkAttachment {
    pub fn bridged(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            ..Self::default()
        }
    }
}

/// One device in a guest slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    Disk(DiskAttachment),
    Optical { iso: OpticalAttachment },
    Network(NetworkAttachment),
}

impl Attachment {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Attachment::Disk(_) => "disk",
            Attachment::Optical { .. } => "optical",
            Attachment::Network(_) => "network",
        }
    }

    pub fn as_disk(&self) -> Option<&DiskAttachment> {
        match self {
            Attachment::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn as_network(&self) -> Option<&NetworkAttachment> {
        match self {
            Attachment::Network(net) => Some(net),
            _ => None,
        }
    }
}

impl Attachable for Attachment {
    fn volume(&self) -> Option<&str> {
        self.as_disk().and_then(|d| d.volume.as_deref())
    }

    fn storage(&self) -> Option<&str> {
        self.as_disk().and_then(|d| d.storage.as_deref())
    }

    fn size_kib(&self) -> Option<u64> {
        self.as_disk().and_then(|d| d.size).map(|s| s.kib())
    }

    fn is_storage(&self) -> bool {
        matches!(self, Attachment::Disk(_))
    }

    fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn inherit(&mut self, prev: &Self) {
        match (self, prev) {
            (Attachment::Disk(new), Attachment::Disk(old)) => {
                fill(&mut new.storage, &old.storage);
                fill(&mut new.size, &old.size);
                fill(&mut new.format, &old.format);
                fill(&mut new.mount_path, &old.mount_path);
                fill(&mut new.volume, &old.volume);
            }
            (Attachment::Network(new), Attachment::Network(old)) => {
                fill(&mut new.name, &old.name);
                fill(&mut new.model, &old.model);
                fill(&mut new.ip, &old.ip);
                fill(&mut new.gateway, &old.gateway);
                fill(&mut new.mac, &old.mac);
            }
            _ => {}
        }
    }

    fn needs_rewrite(&self, prev: &Self) -> bool {
        match (self, prev) {
            (Attachment::Disk(new), Attachment::Disk(old)) => new.mount_path != old.mount_path,
            (new, old) => new != old,
        }
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, prev: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(prev);
    }
}

// =============================================================================
// Guest spec
// =============================================================================

/// Source of a VM clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CloneSource {
    Id(GuestId),
    Name(String),
}

impl std::fmt::Display for CloneSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloneSource::Id(id) => write!(f, "{}", id),
            CloneSource::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for CloneSource {
    /// Numeric strings are ids, anything else a name.
    fn from(s: &str) -> Self {
        match s.parse::<GuestId>() {
            Ok(id) => CloneSource::Id(id),
            Err(_) => CloneSource::Name(s.to_string()),
        }
    }
}

impl Serialize for CloneSource {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CloneSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => GuestId::try_from(n)
                .map(CloneSource::Id)
                .map_err(serde::de::Error::custom),
            Raw::Text(s) => Ok(CloneSource::from(s.as_str())),
        }
    }
}

/// Settings that only exist for one kind of guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GuestExtras {
    Qemu {
        /// Guest agent enabled.
        #[serde(default)]
        agent: bool,

        #[serde(default = "default_one")]
        sockets: u32,
    },
    Lxc {
        /// Template or backup the container was created from.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ostemplate: Option<String>,

        #[serde(default)]
        unprivileged: bool,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        ostype: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,

        /// One key per line, OpenSSH format.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_public_keys: Option<String>,
    },
}

impl GuestExtras {
    pub fn qemu() -> Self {
        GuestExtras::Qemu {
            agent: false,
            sockets: 1,
        }
    }

    pub fn lxc() -> Self {
        GuestExtras::Lxc {
            ostemplate: None,
            unprivileged: false,
            ostype: None,
            password: None,
            ssh_public_keys: None,
        }
    }

    pub fn kind(&self) -> GuestKind {
        match self {
            GuestExtras::Qemu { .. } => GuestKind::Qemu,
            GuestExtras::Lxc { .. } => GuestKind::Lxc,
        }
    }
}

fn default_one() -> u32 {
    1
}

/// Memory in MB the platform gives a guest that does not set it.
pub(crate) fn default_memory(kind: GuestKind) -> u32 {
    match kind {
        GuestKind::Qemu => 16,
        GuestKind::Lxc => 512,
    }
}

/// Declarative description of one guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestSpec {
    /// Cluster node the guest lives on.
    pub node: String,

    /// Explicit id; resolved id after create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<GuestId>,

    /// VM name or container hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub cores: u32,

    /// Memory in MB; defaults by guest kind.
    pub memory: u32,

    /// Desired power state; observed power state after reads.
    pub status: PowerState,

    /// VM to clone from. Not tracked by the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneSource>,

    pub attachments: BTreeMap<SlotKey, Attachment>,

    pub extras: GuestExtras,

    /// Address reported by the guest agent (computed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<Ipv4Addr>,
}

impl<'de> Deserialize<'de> for GuestSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            node: String,
            #[serde(default)]
            vmid: Option<GuestId>,
            #[serde(default)]
            name: Option<String>,
            #[serde(default)]
            description: Option<String>,
            #[serde(default = "default_one")]
            cores: u32,
            #[serde(default)]
            memory: Option<u32>,
            #[serde(default)]
            status: PowerState,
            #[serde(default)]
            clone: Option<CloneSource>,
            #[serde(default)]
            attachments: BTreeMap<SlotKey, Attachment>,
            extras: GuestExtras,
            #[serde(default)]
            ipv4_address: Option<Ipv4Addr>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let kind = raw.extras.kind();
        Ok(GuestSpec {
            node: raw.node,
            vmid: raw.vmid,
            name: raw.name,
            description: raw.description,
            cores: raw.cores,
            memory: raw.memory.unwrap_or_else(|| default_memory(kind)),
            status: raw.status,
            clone: raw.clone,
            attachments: raw.attachments,
            extras: raw.extras,
            ipv4_address: raw.ipv4_address,
        })
    }
}

impl GuestSpec {
    /// A spec with defaults for the given kind.
    pub fn new(node: impl Into<String>, kind: GuestKind) -> Self {
        Self {
            node: node.into(),
            vmid: None,
            name: None,
            description: None,
            cores: 1,
            memory: default_memory(kind),
            status: PowerState::Running,
            clone: None,
            attachments: BTreeMap::new(),
            extras: match kind {
                GuestKind::Qemu => GuestExtras::qemu(),
                GuestKind::Lxc => GuestExtras::lxc(),
            },
            ipv4_address: None,
        }
    }

    pub fn kind(&self) -> GuestKind {
        self.extras.kind()
    }

    pub fn with_vmid(mut self, vmid: GuestId) -> Self {
        self.vmid = Some(vmid);
        self
    }

    pub fn with_attachment(mut self, slot: SlotKey, attachment: Attachment) -> Self {
        self.attachments.insert(slot, attachment);
        self
    }

    /// Primary network interface (`net0`).
    pub fn primary_network(&self) -> Option<&NetworkAttachment> {
        self.attachments
            .get(&SlotKey::PRIMARY_NET)
            .and_then(Attachment::as_network)
    }

    /// Guest agent toggle (always false for containers).
    pub fn agent_enabled(&self) -> bool {
        matches!(self.extras, GuestExtras::Qemu { agent: true, .. })
    }
}

/// The host-side belief about one guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedGuest {
    pub vmid: GuestId,
    pub kind: GuestKind,
    pub spec: GuestSpec,
    pub refreshed_at: DateTime<Utc>,
}

impl TrackedGuest {
    pub fn new(vmid: GuestId, spec: GuestSpec) -> Self {
        Self {
            vmid,
            kind: spec.kind(),
            spec,
            refreshed_at: Utc::now(),
        }
    }

    pub fn guest_ref(&self) -> GuestRef {
        GuestRef::new(self.spec.node.clone(), self.vmid, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_size_parse() {
        assert_eq!("30".parse::<VolumeSize>().unwrap(), VolumeSize::from_gib(30));
        assert_eq!("30G".parse::<VolumeSize>().unwrap(), VolumeSize::from_gib(30));
        assert_eq!("512M".parse::<VolumeSize>().unwrap(), VolumeSize::from_mib(512));
        assert_eq!("1024K".parse::<VolumeSize>().unwrap(), VolumeSize::from_mib(1));

        assert!("".parse::<VolumeSize>().is_err());
        assert!("G".parse::<VolumeSize>().is_err());
        assert!("1.5G".parse::<VolumeSize>().is_err());
        assert!("30T".parse::<VolumeSize>().is_err());
    }

    #[test]
    fn test_volume_size_equality_is_by_kib() {
        assert_eq!(
            "1G".parse::<VolumeSize>().unwrap(),
            "1024M".parse::<VolumeSize>().unwrap()
        );
    }

    #[test]
    fn test_volume_size_display_uses_largest_exact_unit() {
        assert_eq!(VolumeSize::from_gib(30).to_string(), "30G");
        assert_eq!(VolumeSize::from_mib(1536).to_string(), "1536M");
        assert_eq!(VolumeSize::from_kib(100).to_string(), "100K");
    }

    #[test]
    fn test_volume_size_from_platform() {
        assert_eq!(VolumeSize::from_platform("30G"), Some(VolumeSize::from_gib(30)));
        assert_eq!(VolumeSize::from_platform("1T"), Some(VolumeSize::from_gib(1024)));
        assert_eq!(VolumeSize::from_platform("1.5G"), Some(VolumeSize::from_mib(1536)));
        assert_eq!(VolumeSize::from_platform("3"), Some(VolumeSize::from_gib(3)));
        assert_eq!(VolumeSize::from_platform("abc"), None);
    }

    #[test]
    fn test_allocation_gib() {
        assert_eq!(VolumeSize::from_gib(30).allocation_gib(), "30");
        assert_eq!(VolumeSize::from_mib(512).allocation_gib(), "0.5");
    }

    #[test]
    fn test_volume_size_json_accepts_number() {
        let size: VolumeSize = serde_json::from_str("30").unwrap();
        assert_eq!(size, VolumeSize::from_gib(30));
        assert_eq!(serde_json::to_string(&size).unwrap(), "\"30G\"");
    }

    #[test]
    fn test_optical_strips_iso_prefix() {
        let iso: OpticalAttachment = "local:iso/debian.iso".parse().unwrap();
        assert_eq!(iso.to_string(), "local:debian.iso");
        assert_eq!(iso.volume_id(), "local:iso/debian.iso");
        assert!("debian.iso".parse::<OpticalAttachment>().is_err());
    }

    #[test]
    fn test_address_assignment() {
        assert_eq!("dhcp".parse::<AddressAssignment>().unwrap(), AddressAssignment::Dhcp);
        assert!(matches!(
            "10.0.0.5/24".parse::<AddressAssignment>().unwrap(),
            AddressAssignment::Static(_)
        ));
        assert!("10.0.0.5".parse::<AddressAssignment>().is_err());
    }

    #[test]
    fn test_clone_source_parsing() {
        assert_eq!(
            CloneSource::from("200"),
            CloneSource::Id(GuestId::new(200).unwrap())
        );
        assert_eq!(
            CloneSource::from("debian-template"),
            CloneSource::Name("debian-template".to_string())
        );
        let from_json: CloneSource = serde_json::from_str("200").unwrap();
        assert_eq!(from_json, CloneSource::Id(GuestId::new(200).unwrap()));
    }

    #[test]
    fn test_attachment_inherits_unset_fields() {
        let prev = Attachment::Disk(DiskAttachment {
            volume: Some("local-lvm:vm-100-disk-0".to_string()),
            format: Some(DiskFormat::Raw),
            ..DiskAttachment::new("local-lvm", VolumeSize::from_gib(30))
        });
        let mut desired = Attachment::Disk(DiskAttachment::new("fast", VolumeSize::from_gib(40)));
        desired.inherit(&prev);

        assert_eq!(desired.volume(), Some("local-lvm:vm-100-disk-0"));
        assert_eq!(desired.storage(), Some("fast"));
        assert_eq!(desired.size_kib(), Some(40 * 1024 * 1024));
        assert!(!desired.needs_rewrite(&prev));
    }

    #[test]
    fn test_spec_json_defaults() {
        let spec: GuestSpec = serde_json::from_str(
            r#"{
                "node": "pve",
                "extras": {"kind": "qemu"},
                "attachments": {
                    "virtio0": {"type": "disk", "storage": "local-lvm", "size": 30},
                    "net0": {"type": "network", "bridge": "vmbr0"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(spec.kind(), GuestKind::Qemu);
        assert_eq!(spec.memory, 16);
        assert_eq!(spec.cores, 1);
        assert_eq!(spec.status, PowerState::Running);
        assert_eq!(spec.extras, GuestExtras::qemu());
        assert_eq!(spec.attachments.len(), 2);
        assert_eq!(spec.primary_network().unwrap().bridge, "vmbr0");
    }

    #[test]
    fn test_memory_default_follows_kind() {
        let spec: GuestSpec = serde_json::from_str(
            r#"{"node": "pve", "extras": {"kind": "lxc", "ostemplate": "local:vztmpl/a.tar.zst"}}"#,
        )
        .unwrap();
        assert_eq!(spec.memory, 512);
        assert_eq!(GuestSpec::new("pve", GuestKind::Lxc).memory, 512);
        assert_eq!(GuestSpec::new("pve", GuestKind::Qemu).memory, 16);

        let spec: GuestSpec = serde_json::from_str(
            r#"{"node": "pve", "memory": 256, "extras": {"kind": "lxc"}}"#,
        )
        .unwrap();
        assert_eq!(spec.memory, 256);
    }

    #[test]
    fn test_primary_network_is_net0() {
        let spec = GuestSpec::new("pve", GuestKind::Qemu).with_attachment(
            SlotKey::net(1).unwrap(),
            Attachment::Network(NetworkAttachment::bridged("vmbr1")),
        );
        assert!(spec.primary_network().is_none());
    }
}
