//! Networking helpers for guest configuration.
//!
//! This library provides helpers for:
//! - IPv4 addresses in CIDR notation, as written into static interface config
//! - MAC addresses, as reported by the platform and by the guest agent
//! - Picking a usable address out of an agent interface report

use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

// ============================================================================
// IPv4 CIDR
// ============================================================================

/// An IPv4 host address together with its prefix length (`10.0.0.5/24`).
///
/// Unlike a network prefix the host bits are kept, since the platform expects
/// the interface address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    /// Interface address.
    pub address: Ipv4Addr,

    /// Prefix length (0..=32).
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    /// Create a new CIDR address.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "192.168.1.10/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = parse_ipv4(addr_str)?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address of the prefix.
    pub fn network(&self) -> Ipv4Addr {
        mask_ipv4(self.address, self.prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.network()
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// Parse a dotted-quad IPv4 address.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, NetworkError> {
    Ipv4Addr::from_str(s.trim()).map_err(|_| NetworkError::InvalidAddress(s.to_string()))
}

/// Reports whether an address can be handed to a remote peer.
///
/// Loopback, link-local, multicast, broadcast and the unspecified address
/// are rejected. Private ranges are accepted: guests on an internal bridge
/// are still reachable by the operator.
pub fn is_global_unicast_v4(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_broadcast())
}

/// Returns the first global unicast IPv4 address in `candidates`.
///
/// Entries that do not parse as IPv4 (IPv6 addresses, garbage) are skipped.
pub fn first_global_unicast_v4<'a, I>(candidates: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .filter_map(|s| Ipv4Addr::from_str(s.trim()).ok())
        .find(|addr| is_global_unicast_v4(*addr))
}

// ============================================================================
// MAC addresses
// ============================================================================

/// A 48-bit MAC address.
///
/// The platform writes MACs in upper case, the guest agent in lower case;
/// equality is on the bytes so both spellings compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Lower-case colon form, as reported by the guest agent.
    pub fn to_lowercase_string(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl FromStr for MacAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut octets = [0u8; 6];
        let mut parts = trimmed.split([':', '-']);

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetworkError::InvalidMac(s.to_string()))?;
            if part.len() != 2 {
                return Err(NetworkError::InvalidMac(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }

        Ok(Self(octets))
    }
}

/// Upper-case colon form, as written into platform configuration.
impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl serde::Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for Ipv4Cidr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_cidr(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_cidr() {
        let cidr = Ipv4Cidr::from_cidr("192.168.1.10/24").unwrap();
        assert_eq!(cidr.prefix_len, 24);
        assert_eq!(cidr.address, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(cidr.to_string(), "192.168.1.10/24");

        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn test_ipv4_cidr_errors() {
        assert!(matches!(
            Ipv4Cidr::from_cidr("10.0.0.1"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Ipv4Cidr::from_cidr("10.0.0.1/33"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Ipv4Cidr::from_cidr("10.0.0/8"),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(Ipv4Cidr::from_cidr("2001:db8::/32").is_err());
    }

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast_v4(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(is_global_unicast_v4(Ipv4Addr::new(8, 8, 8, 8)));

        assert!(!is_global_unicast_v4(Ipv4Addr::LOCALHOST));
        assert!(!is_global_unicast_v4(Ipv4Addr::UNSPECIFIED));
        assert!(!is_global_unicast_v4(Ipv4Addr::BROADCAST));
        assert!(!is_global_unicast_v4(Ipv4Addr::new(169, 254, 0, 1)));
        assert!(!is_global_unicast_v4(Ipv4Addr::new(224, 0, 0, 1)));
    }

    #[test]
    fn test_first_global_unicast_skips_unusable() {
        let found = first_global_unicast_v4(["fe80::1", "127.0.0.1", "169.254.3.3", "10.1.2.3"]);
        assert_eq!(found, Some(Ipv4Addr::new(10, 1, 2, 3)));

        assert_eq!(first_global_unicast_v4(["::1", "not-an-ip"]), None);
    }

    #[test]
    fn test_mac_parse_and_format() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        let upper: MacAddr = "AA:BB:CC:00:11:22".parse().unwrap();
        assert_eq!(mac, upper);
        assert_eq!(mac.to_string(), "AA:BB:CC:00:11:22");
        assert_eq!(mac.to_lowercase_string(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn test_mac_rejects_malformed() {
        assert!("aa:bb:cc:00:11".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:00:11:22:33".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:00:11:zz".parse::<MacAddr>().is_err());
        assert!("aabbcc001122".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_serde_string_forms() {
        let mac: MacAddr = serde_json::from_str("\"de:ad:be:ef:00:01\"").unwrap();
        assert_eq!(serde_json::to_string(&mac).unwrap(), "\"DE:AD:BE:EF:00:01\"");

        let cidr: Ipv4Cidr = serde_json::from_str("\"10.0.0.2/16\"").unwrap();
        assert_eq!(cidr.prefix_len, 16);
    }
}
