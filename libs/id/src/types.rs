//! Guest identifier.
//!
//! The platform identifies every VM and container by a cluster-unique integer.
//! Ids below 100 are reserved by the platform.

use crate::IdError;

// =============================================================================
// Guest ID
// =============================================================================

/// Cluster-unique numeric id of a VM or container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestId(u32);

impl GuestId {
    /// Lowest id the platform hands out.
    pub const MIN: u32 = 100;

    /// Highest id the platform accepts.
    pub const MAX: u32 = 999_999_999;

    /// The first id the platform allocates from.
    pub const FIRST: Self = Self(Self::MIN);

    /// Creates a guest id, validating the platform's range.
    pub fn new(id: u32) -> Result<Self, IdError> {
        Self::check(u64::from(id))
    }

    /// Returns the underlying integer.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns the following id, saturating at [`GuestId::MAX`].
    #[must_use]
    pub const fn next(&self) -> Self {
        if self.0 >= Self::MAX {
            Self(Self::MAX)
        } else {
            Self(self.0 + 1)
        }
    }

    fn check(value: u64) -> Result<Self, IdError> {
        if value < u64::from(Self::MIN) || value > u64::from(Self::MAX) {
            return Err(IdError::OutOfRange {
                value,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(value as u32))
    }
}

impl std::fmt::Display for GuestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GuestId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let value: u64 = s.parse().map_err(|_| IdError::NotNumeric(s.to_string()))?;
        Self::check(value)
    }
}

impl TryFrom<u32> for GuestId {
    type Error = IdError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl TryFrom<u64> for GuestId {
    type Error = IdError;

    fn try_from(id: u64) -> Result<Self, Self::Error> {
        Self::check(id)
    }
}

impl From<GuestId> for u32 {
    fn from(id: GuestId) -> Self {
        id.0
    }
}

impl serde::Serialize for GuestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for GuestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // The platform reports ids both as numbers and as strings.
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self::check(n).map_err(serde::de::Error::custom),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
