//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is not a number.
    #[error("invalid guest ID '{0}': not a number")]
    NotNumeric(String),

    /// The guest ID is outside the range the platform accepts.
    #[error("guest ID {value} out of range ({min}..={max})")]
    OutOfRange { value: u64, min: u32, max: u32 },

    /// The slot name does not start with a known device family.
    #[error("unknown slot family in '{0}'")]
    UnknownSlotFamily(String),

    /// The slot index is missing, malformed or beyond the family's limit.
    #[error("invalid slot index in '{slot}': {message}")]
    InvalidSlotIndex { slot: String, message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from parsing a slot key.
    pub fn is_slot_error(&self) -> bool {
        matches!(
            self,
            IdError::UnknownSlotFamily(_) | IdError::InvalidSlotIndex { .. }
        )
    }
}
