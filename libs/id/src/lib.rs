//! # pvx-id
//!
//! Identifier types shared by the pvx crates.
//!
//! ## Design Principles
//!
//! - Guest ids are numeric and assigned by the platform (or pinned by the user)
//! - Attachment slots are a closed set of positional keys, never free-form strings
//! - Every type has a canonical string form that round-trips through `FromStr`
//!
//! ## Formats
//!
//! - Guest ids: `100` .. `999999999`
//! - Slots: `virtio0`..`virtio15`, `ide0`..`ide3`, `net0`..`net31`,
//!   `mp0`..`mp255` and the container root slot `rootfs`

mod error;
mod slot;
mod types;

pub use error::IdError;
pub use slot::{SlotFamily, SlotKey};
pub use types::GuestId;
