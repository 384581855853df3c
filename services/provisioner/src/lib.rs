//! pvx Provisioner Library
//!
//! Reconciles declarative guest specs (virtual machines and containers)
//! against a Proxmox VE cluster. Live platform state always wins: every
//! operation ends by reading back what the platform actually holds.
//!
//! ## Architecture
//!
//! ```text
//! Engine (lifecycle)
//! ├── IdAllocator        (explicit or next free id)
//! ├── Translator         (spec <-> flat remote config, per guest kind)
//! ├── apply_config       (attachment plan execution)
//! ├── StateReader        (config / status / agent address reads)
//! │   └── wait_for_ipv4  (guest agent poller task)
//! └── drift              (carry-over and field diffs)
//! ```
//!
//! Every component talks to the platform through [`PlatformApi`], backed by
//! [`PveClient`] over HTTP or [`MockPlatform`] in memory.
//!
//! ## Modules
//!
//! - `api`: Platform boundary, request and error types
//! - `model`: Guest specs and attachments
//! - `translate`: Remote configuration codecs
//! - `lifecycle`: Create, read, update, delete

pub mod allocator;
pub mod api;
pub mod attachments;
pub mod client;
pub mod config;
pub mod drift;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod model;
pub mod poller;
pub mod state;
pub mod translate;
pub mod validate;

// Re-export commonly used types
pub use api::{GuestKind, GuestRef, PlatformApi, PlatformError, PowerState};
pub use client::PveClient;
pub use config::{EngineConfig, ProviderConfig};
pub use drift::{FieldDrift, ReadOutcome};
pub use error::EngineError;
pub use lifecycle::Engine;
pub use mock::MockPlatform;
pub use model::{Attachment, GuestSpec, TrackedGuest};
pub use state::StateMask;
