//! Platform API boundary.
//!
//! Everything the engine needs from the virtualization platform goes through
//! the [`PlatformApi`] trait:
//! - Guest directory and id allocation
//! - Create, clone and delete
//! - Configuration reads and writes, pending-change queries
//! - Power control
//! - Volume moves and resizes
//! - Guest agent network reports
//!
//! [`crate::client::PveClient`] implements it over HTTP and
//! [`crate::mock::MockPlatform`] in memory.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use pvx_id::{GuestId, SlotKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat key -> value configuration map as returned by the platform.
pub type RemoteConfig = BTreeMap<String, String>;

// =============================================================================
// Guest identity
// =============================================================================

/// Kind of guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    /// Full virtual machine.
    Qemu,
    /// Container.
    Lxc,
}

impl GuestKind {
    /// Path segment used by the platform API.
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

impl std::fmt::Display for GuestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GuestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(GuestKind::Qemu),
            "lxc" => Ok(GuestKind::Lxc),
            other => Err(format!("unknown guest type '{}'", other)),
        }
    }
}

/// Address of one guest on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestRef {
    pub node: String,
    pub vmid: GuestId,
    pub kind: GuestKind,
}

impl GuestRef {
    pub fn new(node: impl Into<String>, vmid: GuestId, kind: GuestKind) -> Self {
        Self {
            node: node.into(),
            vmid,
            kind,
        }
    }

    /// API path prefix for the guest, e.g. `/nodes/pve/qemu/100`.
    pub fn path(&self) -> String {
        format!("/nodes/{}/{}/{}", self.node, self.kind, self.vmid)
    }
}

impl std::fmt::Display for GuestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.kind, self.vmid)
    }
}

/// Observed power state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    #[default]
    Running,
    Stopped,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(PowerState::Running),
            "stopped" => Ok(PowerState::Stopped),
            other => Err(format!("unknown power state '{}'", other)),
        }
    }
}

/// One entry of the cluster guest directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSummary {
    pub vmid: GuestId,
    pub node: String,
    pub kind: GuestKind,
    pub name: Option<String>,
    pub status: Option<PowerState>,
    pub template: bool,
}

impl GuestSummary {
    pub fn guest_ref(&self) -> GuestRef {
        GuestRef::new(self.node.clone(), self.vmid, self.kind)
    }
}

/// Network interface as reported by the guest agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInterface {
    pub name: String,
    pub hardware_address: Option<String>,
    pub ip_addresses: Vec<String>,
}

// =============================================================================
// Requests
// =============================================================================

/// A configuration write: keys to set and keys to delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub params: BTreeMap<String, String>,
    pub delete: Vec<String>,
}

impl ConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.delete.contains(&key) {
            self.delete.push(key);
        }
        self
    }

    /// Adds every entry of `params`.
    pub fn extend(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.delete.is_empty()
    }

    /// The platform's `delete` parameter value.
    pub fn delete_list(&self) -> Option<String> {
        if self.delete.is_empty() {
            None
        } else {
            Some(self.delete.join(","))
        }
    }
}

/// Parameters of a clone call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub target: GuestId,
    /// Node the clone is placed on.
    pub node: String,
    pub name: Option<String>,
    /// Full copy instead of a linked clone.
    pub full: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by the platform or while talking to it.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The requested guest id is already taken.
    #[error("{message}")]
    AlreadyExists { message: String },

    /// The guest agent is not (yet) running inside the guest.
    #[error("{message}")]
    AgentNotRunning { message: String },

    /// The addressed object does not exist.
    #[error("{message}")]
    NotFound { message: String },

    /// Any other non-success HTTP response.
    #[error("{status} {message}")]
    Status { status: u16, message: String },

    /// A platform task finished with a non-OK exit status.
    #[error("task {upid} failed: {exit_status}")]
    Task { upid: String, exit_status: String },

    /// A platform task did not finish in time.
    #[error("task {upid} did not finish within {waited:?}")]
    TaskTimeout { upid: String, waited: Duration },

    /// The API token lacks required privileges.
    #[error("API token is missing permissions: {}", missing.join(", "))]
    MissingPermissions { missing: Vec<String> },

    /// The response body could not be decoded.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PlatformError {
    /// Classifies an error message returned by the platform.
    ///
    /// The platform reports most failures as HTTP 500 with a free-text
    /// message, so collisions and agent state are recognised by wording.
    pub fn from_response(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("already exists") {
            PlatformError::AlreadyExists {
                message: format!("{} {}", status, message),
            }
        } else if lower.contains("guest agent is not running") {
            PlatformError::AgentNotRunning {
                message: format!("{} {}", status, message),
            }
        } else if lower.contains("does not exist") || status == 404 {
            PlatformError::NotFound { message }
        } else {
            PlatformError::Status { status, message }
        }
    }

    /// Classifies the exit status of a finished task.
    pub fn from_task(upid: impl Into<String>, exit_status: impl Into<String>) -> Self {
        let exit_status = exit_status.into();
        if exit_status.to_ascii_lowercase().contains("already exists") {
            PlatformError::AlreadyExists {
                message: exit_status,
            }
        } else {
            PlatformError::Task {
                upid: upid.into(),
                exit_status,
            }
        }
    }

    /// Returns true if the failure is a guest id collision.
    pub fn is_id_collision(&self) -> bool {
        matches!(self, PlatformError::AlreadyExists { .. })
    }

    /// Returns true if the guest agent is not running yet.
    pub fn is_agent_not_running(&self) -> bool {
        matches!(self, PlatformError::AgentNotRunning { .. })
    }
}

// =============================================================================
// Trait
// =============================================================================

/// Operations the engine performs against the platform.
///
/// Every mutating call returns once the platform has finished the work,
/// i.e. implementations wait for any task the platform spawns.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Next free guest id.
    async fn next_id(&self) -> Result<GuestId, PlatformError>;

    /// All guests in the cluster.
    async fn list_guests(&self) -> Result<Vec<GuestSummary>, PlatformError>;

    /// Create a guest with the given configuration.
    async fn create_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: GuestId,
        params: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError>;

    /// Clone `source` into a new guest.
    async fn clone_guest(
        &self,
        source: &GuestRef,
        request: &CloneRequest,
    ) -> Result<(), PlatformError>;

    /// Current configuration, with pending values applied.
    async fn guest_config(&self, guest: &GuestRef) -> Result<RemoteConfig, PlatformError>;

    /// Write configuration keys.
    async fn update_config(&self, guest: &GuestRef, update: &ConfigUpdate)
        -> Result<(), PlatformError>;

    /// Returns true if configuration changes wait for a restart.
    async fn has_pending_changes(&self, guest: &GuestRef) -> Result<bool, PlatformError>;

    /// Current power state.
    async fn power_state(&self, guest: &GuestRef) -> Result<PowerState, PlatformError>;

    async fn start(&self, guest: &GuestRef) -> Result<(), PlatformError>;

    async fn stop(&self, guest: &GuestRef) -> Result<(), PlatformError>;

    async fn reboot(&self, guest: &GuestRef) -> Result<(), PlatformError>;

    /// Move the volume in `slot` to another storage backend.
    async fn move_volume(
        &self,
        guest: &GuestRef,
        slot: SlotKey,
        storage: &str,
    ) -> Result<(), PlatformError>;

    /// Resize the volume in `slot`. `size` uses platform syntax (`30G`).
    async fn resize_volume(
        &self,
        guest: &GuestRef,
        slot: SlotKey,
        size: &str,
    ) -> Result<(), PlatformError>;

    /// Destroy the guest and its volumes.
    async fn delete_guest(&self, guest: &GuestRef) -> Result<(), PlatformError>;

    /// Network interfaces reported by the guest agent.
    async fn agent_interfaces(&self, guest: &GuestRef)
        -> Result<Vec<AgentInterface>, PlatformError>;
}
