//! HTTP client for the Proxmox VE API.
//!
//! Implements [`PlatformApi`] over `/api2/json`:
//! - Token authentication through a default `Authorization` header
//! - `{"data": ...}` envelope decoding
//! - Waiting on the task (UPID) that long-running calls return

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use pvx_id::{GuestId, SlotKey};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use crate::api::{
    AgentInterface, CloneRequest, ConfigUpdate, GuestKind, GuestRef, GuestSummary, PlatformApi,
    PlatformError, PowerState, RemoteConfig,
};
use crate::config::ClientConfig;

/// Interval between task status polls.
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Privileges the engine needs on `/`.
pub const REQUIRED_PERMISSIONS: &[&str] = &[
    "Datastore.AllocateSpace",
    "Datastore.Audit",
    "Pool.Allocate",
    "Sys.Audit",
    "Sys.Console",
    "Sys.Modify",
    "VM.Allocate",
    "VM.Audit",
    "VM.Clone",
    "VM.Config.CDROM",
    "VM.Config.Cloudinit",
    "VM.Config.CPU",
    "VM.Config.Disk",
    "VM.Config.HWType",
    "VM.Config.Memory",
    "VM.Config.Network",
    "VM.Config.Options",
    "VM.Migrate",
    "VM.Monitor",
    "VM.PowerMgmt",
];

/// Proxmox VE API client.
pub struct PveClient {
    client: reqwest::Client,
    base_url: Url,
    task_timeout: Duration,
    debug: bool,
}

impl PveClient {
    /// Create a client without contacting the platform.
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!(
            "PVEAPIToken={}={}",
            config.token_id, config.token_secret
        ))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        for (name, value) in &config.http_headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.tls_insecure)
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(&config.api_url)?,
            task_timeout: config.timeout,
            debug: config.debug,
        })
    }

    /// Create a client and verify the API is reachable and the token holds
    /// every privilege in [`REQUIRED_PERMISSIONS`].
    pub async fn connect(config: &ClientConfig) -> anyhow::Result<Self> {
        let client = Self::new(config)?;
        let version = client.version().await?;
        info!(version = %version, url = %client.base_url, "connected to platform");
        client.check_permissions().await?;
        Ok(client)
    }

    /// Platform release, e.g. `8.2.4`.
    pub async fn version(&self) -> Result<String, PlatformError> {
        #[derive(Deserialize)]
        struct Version {
            version: String,
        }

        let version: Version = self.get(&["version"], &[]).await?;
        Ok(version.version)
    }

    /// Fails with [`PlatformError::MissingPermissions`] listing every
    /// required privilege the token lacks on `/`.
    pub async fn check_permissions(&self) -> Result<(), PlatformError> {
        let granted: BTreeMap<String, BTreeMap<String, Value>> =
            self.get(&["access", "permissions"], &[("path", "/")]).await?;
        let root = granted.get("/");
        let missing: Vec<String> = REQUIRED_PERMISSIONS
            .iter()
            .filter(|perm| root.map_or(true, |privs| !privs.contains_key(**perm)))
            .map(|perm| perm.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            error!(missing = ?missing, "API token is missing permissions");
            Err(PlatformError::MissingPermissions { missing })
        }
    }

    // =========================================================================
    // Transport
    // =========================================================================

    fn url(&self, segments: &[&str]) -> Result<Url, PlatformError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PlatformError::Decode(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends a request and returns the `data` member of the response.
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, PlatformError> {
        let url = self.url(segments)?;
        debug!(method = %method, url = %url, "platform request");
        if self.debug {
            debug!(body = ?body, "request body");
        }

        let mut request = self.client.request(method, url).query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        let text = response.text().await?;
        if self.debug {
            debug!(status = %status, body = %text, "response body");
        }

        if !status.is_success() {
            error!(status = %status, body = %text, "platform request failed");
            return Err(PlatformError::from_response(
                status.as_u16(),
                error_message(status, &text),
            ));
        }

        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default)]
            data: Value,
        }

        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|e| PlatformError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, PlatformError> {
        let data = self.send(Method::GET, segments, query, None).await?;
        serde_json::from_value(data).map_err(|e| PlatformError::Decode(e.to_string()))
    }

    /// Sends a request and waits for the task it starts, if any.
    async fn run(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<(), PlatformError> {
        match self.send(method, segments, &[], body).await? {
            Value::String(upid) if upid.starts_with("UPID:") => self.wait_for_task(&upid).await,
            _ => Ok(()),
        }
    }

    /// Polls a task until it stops. Tasks that do not finish within the
    /// client timeout fail with [`PlatformError::TaskTimeout`].
    pub async fn wait_for_task(&self, upid: &str) -> Result<(), PlatformError> {
        #[derive(Deserialize)]
        struct TaskStatus {
            status: String,
            #[serde(default)]
            exitstatus: Option<String>,
        }

        let node = upid_node(upid)?;
        let started = tokio::time::Instant::now();
        loop {
            let task: TaskStatus = self
                .get(&["nodes", node, "tasks", upid, "status"], &[])
                .await?;
            if task.status == "stopped" {
                let exit = task.exitstatus.unwrap_or_default();
                debug!(upid = %upid, exit = %exit, "task finished");
                return if exit == "OK" || exit.starts_with("WARNINGS") {
                    Ok(())
                } else {
                    Err(PlatformError::from_task(upid, exit))
                };
            }
            if started.elapsed() >= self.task_timeout {
                return Err(PlatformError::TaskTimeout {
                    upid: upid.to_string(),
                    waited: self.task_timeout,
                });
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }
}

/// The node a task runs on, `UPID:<node>:...`.
fn upid_node(upid: &str) -> Result<&str, PlatformError> {
    upid.split(':')
        .nth(1)
        .filter(|node| !node.is_empty())
        .ok_or_else(|| PlatformError::Decode(format!("malformed task id '{}'", upid)))
}

/// Best human-readable message from an error response.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(errors) = value.get("errors").and_then(Value::as_object) {
            let joined: Vec<String> = errors
                .iter()
                .map(|(key, msg)| format!("{}: {}", key, value_to_string(msg).trim()))
                .collect();
            if !joined.is_empty() {
                return joined.join("; ");
            }
        }
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return message.trim().to_string();
        }
    }
    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body.to_string()
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn guest_segments<'a>(guest: &'a GuestRef, vmid: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut segments = vec!["nodes", guest.node.as_str(), guest.kind.as_str(), vmid];
    segments.extend_from_slice(rest);
    segments
}

fn params_body(params: &BTreeMap<String, String>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Deserialize)]
struct ResourceEntry {
    vmid: GuestId,
    node: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    template: Option<Value>,
}

#[derive(Deserialize)]
struct PendingEntry {
    #[serde(default)]
    pending: Option<Value>,
    #[serde(default)]
    delete: Option<Value>,
}

#[derive(Deserialize)]
struct CurrentStatus {
    status: String,
}

#[derive(Deserialize)]
struct AgentResult {
    result: Vec<AgentWireInterface>,
}

#[derive(Deserialize)]
struct AgentWireInterface {
    name: String,
    #[serde(rename = "hardware-address", default)]
    hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentWireAddress>,
}

#[derive(Deserialize)]
struct AgentWireAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
}

// =============================================================================
// PlatformApi
// =============================================================================

#[async_trait]
impl PlatformApi for PveClient {
    async fn next_id(&self) -> Result<GuestId, PlatformError> {
        self.get(&["cluster", "nextid"], &[]).await
    }

    async fn list_guests(&self) -> Result<Vec<GuestSummary>, PlatformError> {
        let entries: Vec<ResourceEntry> =
            self.get(&["cluster", "resources"], &[("type", "vm")]).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let kind = entry.kind.parse::<GuestKind>().ok()?;
                Some(GuestSummary {
                    vmid: entry.vmid,
                    node: entry.node,
                    kind,
                    name: entry.name,
                    status: entry.status.and_then(|s| s.parse().ok()),
                    template: matches!(
                        entry.template,
                        Some(Value::Bool(true))
                    ) || entry.template.as_ref().and_then(Value::as_u64) == Some(1),
                })
            })
            .collect())
    }

    async fn create_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: GuestId,
        params: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        let mut body = params_body(params);
        body.insert("vmid".to_string(), json!(vmid.value()));
        self.run(Method::POST, &["nodes", node, kind.as_str()], Some(&Value::Object(body)))
            .await
    }

    async fn clone_guest(
        &self,
        source: &GuestRef,
        request: &CloneRequest,
    ) -> Result<(), PlatformError> {
        let mut body = Map::new();
        body.insert("newid".to_string(), json!(request.target.value()));
        body.insert("full".to_string(), json!(u8::from(request.full)));
        if let Some(name) = &request.name {
            body.insert("name".to_string(), json!(name));
        }
        if request.node != source.node {
            body.insert("target".to_string(), json!(request.node));
        }
        let vmid = source.vmid.to_string();
        self.run(
            Method::POST,
            &guest_segments(source, &vmid, &["clone"]),
            Some(&Value::Object(body)),
        )
        .await
    }

    async fn guest_config(&self, guest: &GuestRef) -> Result<RemoteConfig, PlatformError> {
        let vmid = guest.vmid.to_string();
        let raw: BTreeMap<String, Value> =
            self.get(&guest_segments(guest, &vmid, &["config"]), &[]).await?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| (key, value_to_string(&value)))
            .collect())
    }

    async fn update_config(
        &self,
        guest: &GuestRef,
        update: &ConfigUpdate,
    ) -> Result<(), PlatformError> {
        let mut body = params_body(&update.params);
        if let Some(delete) = update.delete_list() {
            body.insert("delete".to_string(), json!(delete));
        }
        let vmid = guest.vmid.to_string();
        self.run(
            Method::PUT,
            &guest_segments(guest, &vmid, &["config"]),
            Some(&Value::Object(body)),
        )
        .await
    }

    async fn has_pending_changes(&self, guest: &GuestRef) -> Result<bool, PlatformError> {
        let vmid = guest.vmid.to_string();
        let entries: Vec<PendingEntry> =
            self.get(&guest_segments(guest, &vmid, &["pending"]), &[]).await?;
        Ok(entries
            .iter()
            .any(|e| e.pending.is_some() || e.delete.is_some()))
    }

    async fn power_state(&self, guest: &GuestRef) -> Result<PowerState, PlatformError> {
        let vmid = guest.vmid.to_string();
        let current: CurrentStatus = self
            .get(&guest_segments(guest, &vmid, &["status", "current"]), &[])
            .await?;
        current.status.parse().map_err(PlatformError::Decode)
    }

    async fn start(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let vmid = guest.vmid.to_string();
        self.run(Method::POST, &guest_segments(guest, &vmid, &["status", "start"]), None)
            .await
    }

    async fn stop(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let vmid = guest.vmid.to_string();
        self.run(Method::POST, &guest_segments(guest, &vmid, &["status", "stop"]), None)
            .await
    }

    async fn reboot(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let vmid = guest.vmid.to_string();
        self.run(Method::POST, &guest_segments(guest, &vmid, &["status", "reboot"]), None)
            .await
    }

    async fn move_volume(
        &self,
        guest: &GuestRef,
        slot: SlotKey,
        storage: &str,
    ) -> Result<(), PlatformError> {
        let vmid = guest.vmid.to_string();
        let (endpoint, field) = match guest.kind {
            GuestKind::Qemu => ("move_disk", "disk"),
            GuestKind::Lxc => ("move_volume", "volume"),
        };
        let mut body = Map::new();
        body.insert(field.to_string(), json!(slot.to_string()));
        body.insert("storage".to_string(), json!(storage));
        body.insert("delete".to_string(), json!(1));
        self.run(
            Method::POST,
            &guest_segments(guest, &vmid, &[endpoint]),
            Some(&Value::Object(body)),
        )
        .await
    }

    async fn resize_volume(
        &self,
        guest: &GuestRef,
        slot: SlotKey,
        size: &str,
    ) -> Result<(), PlatformError> {
        let vmid = guest.vmid.to_string();
        let body = json!({ "disk": slot.to_string(), "size": size });
        self.run(Method::PUT, &guest_segments(guest, &vmid, &["resize"]), Some(&body))
            .await
    }

    async fn delete_guest(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let vmid = guest.vmid.to_string();
        self.run(Method::DELETE, &guest_segments(guest, &vmid, &[]), None)
            .await
    }

    async fn agent_interfaces(
        &self,
        guest: &GuestRef,
    ) -> Result<Vec<AgentInterface>, PlatformError> {
        let vmid = guest.vmid.to_string();
        let reply: AgentResult = self
            .get(
                &guest_segments(guest, &vmid, &["agent", "network-get-interfaces"]),
                &[],
            )
            .await?;
        Ok(reply
            .result
            .into_iter()
            .map(|iface| AgentInterface {
                name: iface.name,
                hardware_address: iface.hardware_address,
                ip_addresses: iface.ip_addresses.into_iter().map(|a| a.ip_address).collect(),
            })
            .collect())
    }
}
