//! In-memory platform for tests and dry runs.
//!
//! [`MockPlatform`] keeps guests as flat configuration maps and behaves like
//! the real platform where the engine depends on it: new storage requests
//! get fresh volume references, NICs get generated MACs, writes to a running
//! guest leave pending changes, collisions use the platform's wording.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pvx_id::{GuestId, SlotFamily, SlotKey};
use pvx_networking::MacAddr;
use tracing::debug;

use crate::api::{
    AgentInterface, CloneRequest, ConfigUpdate, GuestKind, GuestRef, GuestSummary, PlatformApi,
    PlatformError, PowerState, RemoteConfig,
};
use crate::model::VolumeSize;
use crate::translate::PropertyString;

/// A call the engine made, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NextId,
    ListGuests,
    Create { vmid: GuestId },
    Clone { source: GuestId, target: GuestId },
    ReadConfig { vmid: GuestId },
    UpdateConfig {
        vmid: GuestId,
        set: Vec<String>,
        delete: Vec<String>,
    },
    Pending { vmid: GuestId },
    Status { vmid: GuestId },
    Start { vmid: GuestId },
    Stop { vmid: GuestId },
    Reboot { vmid: GuestId },
    MoveVolume {
        vmid: GuestId,
        slot: SlotKey,
        storage: String,
    },
    Resize {
        vmid: GuestId,
        slot: SlotKey,
        size: String,
    },
    Delete { vmid: GuestId },
    AgentInterfaces { vmid: GuestId },
}

#[derive(Debug, Clone)]
struct MockGuest {
    node: String,
    kind: GuestKind,
    config: RemoteConfig,
    status: PowerState,
    pending: bool,
    template: bool,
}

#[derive(Debug, Default)]
struct MockState {
    guests: BTreeMap<GuestId, MockGuest>,
    calls: Vec<Call>,
    disk_counters: HashMap<GuestId, u32>,
    mac_counter: u32,
    id_races: u32,
    agent_not_running: u32,
    agent_interfaces: HashMap<GuestId, Vec<AgentInterface>>,
}

/// In-memory [`PlatformApi`].
#[derive(Debug, Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Seeding and out-of-band changes
    // =========================================================================

    /// Adds a guest as if created outside the engine.
    pub fn insert_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: GuestId,
        config: &[(&str, &str)],
        status: PowerState,
    ) {
        let config = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state().guests.insert(
            vmid,
            MockGuest {
                node: node.to_string(),
                kind,
                config,
                status,
                pending: false,
                template: false,
            },
        );
    }

    /// Adds a stopped VM template.
    pub fn insert_template(&self, node: &str, vmid: GuestId, name: &str, config: &[(&str, &str)]) {
        let mut pairs = config.to_vec();
        pairs.push(("name", name));
        pairs.push(("template", "1"));
        self.insert_guest(node, GuestKind::Qemu, vmid, &pairs, PowerState::Stopped);
        if let Some(guest) = self.state().guests.get_mut(&vmid) {
            guest.template = true;
        }
    }

    /// Changes one configuration key behind the engine's back.
    pub fn set_config_value(&self, vmid: GuestId, key: &str, value: &str) {
        if let Some(guest) = self.state().guests.get_mut(&vmid) {
            guest.config.insert(key.to_string(), value.to_string());
        }
    }

    /// Changes the power state behind the engine's back.
    pub fn set_status(&self, vmid: GuestId, status: PowerState) {
        if let Some(guest) = self.state().guests.get_mut(&vmid) {
            guest.status = status;
        }
    }

    /// Removes a guest behind the engine's back.
    pub fn remove_guest(&self, vmid: GuestId) {
        self.state().guests.remove(&vmid);
    }

    /// The next `count` creates or clones find their id taken by a
    /// concurrent creator.
    pub fn inject_id_race(&self, count: u32) {
        self.state().id_races = count;
    }

    /// The next `count` agent queries report that the agent is not running.
    pub fn agent_not_running_for(&self, count: u32) {
        self.state().agent_not_running = count;
    }

    pub fn set_agent_interfaces(&self, vmid: GuestId, interfaces: Vec<AgentInterface>) {
        self.state().agent_interfaces.insert(vmid, interfaces);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn contains(&self, vmid: GuestId) -> bool {
        self.state().guests.contains_key(&vmid)
    }

    pub fn config_of(&self, vmid: GuestId) -> Option<RemoteConfig> {
        self.state().guests.get(&vmid).map(|g| g.config.clone())
    }

    pub fn status_of(&self, vmid: GuestId) -> Option<PowerState> {
        self.state().guests.get(&vmid).map(|g| g.status)
    }

    pub fn guest_count(&self) -> usize {
        self.state().guests.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn next_id_calls(&self) -> usize {
        self.count_calls(|c| matches!(c, Call::NextId))
    }

    pub fn agent_calls(&self) -> usize {
        self.count_calls(|c| matches!(c, Call::AgentInterfaces { .. }))
    }

    pub fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }
}

// =============================================================================
// Platform behaviour
// =============================================================================

fn not_found(guest: &GuestRef) -> PlatformError {
    PlatformError::from_response(
        500,
        format!("Configuration file '{}' does not exist", guest.path()),
    )
}

fn kind_label(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::Qemu => "VM",
        GuestKind::Lxc => "CT",
    }
}

impl MockState {
    fn guest(&self, guest: &GuestRef) -> Result<&MockGuest, PlatformError> {
        self.guests
            .get(&guest.vmid)
            .filter(|g| g.node == guest.node && g.kind == guest.kind)
            .ok_or_else(|| not_found(guest))
    }

    fn guest_mut(&mut self, guest: &GuestRef) -> Result<&mut MockGuest, PlatformError> {
        self.guests
            .get_mut(&guest.vmid)
            .filter(|g| g.node == guest.node && g.kind == guest.kind)
            .ok_or_else(|| not_found(guest))
    }

    fn lowest_free_id(&self) -> GuestId {
        let mut id = GuestId::FIRST;
        while self.guests.contains_key(&id) {
            id = id.next();
        }
        id
    }

    /// Takes `vmid` on behalf of a concurrent creator if a race is armed.
    fn lose_race(&mut self, node: &str, kind: GuestKind, vmid: GuestId) -> bool {
        if self.id_races == 0 {
            return false;
        }
        self.id_races -= 1;
        self.guests.insert(
            vmid,
            MockGuest {
                node: node.to_string(),
                kind,
                config: RemoteConfig::from([("name".to_string(), "racer".to_string())]),
                status: PowerState::Stopped,
                pending: false,
                template: false,
            },
        );
        true
    }

    fn new_volume(&mut self, storage: &str, vmid: GuestId) -> String {
        let counter = self.disk_counters.entry(vmid).or_insert(0);
        let volume = format!("{}:vm-{}-disk-{}", storage, vmid, counter);
        *counter += 1;
        volume
    }

    fn new_mac(&mut self) -> MacAddr {
        self.mac_counter += 1;
        let [_, a, b, c] = self.mac_counter.to_be_bytes();
        MacAddr::new([0xBC, 0x24, 0x11, a, b, c])
    }

    /// Rewrites a device value the way the platform stores it.
    fn materialize(&mut self, kind: GuestKind, vmid: GuestId, slot: SlotKey, value: &str) -> String {
        let prop = PropertyString::parse(value);
        match slot.family() {
            SlotFamily::Virtio | SlotFamily::Mp | SlotFamily::RootFs => {
                let Some(positional) = prop.positional() else {
                    return value.to_string();
                };
                // `storage:<GiB>` allocates a new volume.
                let Some((storage, amount)) = positional.split_once(':') else {
                    return value.to_string();
                };
                let Some(size) = VolumeSize::from_platform(amount) else {
                    return value.to_string();
                };
                let mut stored = PropertyString::with_positional(self.new_volume(storage, vmid));
                for (key, value) in prop.entries() {
                    if key != "size" {
                        stored.set(key, value);
                    }
                }
                stored.set("size", size.to_string());
                stored.to_string()
            }
            SlotFamily::Net => match kind {
                GuestKind::Qemu => match prop.get("model") {
                    Some(model) => {
                        let mac = match prop.get("macaddr") {
                            Some(mac) => mac.to_string(),
                            None => self.new_mac().to_string(),
                        };
                        let mut stored = PropertyString::new();
                        stored.set(model, mac);
                        for (key, value) in prop.entries() {
                            if key != "model" && key != "macaddr" {
                                stored.set(key, value);
                            }
                        }
                        stored.to_string()
                    }
                    None => value.to_string(),
                },
                GuestKind::Lxc => {
                    if prop.get("hwaddr").is_some() {
                        return value.to_string();
                    }
                    let mut stored = prop.clone();
                    stored.set("hwaddr", self.new_mac().to_string());
                    stored.to_string()
                }
            },
            SlotFamily::Ide => value.to_string(),
        }
    }

    fn write_params(
        &mut self,
        kind: GuestKind,
        vmid: GuestId,
        params: &BTreeMap<String, String>,
    ) -> RemoteConfig {
        let mut written = RemoteConfig::new();
        for (key, value) in params {
            let value = match key.parse::<SlotKey>() {
                Ok(slot) => self.materialize(kind, vmid, slot, value),
                Err(_) => value.clone(),
            };
            written.insert(key.clone(), value);
        }
        written
    }
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn next_id(&self) -> Result<GuestId, PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::NextId);
        Ok(state.lowest_free_id())
    }

    async fn list_guests(&self) -> Result<Vec<GuestSummary>, PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::ListGuests);
        Ok(state
            .guests
            .iter()
            .map(|(vmid, g)| GuestSummary {
                vmid: *vmid,
                node: g.node.clone(),
                kind: g.kind,
                name: g
                    .config
                    .get("name")
                    .or_else(|| g.config.get("hostname"))
                    .cloned(),
                status: Some(g.status),
                template: g.template,
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
        let mut state = self.state();
        state.calls.push(Call::Create { vmid });

        if state.guests.contains_key(&vmid) || state.lose_race(node, kind, vmid) {
            let label = kind_label(kind);
            return Err(PlatformError::from_response(
                500,
                format!("unable to create {label} {vmid} - {label} {vmid} already exists"),
            ));
        }

        let config = state.write_params(kind, vmid, params);
        debug!(vmid = %vmid, keys = config.len(), "[MOCK] created guest");
        state.guests.insert(
            vmid,
            MockGuest {
                node: node.to_string(),
                kind,
                config,
                status: PowerState::Stopped,
                pending: false,
                template: false,
            },
        );
        Ok(())
    }

    async fn clone_guest(
        &self,
        source: &GuestRef,
        request: &CloneRequest,
    ) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Clone {
            source: source.vmid,
            target: request.target,
        });

        let template = state.guest(source)?.clone();
        let target = request.target;
        if state.guests.contains_key(&target) || state.lose_race(&request.node, source.kind, target) {
            return Err(PlatformError::from_task(
                format!("UPID:{}:clone", source.node),
                format!("unable to create VM {}: config file already exists", target),
            ));
        }

        let mut config = RemoteConfig::new();
        for (key, value) in &template.config {
            if key == "template" {
                continue;
            }
            let value = match key.parse::<SlotKey>() {
                Ok(slot) if slot.family().is_storage() => {
                    let prop = PropertyString::parse(value);
                    let storage = prop
                        .positional()
                        .and_then(|p| p.split_once(':'))
                        .map(|(storage, _)| storage.to_string());
                    match storage {
                        Some(storage) => {
                            let mut stored =
                                PropertyString::with_positional(state.new_volume(&storage, target));
                            for (k, v) in prop.entries() {
                                stored.set(k, v);
                            }
                            stored.to_string()
                        }
                        None => value.clone(),
                    }
                }
                _ => value.clone(),
            };
            config.insert(key.clone(), value);
        }
        if let Some(name) = &request.name {
            config.insert("name".to_string(), name.clone());
        }

        state.guests.insert(
            target,
            MockGuest {
                node: request.node.clone(),
                kind: source.kind,
                config,
                status: PowerState::Stopped,
                pending: false,
                template: false,
            },
        );
        Ok(())
    }

    async fn guest_config(&self, guest: &GuestRef) -> Result<RemoteConfig, PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::ReadConfig { vmid: guest.vmid });
        Ok(state.guest(guest)?.config.clone())
    }

    async fn update_config(
        &self,
        guest: &GuestRef,
        update: &ConfigUpdate,
    ) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::UpdateConfig {
            vmid: guest.vmid,
            set: update.params.keys().cloned().collect(),
            delete: update.delete.clone(),
        });

        if let Some(key) = update.delete.iter().find(|k| update.params.contains_key(*k)) {
            return Err(PlatformError::from_response(
                400,
                format!("parameter verification failed: {key}: cannot set and delete at once"),
            ));
        }
        if update.delete.iter().any(|k| k == "rootfs") {
            return Err(PlatformError::from_response(
                500,
                "unable to delete root filesystem",
            ));
        }
        state.guest(guest)?;

        let written = state.write_params(guest.kind, guest.vmid, &update.params);
        let target = state.guest_mut(guest)?;
        let changed = written.iter().any(|(k, v)| target.config.get(k) != Some(v))
            || update.delete.iter().any(|k| target.config.contains_key(k));
        for key in &update.delete {
            target.config.remove(key);
        }
        target.config.extend(written);
        // Nothing is hot-plugged: any change to a running guest waits for a restart.
        if target.status == PowerState::Running && changed {
            target.pending = true;
        }
        Ok(())
    }

    async fn has_pending_changes(&self, guest: &GuestRef) -> Result<bool, PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Pending { vmid: guest.vmid });
        Ok(state.guest(guest)?.pending)
    }

    async fn power_state(&self, guest: &GuestRef) -> Result<PowerState, PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Status { vmid: guest.vmid });
        Ok(state.guest(guest)?.status)
    }

    async fn start(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Start { vmid: guest.vmid });
        let target = state.guest_mut(guest)?;
        if target.status == PowerState::Running {
            return Err(PlatformError::from_task(
                format!("UPID:{}:start", guest.node),
                format!("{} {} already running", kind_label(guest.kind), guest.vmid),
            ));
        }
        target.status = PowerState::Running;
        target.pending = false;
        Ok(())
    }

    async fn stop(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Stop { vmid: guest.vmid });
        let target = state.guest_mut(guest)?;
        target.status = PowerState::Stopped;
        target.pending = false;
        Ok(())
    }

    async fn reboot(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Reboot { vmid: guest.vmid });
        let target = state.guest_mut(guest)?;
        if target.status != PowerState::Running {
            return Err(PlatformError::from_task(
                format!("UPID:{}:reboot", guest.node),
                format!("{} {} not running", kind_label(guest.kind), guest.vmid),
            ));
        }
        target.pending = false;
        Ok(())
    }

    async fn move_volume(
        &self,
        guest: &GuestRef,
        slot: SlotKey,
        storage: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::MoveVolume {
            vmid: guest.vmid,
            slot,
            storage: storage.to_string(),
        });
        let target = state.guest_mut(guest)?;
        let key = slot.to_string();
        let value = target
            .config
            .get(&key)
            .ok_or_else(|| PlatformError::from_response(500, format!("disk '{key}' does not exist")))?;
        let prop = PropertyString::parse(value);
        let name = prop
            .positional()
            .and_then(|p| p.split_once(':'))
            .map(|(_, name)| name.to_string())
            .ok_or_else(|| PlatformError::from_response(500, format!("disk '{key}' has no volume")))?;

        let mut moved = PropertyString::with_positional(format!("{storage}:{name}"));
        for (k, v) in prop.entries() {
            moved.set(k, v);
        }
        target.config.insert(key, moved.to_string());
        Ok(())
    }

    async fn resize_volume(
        &self,
        guest: &GuestRef,
        slot: SlotKey,
        size: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Resize {
            vmid: guest.vmid,
            slot,
            size: size.to_string(),
        });
        let size = VolumeSize::from_platform(size).ok_or_else(|| {
            PlatformError::from_response(400, format!("invalid size '{size}'"))
        })?;
        let target = state.guest_mut(guest)?;
        let key = slot.to_string();
        let value = target
            .config
            .get(&key)
            .ok_or_else(|| PlatformError::from_response(500, format!("disk '{key}' does not exist")))?;
        let mut prop = PropertyString::parse(value);
        prop.set("size", size.to_string());
        target.config.insert(key, prop.to_string());
        Ok(())
    }

    async fn delete_guest(&self, guest: &GuestRef) -> Result<(), PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::Delete { vmid: guest.vmid });
        if state.guest(guest)?.status == PowerState::Running {
            return Err(PlatformError::from_task(
                format!("UPID:{}:destroy", guest.node),
                format!("{} {} is running - destroy failed", kind_label(guest.kind), guest.vmid),
            ));
        }
        state.guests.remove(&guest.vmid);
        state.agent_interfaces.remove(&guest.vmid);
        Ok(())
    }

    async fn agent_interfaces(
        &self,
        guest: &GuestRef,
    ) -> Result<Vec<AgentInterface>, PlatformError> {
        let mut state = self.state();
        state.calls.push(Call::AgentInterfaces { vmid: guest.vmid });
        if state.agent_not_running > 0 {
            state.agent_not_running -= 1;
            return Err(PlatformError::from_response(
                500,
                "QEMU guest agent is not running",
            ));
        }
        if let Some(interfaces) = state.agent_interfaces.get(&guest.vmid) {
            return Ok(interfaces.clone());
        }
        state.guest(guest)?;
        Ok(Vec::new())
    }
}
