//! Reads authoritative guest state from the platform.

use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use pvx_id::SlotKey;
use tokio::sync::watch;
use tracing::debug;

use crate::api::{GuestKind, GuestRef, PlatformApi, PowerState};
use crate::error::EngineError;
use crate::model::{Attachment, GuestSpec};
use crate::poller::wait_for_ipv4;
use crate::translate::{self, translator};

/// Which parts of a guest's state to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMask(u8);

impl StateMask {
    /// Configuration keys and attachments.
    pub const CONFIG: Self = Self(1);
    /// Power state.
    pub const STATUS: Self = Self(2);
    /// Address reported by the guest agent.
    pub const NET: Self = Self(4);
    pub const EVERYTHING: Self = Self(0xff);

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StateMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Populates a [`GuestSpec`] from the platform.
#[derive(Clone)]
pub struct StateReader {
    api: Arc<dyn PlatformApi>,
    poll_interval: Duration,
    poll_deadline: Duration,
    shutdown: watch::Receiver<bool>,
}

impl StateReader {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        poll_interval: Duration,
        poll_deadline: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            api,
            poll_interval,
            poll_deadline,
            shutdown,
        }
    }

    /// Overwrites the parts of `spec` selected by `mask`.
    ///
    /// The address lookup needs the configuration, so it is fetched for NET
    /// as well, but config fields are only written when CONFIG is set.
    pub async fn read(
        &self,
        guest: &GuestRef,
        spec: &mut GuestSpec,
        mask: StateMask,
    ) -> Result<(), EngineError> {
        let vmid = Some(guest.vmid);
        let want_config = mask.contains(StateMask::CONFIG);
        let want_net = mask.contains(StateMask::NET);
        debug!(guest = %guest, mask = mask.0, "reading guest state");

        let config = if want_config || want_net {
            Some(
                self.api
                    .guest_config(guest)
                    .await
                    .map_err(EngineError::api("read configuration", vmid))?,
            )
        } else {
            None
        };

        if let (true, Some(config)) = (want_config, &config) {
            translator(guest.kind).from_remote(config, spec)?;
            spec.node = guest.node.clone();
            spec.vmid = Some(guest.vmid);
        }

        let status = if mask.contains(StateMask::STATUS) || want_net {
            let status = self
                .api
                .power_state(guest)
                .await
                .map_err(EngineError::api("read power state", vmid))?;
            if mask.contains(StateMask::STATUS) {
                spec.status = status;
            }
            Some(status)
        } else {
            None
        };

        if let (true, Some(config)) = (want_net, &config) {
            spec.ipv4_address = None;
            if guest.kind != GuestKind::Qemu || status != Some(PowerState::Running) {
                return Ok(());
            }
            if !translate::remote_flag(config, "agent") {
                return Ok(());
            }
            let mac = translator(guest.kind)
                .attachments_from_remote(config)?
                .get(&SlotKey::PRIMARY_NET)
                .and_then(Attachment::as_network)
                .and_then(|net| net.mac);
            let Some(mac) = mac else {
                return Ok(());
            };

            let address = wait_for_ipv4(
                self.api.clone(),
                guest.clone(),
                mac,
                self.poll_interval,
                self.poll_deadline,
                self.shutdown.clone(),
            )
            .await?;
            spec.ipv4_address = Some(address);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_bits() {
        let mask = StateMask::CONFIG | StateMask::STATUS;
        assert!(mask.contains(StateMask::CONFIG));
        assert!(mask.contains(StateMask::STATUS));
        assert!(!mask.contains(StateMask::NET));
        assert!(StateMask::EVERYTHING.contains(mask | StateMask::NET));
    }

    #[tokio::test]
    async fn test_address_lookup_uses_primary_interface() {
        use pvx_id::GuestId;

        use crate::api::AgentInterface;
        use crate::mock::MockPlatform;

        let mock = Arc::new(MockPlatform::new());
        let vmid = GuestId::new(100).unwrap();
        mock.insert_guest(
            "pve",
            GuestKind::Qemu,
            vmid,
            &[
                ("agent", "1"),
                ("net1", "virtio=BC:24:11:00:00:02,bridge=vmbr1"),
            ],
            PowerState::Running,
        );
        mock.set_agent_interfaces(
            vmid,
            vec![AgentInterface {
                name: "eth1".to_string(),
                hardware_address: Some("bc:24:11:00:00:02".to_string()),
                ip_addresses: vec!["10.0.0.5".to_string()],
            }],
        );
        let reader = StateReader::new(
            mock.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
            watch::channel(false).1,
        );
        let guest = GuestRef::new("pve", vmid, GuestKind::Qemu);

        let mut spec = GuestSpec::new("pve", GuestKind::Qemu);
        reader
            .read(&guest, &mut spec, StateMask::EVERYTHING)
            .await
            .unwrap();

        // Only net1 exists; without net0 there is nothing to ask the agent.
        assert_eq!(spec.ipv4_address, None);
        assert_eq!(mock.agent_calls(), 0);

        mock.set_config_value(vmid, "net0", "virtio=BC:24:11:00:00:01,bridge=vmbr0");
        mock.set_agent_interfaces(
            vmid,
            vec![
                AgentInterface {
                    name: "eth0".to_string(),
                    hardware_address: Some("bc:24:11:00:00:01".to_string()),
                    ip_addresses: vec!["192.168.1.20".to_string()],
                },
                AgentInterface {
                    name: "eth1".to_string(),
                    hardware_address: Some("bc:24:11:00:00:02".to_string()),
                    ip_addresses: vec!["10.0.0.5".to_string()],
                },
            ],
        );
        reader
            .read(&guest, &mut spec, StateMask::EVERYTHING)
            .await
            .unwrap();
        assert_eq!(spec.ipv4_address, Some("192.168.1.20".parse().unwrap()));
    }
}
