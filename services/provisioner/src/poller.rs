//! Guest network poller.
//!
//! Asks the guest agent for the address of the interface with a known MAC.
//! The agent usually comes up some time after the guest starts, so "agent not
//! running" is retried until the deadline.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use pvx_networking::{first_global_unicast_v4, MacAddr};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::api::{AgentInterface, GuestRef, PlatformApi};
use crate::error::EngineError;

/// Waits until the guest agent reports a global unicast IPv4 address on the
/// interface with `mac`.
///
/// Polling runs in its own task. It is told to stop once this returns,
/// whichever of deadline, result or `shutdown` came first.
pub async fn wait_for_ipv4(
    api: Arc<dyn PlatformApi>,
    guest: GuestRef,
    mac: MacAddr,
    interval: Duration,
    deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Ipv4Addr, EngineError> {
    let vmid = guest.vmid;
    let (result_tx, result_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    info!(vmid = %vmid, mac = %mac, "waiting for guest agent to report an address");
    tokio::spawn(poll_loop(api, guest, mac, interval, stop_rx, result_tx));

    let outcome = tokio::select! {
        _ = tokio::time::sleep(deadline) => Err(EngineError::AddressTimeout { vmid, waited: deadline }),
        result = result_rx => result.unwrap_or(Err(EngineError::Cancelled)),
        _ = shutdown_requested(&mut shutdown) => Err(EngineError::Cancelled),
    };

    let _ = stop_tx.send(true);
    outcome
}

async fn poll_loop(
    api: Arc<dyn PlatformApi>,
    guest: GuestRef,
    mac: MacAddr,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    result: oneshot::Sender<Result<Ipv4Addr, EngineError>>,
) {
    let outcome = loop {
        match api.agent_interfaces(&guest).await {
            Ok(interfaces) => {
                if let Some(address) = address_for(&interfaces, mac) {
                    break Ok(address);
                }
                debug!(vmid = %guest.vmid, "no usable address reported yet");
            }
            Err(e) if e.is_agent_not_running() => {
                debug!(vmid = %guest.vmid, "guest agent not running yet");
            }
            Err(e) => break Err(EngineError::api("query guest agent", Some(guest.vmid))(e)),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => return,
        }
    };

    let _ = result.send(outcome);
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn address_for(interfaces: &[AgentInterface], mac: MacAddr) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .filter(|iface| {
            iface
                .hardware_address
                .as_deref()
                .and_then(|hw| hw.parse::<MacAddr>().ok())
                == Some(mac)
        })
        .find_map(|iface| first_global_unicast_v4(iface.ip_addresses.iter().map(String::as_str)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GuestKind;
    use crate::mock::MockPlatform;
    use pvx_id::GuestId;

    fn mac() -> MacAddr {
        "bc:24:11:00:00:01".parse().unwrap()
    }

    fn interface(hw: &str, addresses: &[&str]) -> AgentInterface {
        AgentInterface {
            name: "eth0".to_string(),
            hardware_address: Some(hw.to_string()),
            ip_addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn guest() -> GuestRef {
        GuestRef::new("pve", GuestId::new(100).unwrap(), GuestKind::Qemu)
    }

    #[test]
    fn test_address_for_matches_mac_and_skips_local_addresses() {
        let interfaces = vec![
            interface("00:00:00:00:00:00", &["127.0.0.1", "::1"]),
            interface("BC:24:11:00:00:01", &["fe80::1", "169.254.0.3", "192.168.1.20"]),
        ];
        assert_eq!(
            address_for(&interfaces, mac()),
            Some("192.168.1.20".parse().unwrap())
        );
        assert_eq!(address_for(&interfaces[..1], mac()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_agent_reports() {
        let mock = Arc::new(MockPlatform::new());
        mock.agent_not_running_for(3);
        mock.set_agent_interfaces(
            guest().vmid,
            vec![interface("bc:24:11:00:00:01", &["10.0.0.7"])],
        );
        let (_tx, rx) = watch::channel(false);

        let address = wait_for_ipv4(
            mock.clone(),
            guest(),
            mac(),
            Duration::from_secs(2),
            Duration::from_secs(300),
            rx,
        )
        .await
        .unwrap();

        assert_eq!(address, "10.0.0.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(mock.agent_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_a_distinct_error() {
        let mock = Arc::new(MockPlatform::new());
        mock.agent_not_running_for(u32::MAX);
        let (_tx, rx) = watch::channel(false);

        let err = wait_for_ipv4(
            mock,
            guest(),
            mac(),
            Duration::from_secs(2),
            Duration::from_secs(10),
            rx,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::AddressTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels() {
        let mock = Arc::new(MockPlatform::new());
        mock.agent_not_running_for(u32::MAX);
        let (tx, rx) = watch::channel(false);

        let waiting = tokio::spawn(wait_for_ipv4(
            mock,
            guest(),
            mac(),
            Duration::from_secs(2),
            Duration::from_secs(300),
            rx,
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();

        assert!(matches!(waiting.await.unwrap(), Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_other_agent_errors_abort() {
        let mock = Arc::new(MockPlatform::new());
        let (_tx, rx) = watch::channel(false);

        // No such guest: the mock answers with "does not exist".
        let err = wait_for_ipv4(
            mock,
            guest(),
            mac(),
            Duration::from_millis(10),
            Duration::from_secs(5),
            rx,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::Api { .. }));
    }
}
