//! Integration tests for refresh and drift detection.
//!
//! Reads always report what the platform holds; changes made outside the
//! engine show up in the refreshed state and in [`diff`].

use std::sync::Arc;

use pvx_id::{GuestId, SlotKey};
use pvx_provisioner::api::{GuestKind, PowerState};
use pvx_provisioner::config::EngineConfig;
use pvx_provisioner::drift::diff;
use pvx_provisioner::mock::{Call, MockPlatform};
use pvx_provisioner::model::{
    Attachment, CloneSource, DiskAttachment, GuestExtras, GuestSpec, NetworkAttachment, VolumeSize,
};
use pvx_provisioner::{Engine, FieldDrift, ReadOutcome};

fn id(value: u32) -> GuestId {
    GuestId::new(value).unwrap()
}

fn vm() -> GuestSpec {
    let mut spec = GuestSpec::new("pve", GuestKind::Qemu)
        .with_vmid(id(100))
        .with_attachment(
            SlotKey::virtio(0).unwrap(),
            Attachment::Disk(DiskAttachment::new("local-lvm", VolumeSize::from_gib(30))),
        )
        .with_attachment(
            SlotKey::net(0).unwrap(),
            Attachment::Network(NetworkAttachment::bridged("vmbr0")),
        );
    spec.memory = 32;
    spec
}

fn engine(mock: &Arc<MockPlatform>) -> Engine {
    Engine::new(mock.clone(), EngineConfig::default())
}

#[tokio::test]
async fn test_fresh_guest_has_no_drift() {
    let mock = Arc::new(MockPlatform::new());
    let engine = engine(&mock);
    let desired = vm();

    let tracked = engine.create(&desired).await.unwrap();
    let refreshed = engine.read(&tracked).await.unwrap().into_tracked().unwrap();

    assert!(diff(&desired, &refreshed.spec).is_empty());
    assert!(refreshed.refreshed_at >= tracked.refreshed_at);
}

#[tokio::test]
async fn test_out_of_band_changes_are_reported() {
    let mock = Arc::new(MockPlatform::new());
    let engine = engine(&mock);
    let desired = vm();
    let tracked = engine.create(&desired).await.unwrap();

    mock.set_config_value(id(100), "memory", "64");
    mock.set_config_value(id(100), "virtio1", "local-lvm:vm-100-disk-9,size=2G");
    mock.set_status(id(100), PowerState::Stopped);

    let refreshed = match engine.read(&tracked).await.unwrap() {
        ReadOutcome::Present(tracked) => tracked,
        ReadOutcome::Gone => panic!("guest should still exist"),
    };
    assert_eq!(refreshed.spec.memory, 64);
    assert_eq!(refreshed.spec.status, PowerState::Stopped);

    let drift = diff(&desired, &refreshed.spec);
    assert!(drift.contains(&FieldDrift {
        field: "memory".to_string(),
        desired: "32".to_string(),
        observed: "64".to_string(),
    }));
    assert!(drift.iter().any(|d| d.field == "status"));
    assert!(drift
        .iter()
        .any(|d| d.field == "attachments.virtio1" && d.desired == "(absent)"));
    assert_eq!(drift.len(), 3);
}

#[tokio::test]
async fn test_update_converges_drifted_guest() {
    let mock = Arc::new(MockPlatform::new());
    let engine = engine(&mock);
    let desired = vm();
    let tracked = engine.create(&desired).await.unwrap();

    mock.set_config_value(id(100), "memory", "64");
    let refreshed = engine.read(&tracked).await.unwrap().into_tracked().unwrap();
    let converged = engine.update(&refreshed, &desired).await.unwrap();

    assert_eq!(converged.spec.memory, 32);
    assert!(diff(&desired, &converged.spec).is_empty());
}

#[tokio::test]
async fn test_removed_guest_is_gone() {
    let mock = Arc::new(MockPlatform::new());
    let engine = engine(&mock);
    let tracked = engine.create(&vm()).await.unwrap();

    mock.remove_guest(id(100));
    mock.clear_calls();

    assert_eq!(engine.read(&tracked).await.unwrap(), ReadOutcome::Gone);
    engine.delete(&tracked).await.unwrap();
    assert_eq!(mock.count_calls(|c| matches!(c, Call::Delete { .. })), 0);
    assert_eq!(mock.count_calls(|c| matches!(c, Call::Stop { .. })), 0);
}

#[tokio::test]
async fn test_untracked_fields_survive_refresh() {
    let mock = Arc::new(MockPlatform::new());
    mock.insert_template("pve", id(200), "base", &[("memory", "32")]);
    let engine = engine(&mock);

    let mut desired = vm();
    desired.clone = Some(CloneSource::from("base"));
    let tracked = engine.create(&desired).await.unwrap();
    let refreshed = engine.read(&tracked).await.unwrap().into_tracked().unwrap();
    assert_eq!(refreshed.spec.clone, Some(CloneSource::Name("base".to_string())));

    let mut container = GuestSpec::new("pve", GuestKind::Lxc)
        .with_attachment(
            SlotKey::ROOTFS,
            Attachment::Disk(DiskAttachment::new("local-lvm", VolumeSize::from_gib(8))),
        );
    container.extras = GuestExtras::Lxc {
        ostemplate: Some("local:vztmpl/alpine-3.20.tar.xz".to_string()),
        unprivileged: true,
        ostype: None,
        password: Some("hunter2".to_string()),
        ssh_public_keys: Some("ssh-ed25519 AAAA admin@host".to_string()),
    };
    let tracked = engine.create(&container).await.unwrap();
    let refreshed = engine.read(&tracked).await.unwrap().into_tracked().unwrap();

    match &refreshed.spec.extras {
        GuestExtras::Lxc {
            ostemplate,
            unprivileged,
            password,
            ssh_public_keys,
            ..
        } => {
            assert_eq!(ostemplate.as_deref(), Some("local:vztmpl/alpine-3.20.tar.xz"));
            assert!(*unprivileged);
            assert_eq!(password.as_deref(), Some("hunter2"));
            assert_eq!(ssh_public_keys.as_deref(), Some("ssh-ed25519 AAAA admin@host"));
        }
        other => panic!("expected container settings, got {:?}", other),
    }
}
