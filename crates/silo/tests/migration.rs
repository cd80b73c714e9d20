//! Sending instances between two hosts over an in-memory stream.

mod common;

use std::sync::Arc;

use common::{Harness, RecordingRuntime, mixed_harness, zfs_harness, zfs_harness_with};
use silo::args::InstanceArgs;
use silo::catalog::InstanceRecord;
use silo_common::{SiloError, SiloResult};
use silo_storage::migration::FramedChannel;

async fn transfer(
    sender: &Harness,
    receiver: &Harness,
    name: &str,
    live: bool,
) -> (SiloResult<()>, SiloResult<InstanceRecord>) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let send = async {
        let mut channel = FramedChannel::new(near);
        sender
            .silo
            .migrate_send(&sender.name(name), live, &mut channel)
            .await
    };
    let receive = async {
        let mut channel = FramedChannel::new(far);
        receiver
            .silo
            .migrate_receive(InstanceArgs::new(receiver.name(name)), &mut channel)
            .await
    };
    tokio::join!(send, receive)
}

async fn with_history(h: &Harness) {
    h.silo
        .create_empty(InstanceArgs::new(h.name("c1")))
        .await
        .unwrap();
    h.fake.set_content("tank/containers/c1", "v1");
    h.silo
        .create_as_snapshot(h.name("c1/s0"), false)
        .await
        .unwrap();
    h.fake.set_content("tank/containers/c1", "v2");
    h.silo
        .create_as_snapshot(h.name("c1/s1"), false)
        .await
        .unwrap();
    h.fake.set_content("tank/containers/c1", "v3");
}

#[test_log::test(tokio::test)]
async fn snapshots_and_state_arrive() {
    let sender = zfs_harness().await;
    let receiver = zfs_harness().await;
    with_history(&sender).await;

    let (sent, received) = transfer(&sender, &receiver, "c1", false).await;
    sent.unwrap();
    let record = received.unwrap();
    assert_eq!(record.pool, "default");

    let fake = &receiver.fake;
    assert_eq!(fake.snapshots("tank/containers/c1"), ["snapshot-s0", "snapshot-s1"]);
    assert_eq!(fake.content("tank/containers/c1@snapshot-s0").as_deref(), Some("v1"));
    assert_eq!(fake.content("tank/containers/c1@snapshot-s1").as_deref(), Some("v2"));
    assert_eq!(fake.content("tank/containers/c1").as_deref(), Some("v3"));
    assert!(fake.is_mounted("tank/containers/c1"));
    assert_eq!(receiver.names(), ["c1", "c1/s0", "c1/s1"]);

    // Nothing transient is left on the sender
    assert_eq!(
        sender.fake.snapshots("tank/containers/c1"),
        ["snapshot-s0", "snapshot-s1"]
    );
    assert_eq!(sender.names(), ["c1", "c1/s0", "c1/s1"]);
}

#[test_log::test(tokio::test)]
async fn live_migration_checkpoints_and_stops() {
    let runtime = Arc::new(RecordingRuntime::default());
    let sender = zfs_harness_with({
        let runtime = runtime.clone();
        move |silo| silo.with_runtime(runtime)
    })
    .await;
    let receiver = zfs_harness().await;
    with_history(&sender).await;

    let (sent, received) = transfer(&sender, &receiver, "c1", true).await;
    sent.unwrap();
    received.unwrap();

    {
        let checkpoints = runtime.checkpoints.lock();
        assert_eq!(checkpoints.len(), 1);
        assert!(checkpoints[0].2, "live sends stop the instance");
    }
    let state = sender.paths.container_mountpoint("default", "c1").join("state");
    assert!(!state.exists());
    assert_eq!(sender.fake.snapshots("tank/containers/c1").len(), 2);
    assert_eq!(receiver.fake.content("tank/containers/c1").as_deref(), Some("v3"));
    assert_eq!(receiver.names(), ["c1", "c1/s0", "c1/s1"]);
}

#[tokio::test]
async fn live_send_requires_a_running_instance() {
    let sender = zfs_harness().await;
    let receiver = zfs_harness().await;
    with_history(&sender).await;

    let (sent, received) = transfer(&sender, &receiver, "c1", true).await;
    assert!(matches!(sent, Err(SiloError::Validation { .. })));
    assert!(received.is_err());
    assert!(receiver.names().is_empty());
    assert!(!receiver.fake.exists("tank/containers/c1"));
}

#[test_log::test(tokio::test)]
async fn failed_receive_removes_everything() {
    let sender = zfs_harness().await;
    let receiver = zfs_harness().await;
    with_history(&sender).await;
    receiver.fake.fail_on("@snapshot-s1");

    let (_, received) = transfer(&sender, &receiver, "c1", false).await;
    assert!(matches!(received, Err(SiloError::Tool { .. })));

    assert!(receiver.names().is_empty());
    assert!(!receiver.fake.exists("tank/containers/c1"));
    assert_eq!(
        sender.fake.snapshots("tank/containers/c1"),
        ["snapshot-s0", "snapshot-s1"]
    );
}

#[tokio::test]
async fn mismatched_technology_is_refused() {
    let sender = zfs_harness().await;
    let receiver = mixed_harness().await;
    with_history(&sender).await;

    let (_, received) = transfer(&sender, &receiver, "c1", false).await;
    assert!(matches!(received, Err(SiloError::Validation { .. })));
    assert!(receiver.names().is_empty());
    assert!(!receiver.paths.container_mountpoint("default", "c1").exists());
}
