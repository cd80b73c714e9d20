//! Instances on a plain directory pool, and copies between technologies.

mod common;

use std::fs;

use common::{IMAGE, mixed_harness};
use silo::args::InstanceArgs;
use silo_common::{ByteSize, Fingerprint, SiloError};

fn image() -> Fingerprint {
    Fingerprint::new(IMAGE).unwrap()
}

#[tokio::test]
async fn image_contents_are_copied_in() {
    let h = mixed_harness().await;
    h.silo
        .create_from_image(InstanceArgs::new(h.name("c1")).with_image(image()))
        .await
        .unwrap();

    let root = h.paths.container_mountpoint("default", "c1");
    assert_eq!(
        fs::read_to_string(root.join("etc/hostname")).unwrap(),
        "template\n"
    );
    // Directory pools never touch zfs
    assert!(!h.fake.exists("tank/containers/c1"));
}

#[test_log::test(tokio::test)]
async fn quota_is_unsupported_and_reverted() {
    let h = mixed_harness().await;
    let args = InstanceArgs::new(h.name("c1")).with_root_disk("default", Some(ByteSize::gibibytes(1)));

    let err = h.silo.create_empty(args).await.unwrap_err();
    assert!(matches!(err, SiloError::Unsupported { .. }), "{err}");
    assert!(h.names().is_empty());
    assert!(!h.paths.container_mountpoint("default", "c1").exists());
}

#[tokio::test]
async fn restore_any_snapshot() {
    let h = mixed_harness().await;
    let c1 = h.name("c1");
    h.silo.create_empty(InstanceArgs::new(c1.clone())).await.unwrap();
    let root = h.paths.container_mountpoint("default", "c1");

    fs::write(root.join("a"), "first").unwrap();
    h.silo
        .create_as_snapshot(h.name("c1/s0"), false)
        .await
        .unwrap();
    fs::write(root.join("b"), "second").unwrap();
    h.silo
        .create_as_snapshot(h.name("c1/s1"), false)
        .await
        .unwrap();

    h.silo.restore(&c1, "s0").await.unwrap();
    assert!(root.join("a").exists());
    assert!(!root.join("b").exists());
    assert_eq!(h.names(), ["c1", "c1/s0", "c1/s1"]);
}

#[tokio::test]
async fn copy_within_pool_duplicates_files() {
    let h = mixed_harness().await;
    let c1 = h.name("c1");
    h.silo.create_empty(InstanceArgs::new(c1.clone())).await.unwrap();
    let src = h.paths.container_mountpoint("default", "c1");
    fs::write(src.join("data"), "payload").unwrap();

    h.silo.copy(&c1, h.name("c2"), None, true).await.unwrap();
    let dst = h.paths.container_mountpoint("default", "c2");
    assert_eq!(fs::read_to_string(dst.join("data")).unwrap(), "payload");

    // The copy is independent of its source
    fs::write(src.join("data"), "changed").unwrap();
    assert_eq!(fs::read_to_string(dst.join("data")).unwrap(), "payload");
}

#[test_log::test(tokio::test)]
async fn copy_with_history_across_technologies() {
    let h = mixed_harness().await;
    let c1 = h.name("c1");
    h.silo.create_empty(InstanceArgs::new(c1.clone())).await.unwrap();
    let src = h.paths.container_mountpoint("default", "c1");

    fs::write(src.join("data"), "old").unwrap();
    h.silo
        .create_as_snapshot(h.name("c1/s0"), false)
        .await
        .unwrap();
    fs::write(src.join("data"), "new").unwrap();

    h.silo
        .copy(&c1, h.name("c2"), Some("fast"), false)
        .await
        .unwrap();

    assert_eq!(h.fake.snapshots("tank/containers/c2"), ["snapshot-s0"]);
    let dst = h.paths.container_mountpoint("fast", "c2");
    assert_eq!(fs::read_to_string(dst.join("data")).unwrap(), "new");
    assert_eq!(h.names(), ["c1", "c1/s0", "c2", "c2/s0"]);
    assert_eq!(h.silo.get(&h.name("c2")).await.unwrap().pool, "fast");
}

#[tokio::test]
async fn rename_carries_snapshots() {
    let h = mixed_harness().await;
    let c1 = h.name("c1");
    h.silo.create_empty(InstanceArgs::new(c1.clone())).await.unwrap();
    fs::write(h.paths.container_mountpoint("default", "c1").join("f"), "x").unwrap();
    h.silo
        .create_as_snapshot(h.name("c1/s0"), false)
        .await
        .unwrap();

    h.silo.rename(&c1, &h.name("c5")).await.unwrap();
    assert!(!h.paths.container_mountpoint("default", "c1").exists());
    assert!(h.paths.container_mountpoint("default", "c5").join("f").exists());
    assert_eq!(h.names(), ["c5", "c5/s0"]);

    h.silo.restore(&h.name("c5"), "s0").await.unwrap();
    h.silo.delete(&h.name("c5")).await.unwrap();
    assert!(h.names().is_empty());
    assert!(!h.paths.container_mountpoint("default", "c5").exists());
}

#[tokio::test]
async fn custom_volume_snapshots_and_cross_pool_copy() {
    let h = mixed_harness().await;
    h.silo
        .custom_volume_create("default", "data", None)
        .await
        .unwrap();
    let root = h.paths.custom_mountpoint("default", "data");
    fs::write(root.join("payload"), "first").unwrap();

    h.silo
        .custom_volume_snapshot("default", "data", "s0")
        .await
        .unwrap();
    fs::write(root.join("payload"), "second").unwrap();
    assert_eq!(
        h.silo.custom_volume_snapshots("default", "data").await.unwrap(),
        ["s0"]
    );

    h.silo
        .custom_volume_copy("default", "data", Some("fast"), "backup")
        .await
        .unwrap();
    assert!(h.fake.exists("tank/custom/backup"));
    let copied = h.paths.custom_mountpoint("fast", "backup");
    assert_eq!(fs::read_to_string(copied.join("payload")).unwrap(), "second");

    h.silo.custom_volume_delete("default", "data").await.unwrap();
    assert!(!root.exists());
    assert!(h.silo.custom_volumes("default").await.unwrap().is_empty());
    assert_eq!(h.silo.custom_volumes("fast").await.unwrap(), ["backup"]);
}
