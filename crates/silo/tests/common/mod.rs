//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use silo::catalog::MemoryCatalog;
use silo::instance::Orchestrator;
use silo::runtime::InstanceRuntime;
use silo_common::{InstanceName, SiloPaths, SiloResult};
use silo_storage::testing::FakeZfs;
use silo_storage::{RetryPolicy, StoragePool};
use tempfile::TempDir;

pub const IMAGE: &str = "abc123";

/// An orchestrator over a fake `zfs` and an in-memory catalog.
pub struct Harness {
    pub tmp: TempDir,
    pub paths: SiloPaths,
    pub fake: FakeZfs,
    pub catalog: Arc<MemoryCatalog>,
    pub silo: Orchestrator,
}

impl Harness {
    pub fn name(&self, name: &str) -> InstanceName {
        InstanceName::new(name).unwrap()
    }

    pub fn names(&self) -> Vec<String> {
        self.catalog.names()
    }
}

/// Write a gzip image tarball holding `/etc/hostname`.
pub fn write_image(paths: &SiloPaths, fingerprint: &str) -> PathBuf {
    let tarball = paths.image_tarball(fingerprint);
    let file = std::fs::File::create(&tarball).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let data = b"template\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "etc/hostname", &data[..])
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap();
    tarball
}

fn sandbox() -> (TempDir, SiloPaths) {
    let tmp = tempfile::tempdir().unwrap();
    let paths = SiloPaths::with_root(tmp.path());
    paths.create_dirs().unwrap();
    write_image(&paths, IMAGE);
    (tmp, paths)
}

/// A harness with pool `default` on the fake pool `tank`.
pub async fn zfs_harness() -> Harness {
    zfs_harness_with(|silo| silo).await
}

/// Like [`zfs_harness`], letting the caller adjust the orchestrator.
pub async fn zfs_harness_with(configure: impl FnOnce(Orchestrator) -> Orchestrator) -> Harness {
    let (tmp, paths) = sandbox();
    let fake = FakeZfs::new();
    fake.add_pool("tank");
    let catalog = Arc::new(MemoryCatalog::new());
    let silo = configure(
        Orchestrator::new(catalog.clone(), Arc::new(fake.clone()), paths.clone())
            .with_retry(RetryPolicy::once()),
    );
    silo.pool_create(StoragePool::new("default", "zfs").with_config("source", "tank"))
        .await
        .unwrap();
    Harness {
        tmp,
        paths,
        fake,
        catalog,
        silo,
    }
}

/// A harness with the directory pool `default`, plus the zfs pool `fast` on
/// the fake pool `tank`.
pub async fn mixed_harness() -> Harness {
    let (tmp, paths) = sandbox();
    let fake = FakeZfs::new();
    fake.add_pool("tank");
    let catalog = Arc::new(MemoryCatalog::new());
    let silo = Orchestrator::new(catalog.clone(), Arc::new(fake.clone()), paths.clone())
        .with_retry(RetryPolicy::once());
    silo.pool_create(StoragePool::new("default", "dir"))
        .await
        .unwrap();
    silo.pool_create(StoragePool::new("fast", "zfs").with_config("source", "tank"))
        .await
        .unwrap();
    Harness {
        tmp,
        paths,
        fake,
        catalog,
        silo,
    }
}

/// Runtime whose instances are all running; checkpoints write a dump file.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    pub checkpoints: Mutex<Vec<(String, PathBuf, bool)>>,
}

#[async_trait]
impl InstanceRuntime for RecordingRuntime {
    async fn is_running(&self, _name: &InstanceName) -> SiloResult<bool> {
        Ok(true)
    }

    fn checkpoint_supported(&self) -> bool {
        true
    }

    async fn checkpoint(&self, name: &InstanceName, dir: &Path, stop: bool) -> SiloResult<()> {
        tokio::fs::write(dir.join("pages-1.img"), b"memory").await?;
        self.checkpoints
            .lock()
            .push((name.to_string(), dir.to_path_buf(), stop));
        Ok(())
    }
}
