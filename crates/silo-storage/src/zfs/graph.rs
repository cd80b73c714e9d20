//! Origin/clone bookkeeping for deferred deletion.
//!
//! A dataset whose snapshots still back clones cannot be destroyed. It is
//! renamed under `deleted/` instead, and reclaimed by [`DatasetGraph::cleanup`]
//! once the last clone referencing it goes away. Every clone's origin is
//! strictly older than the clone, so the cascade always terminates.

use silo_common::{SiloError, SiloResult};

use super::tool::Zfs;
use crate::volume::COPY_PREFIX;

/// Namespace of soft-deleted datasets.
pub const DELETED: &str = "deleted";

/// Graph queries and deletion decisions over one pool's datasets.
#[derive(Debug)]
pub struct DatasetGraph<'a> {
    zfs: &'a Zfs,
}

impl<'a> DatasetGraph<'a> {
    /// Bind to a pool.
    #[must_use]
    pub const fn new(zfs: &'a Zfs) -> Self {
        Self { zfs }
    }

    /// Whether no clone was created from `path@snap`.
    pub async fn snapshot_removable(&self, path: &str, snap: &str) -> SiloResult<bool> {
        let clones = self.zfs.get(&format!("{path}@{snap}"), "clones").await?;
        Ok(clones.is_empty() || clones == "-")
    }

    /// Whether every snapshot of `path` is removable.
    pub async fn all_snapshots_removable(&self, path: &str) -> SiloResult<bool> {
        for snap in self.zfs.list_snapshots(path).await? {
            if !self.snapshot_removable(path, &snap).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The snapshot `path` was cloned from, relative to the pool root.
    pub async fn origin(&self, path: &str) -> SiloResult<Option<String>> {
        let origin = self.zfs.get(path, "origin").await?;
        if origin.is_empty() || origin == "-" {
            return Ok(None);
        }
        Ok(self.zfs.relative(&origin).map(ToString::to_string))
    }

    /// Destroy `path` and return its origin.
    ///
    /// Fails with [`SiloError::NotRemovable`] while any of its snapshots
    /// backs a clone.
    pub async fn destroy(&self, path: &str) -> SiloResult<Option<String>> {
        if !self.all_snapshots_removable(path).await? {
            return Err(SiloError::NotRemovable {
                dataset: path.to_string(),
            });
        }
        let origin = self.origin(path).await?;
        self.zfs.destroy(path).await?;
        Ok(origin)
    }

    /// Delete a filesystem dataset, deferring it while clones depend on it.
    ///
    /// `kind` is the dataset's namespace (`containers`, `custom`, ...).
    /// Returns `true` if the dataset was physically destroyed.
    pub async fn delete_filesystem(&self, path: &str, kind: &str) -> SiloResult<bool> {
        match self.destroy(path).await {
            Ok(origin) => {
                tracing::debug!(dataset = path, ?origin, "Destroyed dataset");
                if let Some(origin) = origin {
                    self.cleanup(&origin).await?;
                }
                Ok(true)
            }
            Err(SiloError::NotRemovable { .. }) => {
                let target = format!("{DELETED}/{kind}/{}", uuid::Uuid::new_v4());
                self.zfs.set(path, "mountpoint", "none").await?;
                self.zfs.rename(path, &target).await?;
                tracing::info!(dataset = path, deferred_as = %target, "Dataset has dependent clones, deferring deletion");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Destroy `path@snap` if removable, otherwise rename it out of the
    /// user history so the clone's origin stays valid.
    ///
    /// Returns `true` if the snapshot was physically destroyed.
    pub async fn delete_snapshot(&self, path: &str, snap: &str) -> SiloResult<bool> {
        if self.snapshot_removable(path, snap).await? {
            self.zfs.destroy(&format!("{path}@{snap}")).await?;
            return Ok(true);
        }
        let parked = format!("{COPY_PREFIX}{}", uuid::Uuid::new_v4());
        self.zfs.rename_snapshot(path, snap, &parked).await?;
        tracing::info!(dataset = path, snapshot = snap, parked_as = %parked, "Snapshot has dependent clones, deferring deletion");
        Ok(false)
    }

    /// Reclaim whatever `path` (an origin that just lost a clone) no longer
    /// needs, cascading towards older origins.
    pub async fn cleanup(&self, path: &str) -> SiloResult<()> {
        let mut next = Some(path.to_string());
        while let Some(path) = next.take() {
            next = self.cleanup_step(&path).await?;
        }
        Ok(())
    }

    async fn cleanup_step(&self, path: &str) -> SiloResult<Option<String>> {
        let copy_marker = format!("@{COPY_PREFIX}");
        if !path.starts_with(&format!("{DELETED}/")) {
            let live = path.starts_with("containers/") || path.starts_with("custom/");
            if live && path.contains(&copy_marker) {
                let (fs, snap) = path.split_once('@').unwrap_or((path, ""));
                if self.snapshot_removable(fs, snap).await? {
                    self.zfs.destroy(path).await?;
                    tracing::debug!(snapshot = path, "Removed copy snapshot");
                }
            }
            return Ok(None);
        }

        if let Some((fs, snap)) = path.split_once('@') {
            if !self.snapshot_removable(fs, snap).await? {
                return Ok(None);
            }
            self.zfs.destroy(path).await?;
            tracing::debug!(snapshot = path, "Reclaimed deferred snapshot");
            if self.zfs.list_snapshots(fs).await?.is_empty() {
                return Ok(Some(fs.to_string()));
            }
            return Ok(None);
        }

        match self.destroy(path).await {
            Ok(origin) => {
                tracing::info!(dataset = path, "Reclaimed deferred dataset");
                Ok(origin)
            }
            Err(SiloError::NotRemovable { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runner::RetryPolicy;
    use crate::testing::FakeZfs;

    async fn pool() -> (FakeZfs, Zfs) {
        let fake = FakeZfs::new();
        fake.add_pool("tank");
        let zfs = Zfs::new(Arc::new(fake.clone()), "tank", RetryPolicy::once());
        zfs.create("containers/c1", &[]).await.unwrap();
        zfs.snapshot("containers/c1", "snapshot-s0").await.unwrap();
        (fake, zfs)
    }

    #[tokio::test]
    async fn cloned_dataset_is_not_removable() {
        let (_fake, zfs) = pool().await;
        zfs.clone_snapshot("containers/c1", "snapshot-s0", "containers/c2", "none")
            .await
            .unwrap();

        let graph = DatasetGraph::new(&zfs);
        assert!(!graph.snapshot_removable("containers/c1", "snapshot-s0").await.unwrap());
        let err = graph.destroy("containers/c1").await.unwrap_err();
        assert!(
            matches!(&err, SiloError::NotRemovable { dataset } if dataset == "containers/c1"),
            "{err}"
        );
        assert_eq!(
            graph.origin("containers/c2").await.unwrap().as_deref(),
            Some("containers/c1@snapshot-s0")
        );
        assert_eq!(
            graph.destroy("containers/c2").await.unwrap().as_deref(),
            Some("containers/c1@snapshot-s0")
        );
        assert_eq!(graph.destroy("containers/c1").await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn parked_snapshot_goes_with_its_clone() {
        let (fake, zfs) = pool().await;
        zfs.clone_snapshot("containers/c1", "snapshot-s0", "containers/c2", "none")
            .await
            .unwrap();

        let graph = DatasetGraph::new(&zfs);
        assert!(!graph.delete_snapshot("containers/c1", "snapshot-s0").await.unwrap());
        let parked = fake.snapshots("tank/containers/c1");
        assert_eq!(parked.len(), 1);
        assert!(parked[0].starts_with(COPY_PREFIX), "{parked:?}");

        assert!(graph.delete_filesystem("containers/c2", "containers").await.unwrap());
        assert!(fake.snapshots("tank/containers/c1").is_empty());
        assert!(fake.exists("tank/containers/c1"));
    }

    #[test_log::test(tokio::test)]
    async fn deferred_chain_is_reclaimed_oldest_last() {
        let (fake, zfs) = pool().await;
        zfs.clone_snapshot("containers/c1", "snapshot-s0", "containers/c2", "none")
            .await
            .unwrap();
        zfs.snapshot("containers/c2", "snapshot-s1").await.unwrap();
        zfs.clone_snapshot("containers/c2", "snapshot-s1", "containers/c3", "none")
            .await
            .unwrap();

        let graph = DatasetGraph::new(&zfs);
        assert!(!graph.delete_filesystem("containers/c1", "containers").await.unwrap());
        assert!(!graph.delete_filesystem("containers/c2", "containers").await.unwrap());
        let deferred = fake.datasets_under("tank/deleted/containers");
        assert_eq!(deferred.len(), 2);
        for ds in &deferred {
            assert_eq!(fake.property(ds, "mountpoint").as_deref(), Some("none"));
        }

        assert!(graph.delete_filesystem("containers/c3", "containers").await.unwrap());
        assert!(fake.datasets_under("tank/deleted/containers").is_empty());
        assert!(fake.datasets_under("tank/containers").is_empty());
    }

    #[tokio::test]
    async fn plain_datasets_are_destroyed_outright() {
        let (fake, zfs) = pool().await;
        let graph = DatasetGraph::new(&zfs);
        assert!(graph.all_snapshots_removable("containers/c1").await.unwrap());
        assert!(graph.delete_filesystem("containers/c1", "containers").await.unwrap());
        assert!(!fake.exists("tank/containers/c1"));
        assert!(!fake.exists("tank/deleted"));
    }
}
