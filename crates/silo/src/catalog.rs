//! Instance and pool rows.
//!
//! The orchestrator only needs row CRUD from the catalog. [`FileCatalog`]
//! keeps one JSON file per row under the var directory; [`MemoryCatalog`]
//! keeps rows in memory and can be told to fail, for exercising revert
//! paths.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use silo_common::{Fingerprint, InstanceName, SNAPSHOT_DELIMITER, SiloError, SiloResult};
use silo_storage::StoragePool;

use crate::args::{Device, InstanceArgs, InstanceKind};

/// A persisted instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Row id, increasing in creation order.
    pub id: u64,
    /// Instance name.
    pub name: InstanceName,
    /// Container or snapshot.
    pub kind: InstanceKind,
    /// Pool holding the instance's volume.
    pub pool: String,
    /// Applied profiles.
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Devices by name.
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    /// Instance configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Image the instance was built from.
    #[serde(default)]
    pub base_image: Option<Fingerprint>,
    /// Whether the snapshot carries runtime state.
    #[serde(default)]
    pub stateful: bool,
    /// Whether the instance is removed when stopped.
    #[serde(default)]
    pub ephemeral: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Build an unsaved row (id 0) from validated arguments.
    #[must_use]
    pub fn from_args(args: &InstanceArgs, pool: &str) -> Self {
        Self {
            id: 0,
            name: args.name.clone(),
            kind: args.kind,
            pool: pool.to_string(),
            profiles: args.profiles.clone(),
            devices: args.devices.clone(),
            config: args.config.clone(),
            base_image: args.base_image.clone(),
            stateful: args.stateful,
            ephemeral: args.ephemeral,
            created_at: Utc::now(),
        }
    }

    /// Arguments that recreate this row under another name.
    #[must_use]
    pub fn to_args(&self, name: InstanceName) -> InstanceArgs {
        let mut args = InstanceArgs::new(name)
            .with_profiles(self.profiles.clone())
            .with_stateful(self.stateful)
            .with_ephemeral(self.ephemeral);
        args.devices = self.devices.clone();
        args.config = self.config.clone();
        args.base_image = self.base_image.clone();
        args
    }

    /// Whether this row is a snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.kind == InstanceKind::Snapshot
    }
}

/// Row storage consumed by the orchestrator.
///
/// Every failure is treated exactly like a storage failure: the pathway
/// that hit it reverts everything it created.
#[async_trait]
pub trait Catalog: Send + Sync + fmt::Debug {
    /// Insert an instance row and return its id.
    ///
    /// Fails with [`SiloError::AlreadyExists`] if the name is taken.
    async fn create(&self, record: InstanceRecord) -> SiloResult<u64>;

    /// Fetch an instance row.
    async fn get(&self, name: &InstanceName) -> SiloResult<InstanceRecord>;

    /// Remove an instance row.
    async fn delete(&self, name: &InstanceName) -> SiloResult<()>;

    /// Rename an instance row.
    async fn rename(&self, old: &InstanceName, new: &InstanceName) -> SiloResult<()>;

    /// Every instance row (containers and snapshots), ordered by id.
    async fn list(&self) -> SiloResult<Vec<InstanceRecord>>;

    /// Snapshot rows of a container, oldest first.
    async fn snapshots(&self, parent: &InstanceName) -> SiloResult<Vec<InstanceRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.is_snapshot() && record.name.parent() == parent.as_str())
            .collect())
    }

    /// Insert a pool row.
    async fn pool_create(&self, pool: &StoragePool) -> SiloResult<()>;

    /// Fetch a pool row.
    async fn pool_get(&self, name: &str) -> SiloResult<StoragePool>;

    /// Replace a pool row.
    async fn pool_update(&self, pool: &StoragePool) -> SiloResult<()>;

    /// Remove a pool row.
    async fn pool_delete(&self, name: &str) -> SiloResult<()>;

    /// Every pool row, ordered by name.
    async fn pool_list(&self) -> SiloResult<Vec<StoragePool>>;
}

/// Catalog keeping one JSON file per row.
///
/// Layout under the catalog directory:
/// - `instances/<name>.json` (snapshot delimiters become `@`)
/// - `pools/<name>.json`
/// - `next-id`
#[derive(Debug)]
pub struct FileCatalog {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCatalog {
    /// Create a catalog rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of an instance row.
    #[must_use]
    pub fn instance_path(&self, name: &InstanceName) -> PathBuf {
        self.dir.join("instances").join(format!(
            "{}.json",
            name.as_str().replace(SNAPSHOT_DELIMITER, "@")
        ))
    }

    fn pool_path(&self, name: &str) -> PathBuf {
        self.dir.join("pools").join(format!("{name}.json"))
    }

    async fn next_id(&self) -> SiloResult<u64> {
        let path = self.dir.join("next-id");
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|e| SiloError::Serialization(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 1,
            Err(err) => return Err(err.into()),
        };
        write_file(&path, (current + 1).to_string().as_bytes()).await?;
        Ok(current)
    }

    async fn read_dir_json<T>(&self, dir: &Path) -> SiloResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut rows = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(rows),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let json = tokio::fs::read(&path).await?;
                rows.push(serde_json::from_slice(&json)?);
            }
        }
        Ok(rows)
    }
}

async fn write_file(path: &Path, data: &[u8]) -> SiloResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn instance_not_found(name: &InstanceName) -> SiloError {
    SiloError::InstanceNotFound {
        name: name.to_string(),
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn create(&self, mut record: InstanceRecord) -> SiloResult<u64> {
        let _guard = self.write_lock.lock().await;
        let path = self.instance_path(&record.name);
        if tokio::fs::try_exists(&path).await? {
            return Err(SiloError::AlreadyExists {
                what: format!("instance {}", record.name),
            });
        }

        record.id = self.next_id().await?;
        write_file(&path, &serde_json::to_vec_pretty(&record)?).await?;
        tracing::debug!(
            instance = %record.name,
            id = record.id,
            path = %path.display(),
            "Saved instance row"
        );
        Ok(record.id)
    }

    async fn get(&self, name: &InstanceName) -> SiloResult<InstanceRecord> {
        let path = self.instance_path(name);
        match tokio::fs::read(&path).await {
            Ok(json) => Ok(serde_json::from_slice(&json)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(instance_not_found(name)),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, name: &InstanceName) -> SiloResult<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.instance_path(name)).await {
            Ok(()) => {
                tracing::debug!(instance = %name, "Deleted instance row");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(instance_not_found(name)),
            Err(err) => Err(err.into()),
        }
    }

    async fn rename(&self, old: &InstanceName, new: &InstanceName) -> SiloResult<()> {
        let _guard = self.write_lock.lock().await;
        let new_path = self.instance_path(new);
        if tokio::fs::try_exists(&new_path).await? {
            return Err(SiloError::AlreadyExists {
                what: format!("instance {new}"),
            });
        }

        let mut record = self.get(old).await?;
        record.name = new.clone();
        write_file(&new_path, &serde_json::to_vec_pretty(&record)?).await?;
        tokio::fs::remove_file(self.instance_path(old)).await?;
        tracing::debug!(old = %old, new = %new, "Renamed instance row");
        Ok(())
    }

    async fn list(&self) -> SiloResult<Vec<InstanceRecord>> {
        let mut records: Vec<InstanceRecord> =
            self.read_dir_json(&self.dir.join("instances")).await?;
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn pool_create(&self, pool: &StoragePool) -> SiloResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.pool_path(&pool.name);
        if tokio::fs::try_exists(&path).await? {
            return Err(SiloError::AlreadyExists {
                what: format!("storage pool {}", pool.name),
            });
        }
        write_file(&path, &serde_json::to_vec_pretty(pool)?).await
    }

    async fn pool_get(&self, name: &str) -> SiloResult<StoragePool> {
        match tokio::fs::read(self.pool_path(name)).await {
            Ok(json) => Ok(serde_json::from_slice(&json)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(SiloError::PoolNotFound {
                name: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn pool_update(&self, pool: &StoragePool) -> SiloResult<()> {
        let _guard = self.write_lock.lock().await;
        self.pool_get(&pool.name).await?;
        write_file(&self.pool_path(&pool.name), &serde_json::to_vec_pretty(pool)?).await
    }

    async fn pool_delete(&self, name: &str) -> SiloResult<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.pool_path(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(SiloError::PoolNotFound {
                name: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn pool_list(&self) -> SiloResult<Vec<StoragePool>> {
        let mut pools: Vec<StoragePool> = self.read_dir_json(&self.dir.join("pools")).await?;
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }
}

/// Catalog operations [`MemoryCatalog`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogOp {
    /// [`Catalog::create`].
    Create,
    /// [`Catalog::delete`].
    Delete,
    /// [`Catalog::rename`] (matched against the new name).
    Rename,
}

#[derive(Debug, Default)]
struct MemoryState {
    instances: BTreeMap<InstanceName, InstanceRecord>,
    pools: BTreeMap<String, StoragePool>,
    next_id: u64,
    failures: HashSet<(CatalogOp, String)>,
}

impl MemoryState {
    fn check(&self, op: CatalogOp, name: &InstanceName) -> SiloResult<()> {
        if self.failures.contains(&(op, name.to_string())) {
            return Err(SiloError::internal(format!(
                "injected catalog failure: {op:?} {name}"
            )));
        }
        Ok(())
    }
}

/// Catalog holding rows in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail for the instance `name` from now on.
    pub fn fail(&self, op: CatalogOp, name: &str) {
        self.state.lock().failures.insert((op, name.to_string()));
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Names of every row, in id order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut records: Vec<_> = state.instances.values().collect();
        records.sort_by_key(|record| record.id);
        records.iter().map(|record| record.name.to_string()).collect()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn create(&self, mut record: InstanceRecord) -> SiloResult<u64> {
        let mut state = self.state.lock();
        state.check(CatalogOp::Create, &record.name)?;
        if state.instances.contains_key(&record.name) {
            return Err(SiloError::AlreadyExists {
                what: format!("instance {}", record.name),
            });
        }
        state.next_id += 1;
        record.id = state.next_id;
        let id = record.id;
        state.instances.insert(record.name.clone(), record);
        Ok(id)
    }

    async fn get(&self, name: &InstanceName) -> SiloResult<InstanceRecord> {
        self.state
            .lock()
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| instance_not_found(name))
    }

    async fn delete(&self, name: &InstanceName) -> SiloResult<()> {
        let mut state = self.state.lock();
        state.check(CatalogOp::Delete, name)?;
        state
            .instances
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| instance_not_found(name))
    }

    async fn rename(&self, old: &InstanceName, new: &InstanceName) -> SiloResult<()> {
        let mut state = self.state.lock();
        state.check(CatalogOp::Rename, new)?;
        if state.instances.contains_key(new) {
            return Err(SiloError::AlreadyExists {
                what: format!("instance {new}"),
            });
        }
        let mut record = state
            .instances
            .remove(old)
            .ok_or_else(|| instance_not_found(old))?;
        record.name = new.clone();
        state.instances.insert(new.clone(), record);
        Ok(())
    }

    async fn list(&self) -> SiloResult<Vec<InstanceRecord>> {
        let mut records: Vec<_> = self.state.lock().instances.values().cloned().collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn pool_create(&self, pool: &StoragePool) -> SiloResult<()> {
        let mut state = self.state.lock();
        if state.pools.contains_key(&pool.name) {
            return Err(SiloError::AlreadyExists {
                what: format!("storage pool {}", pool.name),
            });
        }
        state.pools.insert(pool.name.clone(), pool.clone());
        Ok(())
    }

    async fn pool_get(&self, name: &str) -> SiloResult<StoragePool> {
        self.state
            .lock()
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| SiloError::PoolNotFound {
                name: name.to_string(),
            })
    }

    async fn pool_update(&self, pool: &StoragePool) -> SiloResult<()> {
        let mut state = self.state.lock();
        match state.pools.get_mut(&pool.name) {
            Some(row) => {
                *row = pool.clone();
                Ok(())
            }
            None => Err(SiloError::PoolNotFound {
                name: pool.name.clone(),
            }),
        }
    }

    async fn pool_delete(&self, name: &str) -> SiloResult<()> {
        self.state
            .lock()
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SiloError::PoolNotFound {
                name: name.to_string(),
            })
    }

    async fn pool_list(&self) -> SiloResult<Vec<StoragePool>> {
        Ok(self.state.lock().pools.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str) -> InstanceRecord {
        let args = InstanceArgs::new(InstanceName::new(name).unwrap());
        InstanceRecord::from_args(&args, "default")
    }

    fn name(name: &str) -> InstanceName {
        InstanceName::new(name).unwrap()
    }

    async fn exercise(catalog: &dyn Catalog) {
        let c1 = catalog.create(record("c1")).await.unwrap();
        let snap1 = catalog.create(record("c1/snap1")).await.unwrap();
        let snap0 = catalog.create(record("c1/snap0")).await.unwrap();
        catalog.create(record("c2")).await.unwrap();
        assert!(c1 < snap1 && snap1 < snap0);

        assert!(matches!(
            catalog.create(record("c1")).await,
            Err(SiloError::AlreadyExists { .. })
        ));

        let snapshots: Vec<_> = catalog
            .snapshots(&name("c1"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(snapshots, ["c1/snap1", "c1/snap0"]);

        catalog.rename(&name("c2"), &name("c3")).await.unwrap();
        assert!(catalog.get(&name("c2")).await.is_err());
        assert_eq!(catalog.get(&name("c3")).await.unwrap().name, name("c3"));
        assert!(matches!(
            catalog.rename(&name("c3"), &name("c1")).await,
            Err(SiloError::AlreadyExists { .. })
        ));

        catalog.delete(&name("c1/snap1")).await.unwrap();
        assert!(matches!(
            catalog.delete(&name("c1/snap1")).await,
            Err(SiloError::InstanceNotFound { .. })
        ));
        assert_eq!(catalog.list().await.unwrap().len(), 3);

        let pool = StoragePool::new("default", "dir");
        catalog.pool_create(&pool).await.unwrap();
        assert!(catalog.pool_create(&pool).await.is_err());
        catalog
            .pool_update(&pool.clone().with_config("volume.size", "1GB"))
            .await
            .unwrap();
        assert_eq!(
            catalog.pool_get("default").await.unwrap().get("volume.size"),
            Some("1GB")
        );
        assert_eq!(catalog.pool_list().await.unwrap().len(), 1);
        catalog.pool_delete("default").await.unwrap();
        assert!(matches!(
            catalog.pool_get("default").await,
            Err(SiloError::PoolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn file_catalog_rows() {
        let temp = tempdir().unwrap();
        let catalog = FileCatalog::new(temp.path());
        exercise(&catalog).await;
        assert!(
            catalog
                .instance_path(&name("c1/snap0"))
                .ends_with("instances/c1@snap0.json")
        );
    }

    #[tokio::test]
    async fn memory_catalog_rows() {
        exercise(&MemoryCatalog::new()).await;
    }

    #[tokio::test]
    async fn file_catalog_survives_reopen() {
        let temp = tempdir().unwrap();
        let first = FileCatalog::new(temp.path());
        let id = first.create(record("c1")).await.unwrap();

        let second = FileCatalog::new(temp.path());
        assert_eq!(second.get(&name("c1")).await.unwrap().id, id);
        assert!(second.create(record("c2")).await.unwrap() > id);
    }

    #[tokio::test]
    async fn injected_failures() {
        let catalog = MemoryCatalog::new();
        catalog.fail(CatalogOp::Create, "c1/snap0");

        catalog.create(record("c1")).await.unwrap();
        assert!(catalog.create(record("c1/snap0")).await.is_err());

        catalog.clear_failures();
        catalog.create(record("c1/snap0")).await.unwrap();
        assert_eq!(catalog.names(), ["c1", "c1/snap0"]);
    }
}
