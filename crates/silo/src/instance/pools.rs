//! Storage pool administration.

use std::collections::BTreeMap;

use silo_common::{SiloError, SiloResult};
use silo_storage::{StoragePool, new_driver};

use super::Orchestrator;
use crate::events::{LifecycleEvent, now};

fn validate_pool_name(name: &str) -> SiloResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', ' '])
    {
        return Err(SiloError::validation(format!(
            "Invalid storage pool name {name:?}"
        )));
    }
    Ok(())
}

impl Orchestrator {
    /// Register every pool in the catalog, verifying each is present on
    /// disk.
    ///
    /// Pools that fail their check are still registered so they can be
    /// inspected and deleted; the failure is logged.
    ///
    /// # Errors
    ///
    /// Returns catalog errors, or an error for pools with an unknown driver.
    pub async fn load_pools(&self) -> SiloResult<()> {
        for pool in self.catalog.pool_list().await? {
            let name = pool.name.clone();
            let driver = new_driver(pool, self.driver_context())?;
            if let Err(err) = driver.pool_check().await {
                tracing::warn!(pool = %name, error = %err, "Storage pool is unavailable");
            }
            self.drivers.write().insert(name, driver);
        }
        tracing::debug!(pools = self.drivers.read().len(), "Loaded storage pools");
        Ok(())
    }

    /// Pools currently registered, ordered by name.
    #[must_use]
    pub fn pools(&self) -> Vec<StoragePool> {
        let mut pools: Vec<_> = self
            .drivers
            .read()
            .values()
            .map(|driver| driver.pool())
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    /// Create a pool on disk and record it.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::AlreadyExists`] for a known pool name, or the
    /// driver's error. A pool whose row cannot be written is removed from
    /// disk again.
    #[tracing::instrument(skip_all, fields(pool = %pool.name, driver = %pool.driver))]
    pub async fn pool_create(&self, pool: StoragePool) -> SiloResult<StoragePool> {
        validate_pool_name(&pool.name)?;
        if self.drivers.read().contains_key(&pool.name) {
            return Err(SiloError::AlreadyExists {
                what: format!("storage pool {}", pool.name),
            });
        }

        let driver = new_driver(pool, self.driver_context())?;
        driver.pool_create().await?;

        let pool = driver.pool();
        if let Err(err) = self.catalog.pool_create(&pool).await {
            if let Err(cleanup) = driver.pool_delete().await {
                tracing::warn!(error = %cleanup, "Failed to remove pool after catalog failure");
            }
            return Err(err);
        }

        self.drivers.write().insert(pool.name.clone(), driver);
        tracing::info!("Created storage pool");
        self.publish(LifecycleEvent::PoolCreated {
            name: pool.name.clone(),
            timestamp: now(),
        });
        Ok(pool)
    }

    /// Destroy an unused pool.
    ///
    /// # Errors
    ///
    /// Returns a validation error while instances still live on the pool.
    #[tracing::instrument(skip(self))]
    pub async fn pool_delete(&self, name: &str) -> SiloResult<()> {
        let driver = self.driver(name)?;
        let mut users: Vec<_> = self
            .catalog
            .list()
            .await?
            .into_iter()
            .filter(|record| record.pool == name)
            .map(|record| record.name.to_string())
            .collect();
        users.extend(
            self.custom_volumes(name)
                .await?
                .into_iter()
                .map(|volume| format!("volume {volume}")),
        );
        if !users.is_empty() {
            return Err(SiloError::validation(format!(
                "Storage pool {name} is still used by {}",
                users.join(", ")
            )));
        }

        driver.pool_delete().await?;
        self.catalog.pool_delete(name).await?;
        self.drivers.write().remove(name);
        tracing::info!("Deleted storage pool");
        self.publish(LifecycleEvent::PoolDeleted {
            name: name.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Apply configuration changes to a pool.
    ///
    /// # Errors
    ///
    /// Returns the driver's validation error for immutable keys or invalid
    /// values; nothing is changed in that case.
    #[tracing::instrument(skip(self, changes))]
    pub async fn pool_update(
        &self,
        name: &str,
        changes: &BTreeMap<String, String>,
    ) -> SiloResult<StoragePool> {
        let driver = self.driver(name)?;

        // The live driver only changes once the row is written.
        let candidate = new_driver(driver.pool(), self.driver_context())?;
        candidate.pool_update(changes)?;
        let pool = candidate.pool();
        self.catalog.pool_update(&pool).await?;
        driver.pool_update(changes)?;

        tracing::info!(keys = changes.len(), "Updated storage pool");
        self.publish(LifecycleEvent::PoolUpdated {
            name: name.to_string(),
            timestamp: now(),
        });
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_names() {
        assert!(validate_pool_name("default").is_ok());
        assert!(validate_pool_name("fast-ssd").is_ok());
        for bad in ["", ".hidden", "a/b", "two words"] {
            assert!(validate_pool_name(bad).is_err(), "{bad:?}");
        }
    }
}
