//! Single-flight coordination of mounts, unmounts and image imports.
//!
//! Concurrent requests for the same [`LeaseKey`] collapse into one physical
//! operation. The first caller owns the lease and performs the work; later
//! callers wait for the owner and observe its actual outcome.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use silo_common::{SiloError, SiloResult};
use tokio::sync::watch;

use crate::volume::LeaseKey;

/// `None` while in flight, then the owner's outcome.
type Outcome = Option<Result<(), String>>;

/// Process-wide table of in-flight leases.
#[derive(Debug, Default)]
pub struct MountCoordinator {
    leases: Mutex<HashMap<LeaseKey, watch::Receiver<Outcome>>>,
}

enum Role {
    Owner(watch::Sender<Outcome>),
    Waiter(watch::Receiver<Outcome>),
}

/// Removes the lease when the owner finishes, is cancelled, or panics.
struct LeaseGuard<'a> {
    coordinator: &'a MountCoordinator,
    key: &'a LeaseKey,
    tx: Option<watch::Sender<Outcome>>,
}

impl LeaseGuard<'_> {
    fn complete(mut self, outcome: Result<(), String>) {
        self.coordinator.leases.lock().remove(self.key);
        if let Some(tx) = self.tx.take() {
            // Waiters may all have gone away.
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.coordinator.leases.lock().remove(self.key);
        }
    }
}

impl MountCoordinator {
    /// Create an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leases currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.leases.lock().len()
    }

    /// Run `op` unless an operation with the same key is already in flight.
    ///
    /// The owner returns whatever `op` reports (whether it physically did
    /// anything). A waiter returns `Ok(false)` when the owner succeeded.
    ///
    /// # Errors
    ///
    /// The owner gets `op`'s error unchanged. Waiters get
    /// [`SiloError::Coalesced`] carrying the owner's error, or
    /// [`SiloError::Internal`] if the owner was cancelled.
    pub async fn run<F, Fut>(&self, key: LeaseKey, op: F) -> SiloResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SiloResult<bool>>,
    {
        let role = {
            let mut leases = self.leases.lock();
            if let Some(rx) = leases.get(&key) {
                Role::Waiter(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                leases.insert(key.clone(), rx);
                Role::Owner(tx)
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                tracing::debug!(%key, "Waiting on in-flight operation");
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|value| (*value).clone())
                    .map_err(|_| {
                        SiloError::internal(format!("{key} was abandoned by its owner"))
                    })?;
                match outcome {
                    Some(Ok(())) => Ok(false),
                    Some(Err(message)) => Err(SiloError::Coalesced {
                        key: key.to_string(),
                        message,
                    }),
                    None => Err(SiloError::internal(format!("{key} finished without an outcome"))),
                }
            }
            Role::Owner(tx) => {
                let guard = LeaseGuard {
                    coordinator: self,
                    key: &key,
                    tx: Some(tx),
                };
                let result = op().await;
                guard.complete(
                    result
                        .as_ref()
                        .map(|_| ())
                        .map_err(ToString::to_string),
                );
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{LeaseKind, VolumeRef};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key() -> LeaseKey {
        VolumeRef::container("default", "c1").lease(LeaseKind::Mount)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_operation() {
        let coordinator = Arc::new(MountCoordinator::new());
        let performed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let performed = performed.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .run(key(), || async move {
                        performed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(true)
                    })
                    .await
            }));
        }

        let mut by_me = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                by_me += 1;
            }
        }
        assert_eq!(performed.load(Ordering::SeqCst), by_me);
        assert!(by_me >= 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiters_observe_owner_failure() {
        let coordinator = Arc::new(MountCoordinator::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let owner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(key(), || async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(SiloError::internal("mount failed"))
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let waiter = coordinator.run(key(), || async { Ok(true) }).await;
        assert!(matches!(waiter, Err(SiloError::Coalesced { .. })));
        assert!(owner.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn cancelled_owner_releases_waiters() {
        let coordinator = Arc::new(MountCoordinator::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let owner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(key(), || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<()>().await;
                        Ok(true)
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(key(), || async { Ok(true) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        owner.abort();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SiloError::Internal { .. }) | Ok(true)));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_each_own_the_lease() {
        let coordinator = MountCoordinator::new();
        assert!(coordinator.run(key(), || async { Ok(true) }).await.unwrap());
        assert!(!coordinator.run(key(), || async { Ok(false) }).await.unwrap());
        assert_eq!(coordinator.in_flight(), 0);
    }
}
