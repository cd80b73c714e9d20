//! Scoped rollback of multi-step operations.

use std::future::Future;

use futures::future::BoxFuture;
use silo_common::SiloResult;

type Step = Box<dyn FnOnce() -> BoxFuture<'static, SiloResult<()>> + Send>;

/// Undo steps registered as an operation makes progress.
///
/// Steps run in reverse registration order when the operation fails. A
/// successful operation calls [`Reverter::success`], which discards them.
/// A reverter dropped without either (the operation was cancelled or
/// panicked) spawns its steps on the current runtime.
#[derive(Default)]
pub struct Reverter {
    steps: Vec<(String, Step)>,
}

impl std::fmt::Debug for Reverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reverter")
            .field(
                "steps",
                &self.steps.iter().map(|(label, _)| label).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Reverter {
    /// Create an empty reverter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo step.
    pub fn add<F, Fut>(&mut self, label: impl Into<String>, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SiloResult<()>> + Send + 'static,
    {
        self.steps
            .push((label.into(), Box::new(move || Box::pin(step()))));
    }

    /// Number of registered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Commit: discard every step.
    pub fn success(mut self) {
        self.steps.clear();
    }

    /// Roll back: run every step, newest first. Step failures are logged
    /// and do not stop the remaining steps.
    pub async fn fail(mut self) {
        run(std::mem::take(&mut self.steps)).await;
    }

    /// Settle `result`: commit on success, roll back on failure.
    ///
    /// # Errors
    ///
    /// Returns `result`'s error after the rollback has run.
    pub async fn finish<T>(self, result: SiloResult<T>) -> SiloResult<T> {
        match result {
            Ok(value) => {
                self.success();
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(error = %err, steps = self.len(), "Reverting");
                self.fail().await;
                Err(err)
            }
        }
    }
}

async fn run(steps: Vec<(String, Step)>) {
    for (label, step) in steps.into_iter().rev() {
        if let Err(err) = step().await {
            tracing::warn!(step = %label, error = %err, "Revert step failed");
        }
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let steps = std::mem::take(&mut self.steps);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(steps = steps.len(), "Operation abandoned, reverting");
                handle.spawn(run(steps));
            }
            Err(_) => {
                tracing::error!(
                    steps = steps.len(),
                    "Operation abandoned outside a runtime, revert skipped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use silo_common::SiloError;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Step) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = log.clone();
        let make = move |label: &'static str| -> Step {
            let log = handle.clone();
            Box::new(move || {
                Box::pin(async move {
                    log.lock().push(label);
                    Ok(())
                })
            })
        };
        (log, make)
    }

    #[tokio::test]
    async fn fail_runs_steps_in_reverse() {
        let (log, make) = recorder();
        let mut revert = Reverter::new();
        for label in ["row", "volume", "mount"] {
            let step = make(label);
            revert.add(label, step);
        }
        revert.add("broken", || async { Err(SiloError::internal("boom")) });

        revert.fail().await;
        assert_eq!(*log.lock(), ["mount", "volume", "row"]);
    }

    #[tokio::test]
    async fn success_discards_steps() {
        let (log, make) = recorder();
        let mut revert = Reverter::new();
        revert.add("row", make("row"));
        assert_eq!(revert.len(), 1);

        revert.finish(Ok(())).await.unwrap();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn finish_reverts_and_returns_the_error() {
        let (log, make) = recorder();
        let mut revert = Reverter::new();
        revert.add("row", make("row"));

        let err = revert
            .finish::<()>(Err(SiloError::validation("bad")))
            .await
            .unwrap_err();
        assert!(matches!(err, SiloError::Validation { .. }));
        assert_eq!(*log.lock(), ["row"]);
    }

    #[tokio::test]
    async fn dropped_reverter_reverts_in_background() {
        let (log, make) = recorder();
        {
            let mut revert = Reverter::new();
            revert.add("row", make("row"));
        }
        for _ in 0..100 {
            if !log.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock(), ["row"]);
    }
}
