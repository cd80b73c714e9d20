//! Process-side collaborator: instance state and checkpointing.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use silo_common::{InstanceName, SiloError, SiloResult};

/// What the orchestrator needs from whatever runs instances.
#[async_trait]
pub trait InstanceRuntime: Send + Sync + fmt::Debug {
    /// Whether the instance is running.
    async fn is_running(&self, name: &InstanceName) -> SiloResult<bool>;

    /// Whether checkpoints can be taken on this host.
    fn checkpoint_supported(&self) -> bool;

    /// Dump the running instance's state into `dir`, stopping it afterwards
    /// when `stop` is set.
    async fn checkpoint(&self, name: &InstanceName, dir: &Path, stop: bool) -> SiloResult<()>;
}

/// Runtime for hosts where silo manages storage only.
///
/// No instance is ever running, so stateful snapshots and live migration
/// are refused.
#[derive(Debug, Clone)]
pub struct NullRuntime {
    checkpoint_tool: String,
}

impl NullRuntime {
    /// Create a runtime that reports `checkpoint_tool` availability.
    pub fn new(checkpoint_tool: impl Into<String>) -> Self {
        Self {
            checkpoint_tool: checkpoint_tool.into(),
        }
    }
}

impl Default for NullRuntime {
    fn default() -> Self {
        Self::new("criu")
    }
}

#[async_trait]
impl InstanceRuntime for NullRuntime {
    async fn is_running(&self, _name: &InstanceName) -> SiloResult<bool> {
        Ok(false)
    }

    fn checkpoint_supported(&self) -> bool {
        find_executable(&self.checkpoint_tool).is_some()
    }

    async fn checkpoint(&self, name: &InstanceName, _dir: &Path, _stop: bool) -> SiloResult<()> {
        Err(SiloError::Unsupported {
            feature: format!("checkpointing {name} without an instance runtime"),
        })
    }
}

/// Locate an executable by absolute path or on `PATH`.
#[must_use]
pub fn find_executable(tool: &str) -> Option<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_executables() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = tmp.path().join("dump");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        assert!(find_executable(tool.to_str().unwrap()).is_none());

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_executable(tool.to_str().unwrap()), Some(tool));
        assert!(find_executable("definitely-not-a-real-tool-name").is_none());
    }

    #[tokio::test]
    async fn null_runtime_refuses_checkpoints() {
        let runtime = NullRuntime::default();
        let name = InstanceName::new("c1").unwrap();
        assert!(!runtime.is_running(&name).await.unwrap());
        assert!(
            runtime
                .checkpoint(&name, Path::new("/tmp"), false)
                .await
                .is_err()
        );
    }
}
