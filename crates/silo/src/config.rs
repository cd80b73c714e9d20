//! Daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use silo_common::paths::SILO_ROOT;
use silo_common::{SiloError, SiloPaths, SiloResult};
use silo_storage::RetryPolicy;

/// Retry settings for tool invocations the storage technology reports as
/// busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay_ms: 500,
        }
    }
}

/// Daemon configuration options, read from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Var directory holding pools, catalog and images.
    pub root: PathBuf,
    /// Pool used when an instance has no root disk device.
    pub default_pool: String,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Executable used for stateful snapshots and live migration.
    pub checkpoint_tool: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: SILO_ROOT.clone(),
            default_pool: "default".to_string(),
            retry: RetryConfig::default(),
            checkpoint_tool: "criu".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Read a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> SiloResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SiloError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| SiloError::Config {
            message: format!("failed to parse {}: {e}", path.display()),
        })?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load the first configuration file found in the standard locations,
    /// or the defaults when there is none.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Config`] if a file exists but is invalid.
    pub fn discover() -> SiloResult<Self> {
        Self::search_paths()
            .into_iter()
            .find(|path| path.is_file())
            .map_or_else(|| Ok(Self::default()), |path| Self::load(&path))
    }

    /// Locations searched by [`DaemonConfig::discover`], in order.
    #[must_use]
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("silo/config.toml"));
        }
        paths.push(PathBuf::from("/etc/silo/config.toml"));
        paths
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Set the default pool.
    #[must_use]
    pub fn with_default_pool(mut self, pool: impl Into<String>) -> Self {
        self.default_pool = pool.into();
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.retry = RetryConfig { attempts, delay_ms };
        self
    }

    /// Set the checkpoint tool.
    #[must_use]
    pub fn with_checkpoint_tool(mut self, tool: impl Into<String>) -> Self {
        self.checkpoint_tool = tool.into();
        self
    }

    /// Filesystem layout under the root directory.
    #[must_use]
    pub fn paths(&self) -> SiloPaths {
        SiloPaths::with_root(&self.root)
    }

    /// Retry policy for the tool runner.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            delay: Duration::from_millis(self.retry.delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.root, *SILO_ROOT);
        assert_eq!(config.default_pool, "default");
        assert_eq!(config.checkpoint_tool, "criu");
        assert_eq!(config.retry_policy().attempts, 20);
    }

    #[test]
    fn builder_pattern() {
        let config = DaemonConfig::default()
            .with_root("/tmp/silo")
            .with_default_pool("fast")
            .with_retry(3, 10)
            .with_checkpoint_tool("/usr/sbin/criu");

        assert_eq!(config.paths().root, PathBuf::from("/tmp/silo"));
        assert_eq!(config.default_pool, "fast");
        assert_eq!(config.retry_policy().delay, Duration::from_millis(10));
        assert_eq!(config.checkpoint_tool, "/usr/sbin/criu");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "root = \"/srv/silo\"\n\n[retry]\nattempts = 5\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/silo"));
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.delay_ms, 500);
        assert_eq!(config.default_pool, "default");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "retry = 3").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(SiloError::Config { .. })
        ));
        assert!(matches!(
            DaemonConfig::load(&tmp.path().join("missing.toml")),
            Err(SiloError::Config { .. })
        ));
    }
}
