//! Post-storage processing of a new instance's filesystem.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use silo_common::SiloResult;

use crate::catalog::InstanceRecord;

/// Why a template is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateTrigger {
    /// The instance was created empty or from an image.
    Create,
    /// The instance was copied or received from a migration peer.
    Copy,
}

impl fmt::Display for TemplateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Copy => "copy",
        })
    }
}

/// Filesystem processing run once a new instance's volume is mounted.
///
/// Failures abort the creation and revert it.
#[async_trait]
pub trait InstanceHooks: Send + Sync + fmt::Debug {
    /// Shift file ownership into the instance's id map (unprivileged
    /// instances only).
    async fn shift_rootfs(&self, record: &InstanceRecord, volume: &Path) -> SiloResult<()>;

    /// Render the image templates registered for `trigger`.
    async fn apply_template(
        &self,
        record: &InstanceRecord,
        volume: &Path,
        trigger: TemplateTrigger,
    ) -> SiloResult<()>;
}

/// Hooks that leave the filesystem untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl InstanceHooks for NoopHooks {
    async fn shift_rootfs(&self, record: &InstanceRecord, _volume: &Path) -> SiloResult<()> {
        tracing::debug!(instance = %record.name, "No id shifting configured");
        Ok(())
    }

    async fn apply_template(
        &self,
        record: &InstanceRecord,
        _volume: &Path,
        trigger: TemplateTrigger,
    ) -> SiloResult<()> {
        tracing::debug!(instance = %record.name, %trigger, "No templates configured");
        Ok(())
    }
}
