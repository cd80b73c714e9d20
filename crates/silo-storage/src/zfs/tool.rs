//! Shapes `zfs` and `zpool` invocations.
//!
//! Dataset arguments are relative to the pool's on-disk root
//! (`containers/c1`, `images/abc@readonly`); the root is prepended here.

use std::sync::Arc;

use silo_common::{SiloError, SiloResult};

use crate::runner::{CommandRunner, Pipe, PipedCommand, RetryPolicy};

const ZFS: &str = "zfs";
const ZPOOL: &str = "zpool";

/// `zfs`/`zpool` front end bound to one on-disk pool root.
#[derive(Debug, Clone)]
pub struct Zfs {
    runner: Arc<dyn CommandRunner>,
    root: String,
    retry: RetryPolicy,
}

impl Zfs {
    /// Bind to `root` (a pool name or a dataset inside a pool).
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            runner,
            root: root.into(),
            retry,
        }
    }

    /// The on-disk root.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Full dataset name of a relative path. An empty path is the root.
    #[must_use]
    pub fn full(&self, path: &str) -> String {
        if path.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{path}", self.root)
        }
    }

    /// Relative path of a full dataset name, if it lives under the root.
    #[must_use]
    pub fn relative<'a>(&self, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(self.root.as_str())?.strip_prefix('/')
    }

    /// `zpool create` backed by `vdev`.
    pub async fn pool_create(&self, pool: &str, vdev: &str) -> SiloResult<()> {
        self.runner
            .try_run(
                self.retry,
                ZPOOL,
                &["create", "-f", "-m", "none", "-O", "compression=on", pool, vdev],
            )
            .await?;
        Ok(())
    }

    /// `zpool import`, searching `search_dir` when given.
    pub async fn pool_import(&self, pool: &str, search_dir: Option<&str>) -> SiloResult<()> {
        let mut args = vec!["import"];
        if let Some(dir) = search_dir {
            args.extend(["-d", dir]);
        }
        args.push(pool);
        self.runner.try_run(self.retry, ZPOOL, &args).await?;
        Ok(())
    }

    /// `zpool destroy`.
    pub async fn pool_destroy(&self, pool: &str) -> SiloResult<()> {
        self.runner
            .try_run(self.retry, ZPOOL, &["destroy", "-f", pool])
            .await?;
        Ok(())
    }

    /// Whether a dataset, snapshot or pool exists, by full name.
    pub async fn exists_full(&self, full: &str) -> bool {
        self.runner
            .run(ZFS, &["get", "-H", "-o", "name", "type", full])
            .await
            .is_ok()
    }

    /// Whether a relative dataset or snapshot exists.
    pub async fn exists(&self, path: &str) -> bool {
        self.exists_full(&self.full(path)).await
    }

    /// `zfs create -p` with properties.
    pub async fn create(&self, path: &str, props: &[(&str, &str)]) -> SiloResult<()> {
        self.create_full(&self.full(path), props).await
    }

    /// `zfs create -p` of a full dataset name.
    pub async fn create_full(&self, full: &str, props: &[(&str, &str)]) -> SiloResult<()> {
        let opts: Vec<String> = props.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["create"];
        for opt in &opts {
            args.extend(["-o", opt.as_str()]);
        }
        args.extend(["-p", full]);
        self.runner.run(ZFS, &args).await?;
        Ok(())
    }

    /// Read one property value (`-` when unset).
    pub async fn get(&self, path: &str, key: &str) -> SiloResult<String> {
        let full = self.full(path);
        let out = self
            .runner
            .run(ZFS, &["get", "-H", "-p", "-o", "value", key, &full])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Set one property.
    pub async fn set(&self, path: &str, key: &str, value: &str) -> SiloResult<()> {
        self.set_full(&self.full(path), key, value).await
    }

    /// Set one property on a full dataset name.
    pub async fn set_full(&self, full: &str, key: &str, value: &str) -> SiloResult<()> {
        let assignment = format!("{key}={value}");
        self.runner.run(ZFS, &["set", &assignment, full]).await?;
        Ok(())
    }

    /// `zfs snapshot -r path@snap`.
    pub async fn snapshot(&self, path: &str, snap: &str) -> SiloResult<()> {
        let entity = format!("{}@{snap}", self.full(path));
        self.runner.run(ZFS, &["snapshot", "-r", &entity]).await?;
        Ok(())
    }

    /// `zfs destroy -r`, retried while the dataset is busy.
    pub async fn destroy(&self, entity: &str) -> SiloResult<()> {
        let full = self.full(entity);
        self.runner
            .try_run(self.retry, ZFS, &["destroy", "-r", &full])
            .await?;
        Ok(())
    }

    /// `zfs clone` of `src@snap` into `dest`, mounting at `mountpoint`.
    pub async fn clone_snapshot(
        &self,
        src: &str,
        snap: &str,
        dest: &str,
        mountpoint: &str,
    ) -> SiloResult<()> {
        let origin = format!("{}@{snap}", self.full(src));
        let dest = self.full(dest);
        let mountpoint = format!("mountpoint={mountpoint}");
        self.runner
            .run(
                ZFS,
                &[
                    "clone",
                    "-p",
                    "-o",
                    &mountpoint,
                    "-o",
                    "canmount=noauto",
                    &origin,
                    &dest,
                ],
            )
            .await?;
        Ok(())
    }

    /// Rename a dataset, creating missing parents.
    ///
    /// A failed attempt still counts as success once the source is gone and
    /// the destination exists.
    pub async fn rename(&self, src: &str, dest: &str) -> SiloResult<()> {
        let src = self.full(src);
        let dest = self.full(dest);
        match self
            .runner
            .try_run(self.retry, ZFS, &["rename", "-p", &src, &dest])
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                if !self.exists_full(&src).await && self.exists_full(&dest).await {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Rename a snapshot of `path`.
    pub async fn rename_snapshot(&self, path: &str, old: &str, new: &str) -> SiloResult<()> {
        let full = self.full(path);
        let src = format!("{full}@{old}");
        let dest = format!("{full}@{new}");
        self.runner.run(ZFS, &["rename", "-r", &src, &dest]).await?;
        Ok(())
    }

    /// Roll `path` back to `snap`.
    pub async fn rollback(&self, path: &str, snap: &str) -> SiloResult<()> {
        let entity = format!("{}@{snap}", self.full(path));
        self.runner
            .try_run(self.retry, ZFS, &["rollback", &entity])
            .await?;
        Ok(())
    }

    /// Snapshot names of `path` (after the `@`), oldest first.
    pub async fn list_snapshots(&self, path: &str) -> SiloResult<Vec<String>> {
        let full = self.full(path);
        let out = self
            .runner
            .run(
                ZFS,
                &[
                    "list", "-t", "snapshot", "-o", "name", "-H", "-d", "1", "-s", "creation",
                    "-r", &full,
                ],
            )
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| line.trim().split_once('@'))
            .filter(|(fs, _)| *fs == full)
            .map(|(_, snap)| snap.to_string())
            .collect())
    }

    /// Filesystems at and below a full dataset name.
    pub async fn list_filesystems_full(&self, full: &str) -> SiloResult<Vec<String>> {
        let out = self
            .runner
            .run(ZFS, &["list", "-t", "filesystem", "-o", "name", "-H", "-r", full])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Whether `path` is currently mounted.
    pub async fn is_mounted(&self, path: &str) -> SiloResult<bool> {
        Ok(self.get(path, "mounted").await? == "yes")
    }

    /// `zfs mount`.
    pub async fn mount(&self, path: &str) -> SiloResult<()> {
        let full = self.full(path);
        self.runner.try_run(self.retry, ZFS, &["mount", &full]).await?;
        Ok(())
    }

    /// `zfs unmount`, forced when `force` is set.
    pub async fn unmount(&self, path: &str, force: bool) -> SiloResult<()> {
        let full = self.full(path);
        let mut args = vec!["unmount"];
        if force {
            args.push("-f");
        }
        args.push(&full);
        self.runner.try_run(self.retry, ZFS, &args).await?;
        Ok(())
    }

    /// Start `zfs send` of `path@snap`, incremental from `parent` if given.
    pub async fn send(&self, path: &str, snap: &str, parent: Option<&str>) -> SiloResult<PipedCommand> {
        let full = self.full(path);
        let entity = format!("{full}@{snap}");
        let base = parent.map(|p| format!("{full}@{p}"));
        let mut args = vec!["send"];
        if let Some(base) = &base {
            args.extend(["-i", base.as_str()]);
        }
        args.push(&entity);
        self.runner.spawn_piped(ZFS, &args, Pipe::Stdout).await
    }

    /// Start `zfs receive` into `target` (a dataset or snapshot path).
    pub async fn receive(&self, target: &str) -> SiloResult<PipedCommand> {
        let full = self.full(target);
        self.runner
            .spawn_piped(ZFS, &["receive", "-F", "-u", &full], Pipe::Stdin)
            .await
    }
}

/// Parse a numeric property value.
///
/// # Errors
///
/// Returns an internal error when the tool printed something else.
pub fn parse_bytes(key: &str, value: &str) -> SiloResult<u64> {
    value
        .parse()
        .map_err(|_| SiloError::internal(format!("Unexpected value for {key}: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ToolRunner;

    fn zfs(root: &str) -> Zfs {
        Zfs::new(Arc::new(ToolRunner::new()), root, RetryPolicy::once())
    }

    #[test]
    fn dataset_names() {
        let zfs = zfs("tank/silo");
        assert_eq!(zfs.full("containers/c1"), "tank/silo/containers/c1");
        assert_eq!(zfs.full(""), "tank/silo");
        assert_eq!(
            zfs.relative("tank/silo/images/abc@readonly"),
            Some("images/abc@readonly")
        );
        assert_eq!(zfs.relative("other/images/abc"), None);
        assert_eq!(zfs.relative("tank/silox/images"), None);
    }

    #[test]
    fn numeric_properties() {
        assert_eq!(parse_bytes("used", "4096").unwrap(), 4096);
        assert!(parse_bytes("used", "-").is_err());
    }
}
