//! Host directory layout shared by the drivers.
//!
//! Mountpoints and the per-container snapshot symlink are created and
//! removed in lockstep with the volumes and snapshots they belong to.

use std::io;
use std::path::Path;

use silo_common::{SiloError, SiloPaths, SiloResult};
use walkdir::WalkDir;

/// Create a mountpoint directory (and parents), mode 0711.
pub async fn create_mountpoint(path: &Path) -> SiloResult<()> {
    tokio::fs::create_dir_all(path).await?;
    set_mode(path, 0o711).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> SiloResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> SiloResult<()> {
    Ok(())
}

/// Remove an empty directory, ignoring a missing one.
pub async fn remove_dir(path: &Path) -> SiloResult<()> {
    match tokio::fs::remove_dir(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Remove a directory tree, ignoring a missing one.
pub async fn remove_tree(path: &Path) -> SiloResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Remove a file or symlink, ignoring a missing one.
pub async fn remove_file(path: &Path) -> SiloResult<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Whether anything (including a dangling symlink) exists at `path`.
pub async fn present(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// Create the mountpoint of a container snapshot and point the container's
/// snapshot symlink at its snapshot directory.
pub async fn ensure_snapshot_dirs(
    paths: &SiloPaths,
    pool: &str,
    container: &str,
    snap: &str,
) -> SiloResult<()> {
    create_mountpoint(&paths.snapshot_mountpoint(pool, container, snap)).await?;
    ensure_snapshot_link(paths, pool, container).await
}

/// Create `<var>/snapshots/<container>` if it is missing.
pub async fn ensure_snapshot_link(paths: &SiloPaths, pool: &str, container: &str) -> SiloResult<()> {
    let link = paths.snapshot_symlink(container);
    if present(&link).await {
        return Ok(());
    }
    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::symlink(paths.snapshots_dir(pool, container), &link).await?;
    tracing::debug!(link = %link.display(), "Created snapshot symlink");
    Ok(())
}

/// Remove a snapshot mountpoint; once the container has none left, remove
/// its snapshot directory and symlink too.
pub async fn remove_snapshot_dirs(
    paths: &SiloPaths,
    pool: &str,
    container: &str,
    snap: &str,
) -> SiloResult<()> {
    remove_tree(&paths.snapshot_mountpoint(pool, container, snap)).await?;

    let dir = paths.snapshots_dir(pool, container);
    let empty = match tokio::fs::read_dir(&dir).await {
        Ok(mut entries) => entries.next_entry().await?.is_none(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => return Err(err.into()),
    };
    if empty {
        remove_dir(&dir).await?;
        remove_file(&paths.snapshot_symlink(container)).await?;
    }
    Ok(())
}

/// Remove every snapshot directory of a container and its symlink.
pub async fn remove_all_snapshot_dirs(paths: &SiloPaths, pool: &str, container: &str) -> SiloResult<()> {
    remove_tree(&paths.snapshots_dir(pool, container)).await?;
    remove_file(&paths.snapshot_symlink(container)).await
}

/// Move a container's snapshot directory and symlink to a new name.
pub async fn rename_snapshot_dirs(
    paths: &SiloPaths,
    pool: &str,
    old: &str,
    new: &str,
) -> SiloResult<()> {
    let old_dir = paths.snapshots_dir(pool, old);
    if !present(&old_dir).await {
        return Ok(());
    }
    tokio::fs::rename(&old_dir, paths.snapshots_dir(pool, new)).await?;
    remove_file(&paths.snapshot_symlink(old)).await?;
    ensure_snapshot_link(paths, pool, new).await
}

/// Lazily detach whatever is mounted at `target`.
#[cfg(target_os = "linux")]
pub fn detach(target: &Path) -> SiloResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %target.display(), "Detaching mount");
    unmount(target, UnmountFlags::DETACH).map_err(|e| SiloError::Io(e.into()))
}

/// Lazily detach whatever is mounted at `target`.
#[cfg(not(target_os = "linux"))]
pub fn detach(_target: &Path) -> SiloResult<()> {
    Err(SiloError::Unsupported {
        feature: "lazy unmount".to_string(),
    })
}

/// Recursively copy `src` into `dest`, preserving permissions and symlinks.
///
/// Blocking; run it on the blocking pool.
pub fn copy_tree(src: &Path, dest: &Path) -> SiloResult<()> {
    std::fs::create_dir_all(dest)?;
    let mut dir_modes = Vec::new();
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| SiloError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SiloError::internal(e.to_string()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            let metadata = entry.metadata().map_err(|e| SiloError::Io(e.into()))?;
            dir_modes.push((target, metadata.permissions()));
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if std::fs::symlink_metadata(&target).is_ok() {
                std::fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    // Applied last so read-only directories can still be filled.
    for (dir, permissions) in dir_modes.into_iter().rev() {
        std::fs::set_permissions(dir, permissions)?;
    }
    Ok(())
}

/// Remove everything inside `dir`, keeping the directory itself.
///
/// Blocking; run it on the blocking pool.
pub fn clear_dir(dir: &Path) -> SiloResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Total size of the regular files below `dir`.
///
/// Blocking; run it on the blocking pool.
pub fn tree_size(dir: &Path) -> SiloResult<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| SiloError::Io(e.into()))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(|e| SiloError::Io(e.into()))?.len();
        }
    }
    Ok(total)
}

/// Run a blocking filesystem job on the blocking pool.
pub async fn blocking<T, F>(job: F) -> SiloResult<T>
where
    F: FnOnce() -> SiloResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| SiloError::internal(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_symlink_follows_snapshot_existence() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SiloPaths::with_root(tmp.path());

        ensure_snapshot_dirs(&paths, "default", "c1", "snap0").await.unwrap();
        ensure_snapshot_dirs(&paths, "default", "c1", "snap1").await.unwrap();
        let link = paths.snapshot_symlink("c1");
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            paths.snapshots_dir("default", "c1")
        );

        remove_snapshot_dirs(&paths, "default", "c1", "snap0").await.unwrap();
        assert!(present(&link).await);

        remove_snapshot_dirs(&paths, "default", "c1", "snap1").await.unwrap();
        assert!(!present(&link).await);
        assert!(!paths.snapshots_dir("default", "c1").exists());
    }

    #[tokio::test]
    async fn renaming_moves_directory_and_link() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SiloPaths::with_root(tmp.path());
        ensure_snapshot_dirs(&paths, "default", "c1", "snap0").await.unwrap();

        rename_snapshot_dirs(&paths, "default", "c1", "c2").await.unwrap();

        assert!(!present(&paths.snapshot_symlink("c1")).await);
        assert!(paths.snapshot_mountpoint("default", "c2", "snap0").is_dir());
        assert!(paths.snapshot_symlink("c2").join("snap0").is_dir());
    }

    #[test]
    fn copy_tree_preserves_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("etc")).unwrap();
        std::fs::write(src.join("etc/hostname"), "c1\n").unwrap();
        std::os::unix::fs::symlink("etc/hostname", src.join("hostname")).unwrap();

        let dest = tmp.path().join("dest");
        copy_tree(&src, &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("etc/hostname")).unwrap(), "c1\n");
        assert_eq!(
            std::fs::read_link(dest.join("hostname")).unwrap(),
            Path::new("etc/hostname")
        );
        assert_eq!(tree_size(&dest).unwrap(), 3);

        clear_dir(&dest).unwrap();
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }
}
