//! Image tarball lookup.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use silo_common::{Fingerprint, SiloError, SiloPaths, SiloResult};

/// Source of image tarballs, keyed by fingerprint.
#[async_trait]
pub trait ImageStore: Send + Sync + fmt::Debug {
    /// Resolve a full fingerprint or a unique prefix of one to the full
    /// fingerprint and the image tarball.
    async fn resolve(&self, reference: &Fingerprint) -> SiloResult<(Fingerprint, PathBuf)>;

    /// Record that an instance was created from the image.
    async fn mark_used(&self, fingerprint: &Fingerprint) -> SiloResult<()>;
}

/// Usage metadata stored next to a tarball.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUsage {
    /// Last time an instance was created from the image.
    pub last_used_at: DateTime<Utc>,
}

/// Image store reading `<var>/images/<fingerprint>`.
#[derive(Debug, Clone)]
pub struct DirImageStore {
    paths: SiloPaths,
}

impl DirImageStore {
    /// Create a store over the var directory's image tarballs.
    #[must_use]
    pub const fn new(paths: SiloPaths) -> Self {
        Self { paths }
    }

    fn usage_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.paths
            .images()
            .join(format!("{}.json", fingerprint.as_str()))
    }

    /// Read the usage metadata of an image, if it was ever used.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata exists but cannot be read.
    pub async fn usage(&self, fingerprint: &Fingerprint) -> SiloResult<Option<ImageUsage>> {
        match tokio::fs::read(self.usage_path(fingerprint)).await {
            Ok(json) => Ok(Some(serde_json::from_slice(&json)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ImageStore for DirImageStore {
    async fn resolve(&self, reference: &Fingerprint) -> SiloResult<(Fingerprint, PathBuf)> {
        let exact = self.paths.image_tarball(reference.as_str());
        if tokio::fs::try_exists(&exact).await? {
            return Ok((reference.clone(), exact));
        }

        let not_found = || SiloError::ImageNotFound {
            reference: reference.to_string(),
        };
        let mut entries = match tokio::fs::read_dir(self.paths.images()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };

        let mut matches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(reference.as_str()) && !name.contains('.') {
                matches.push(name);
            }
        }

        match matches.as_slice() {
            [] => Err(not_found()),
            [name] => {
                let fingerprint = Fingerprint::new(name.as_str())?;
                let tarball = self.paths.image_tarball(name);
                Ok((fingerprint, tarball))
            }
            _ => Err(SiloError::validation(format!(
                "Image reference {reference} is ambiguous ({} matches)",
                matches.len()
            ))),
        }
    }

    async fn mark_used(&self, fingerprint: &Fingerprint) -> SiloResult<()> {
        let usage = ImageUsage {
            last_used_at: Utc::now(),
        };
        tokio::fs::write(self.usage_path(fingerprint), serde_json::to_vec(&usage)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DirImageStore) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SiloPaths::with_root(tmp.path());
        std::fs::create_dir_all(paths.images()).unwrap();
        for fp in ["abc123", "abd456"] {
            std::fs::write(paths.image_tarball(fp), b"tar").unwrap();
        }
        (tmp, DirImageStore::new(paths))
    }

    fn fp(value: &str) -> Fingerprint {
        Fingerprint::new(value).unwrap()
    }

    #[tokio::test]
    async fn resolves_exact_and_prefix() {
        let (_tmp, store) = store();
        assert_eq!(store.resolve(&fp("abc123")).await.unwrap().0, fp("abc123"));
        let (full, tarball) = store.resolve(&fp("abd")).await.unwrap();
        assert_eq!(full, fp("abd456"));
        assert!(tarball.ends_with("images/abd456"));
    }

    #[tokio::test]
    async fn ambiguous_and_missing_references() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.resolve(&fp("ab")).await,
            Err(SiloError::Validation { .. })
        ));
        assert!(matches!(
            store.resolve(&fp("ff")).await,
            Err(SiloError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn usage_is_recorded_beside_the_tarball() {
        let (_tmp, store) = store();
        assert!(store.usage(&fp("abc123")).await.unwrap().is_none());
        store.mark_used(&fp("abc123")).await.unwrap();
        assert!(store.usage(&fp("abc123")).await.unwrap().is_some());
        // Metadata files never count as images.
        assert_eq!(store.resolve(&fp("abc")).await.unwrap().0, fp("abc123"));
    }
}
