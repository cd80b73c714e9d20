//! Image tarball unpacking.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use silo_common::{SiloError, SiloResult};

use crate::filesystem::blocking;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression of an image tarball, detected from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar.
    None,
    /// gzip.
    Gzip,
    /// Zstandard.
    Zstd,
}

impl Compression {
    /// Detect the compression from a file header.
    #[must_use]
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else if header.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::None
        }
    }
}

/// Unpack an image tarball into `dest`, preserving permissions.
///
/// # Errors
///
/// Returns [`SiloError::ImageNotFound`] if the tarball is missing, or an I/O
/// error if it cannot be read or unpacked.
pub async fn unpack(tarball: &Path, dest: &Path) -> SiloResult<()> {
    let tarball = tarball.to_path_buf();
    let dest = dest.to_path_buf();
    blocking(move || unpack_blocking(&tarball, &dest)).await
}

fn unpack_blocking(tarball: &Path, dest: &Path) -> SiloResult<()> {
    let mut file = File::open(tarball).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => SiloError::ImageNotFound {
            reference: tarball.display().to_string(),
        },
        _ => SiloError::Io(err),
    })?;

    let mut header = [0u8; 4];
    let read = file.read(&mut header)?;
    let compression = Compression::detect(&header[..read]);
    let file = File::open(tarball)?;

    tracing::debug!(tarball = %tarball.display(), ?compression, "Unpacking image");

    let reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(BufReader::new(file))),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
        Compression::None => Box::new(BufReader::new(file)),
    };

    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tarball() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "rootfs/etc/hostname", &b"c1\n"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn detects_compression() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(Compression::detect(&ZSTD_MAGIC), Compression::Zstd);
        assert_eq!(Compression::detect(b"root"), Compression::None);
        assert_eq!(Compression::detect(&[]), Compression::None);
    }

    #[tokio::test]
    async fn unpacks_plain_and_gzip() {
        use std::io::Write;

        let tmp = tempfile::tempdir().unwrap();
        let data = tarball();

        let plain = tmp.path().join("plain.tar");
        std::fs::write(&plain, &data).unwrap();
        unpack(&plain, &tmp.path().join("a")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("a/rootfs/etc/hostname")).unwrap(),
            "c1\n"
        );

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&data).unwrap();
        let gz = tmp.path().join("image.tar.gz");
        std::fs::write(&gz, encoder.finish().unwrap()).unwrap();
        unpack(&gz, &tmp.path().join("b")).await.unwrap();
        assert!(tmp.path().join("b/rootfs/etc/hostname").is_file());
    }

    #[tokio::test]
    async fn missing_tarball_is_image_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = unpack(&tmp.path().join("nope"), tmp.path()).await.unwrap_err();
        assert!(matches!(err, SiloError::ImageNotFound { .. }));
    }
}
