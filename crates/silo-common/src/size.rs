//! Byte size parsing and representation.
//!
//! Accepts the quantities used in pool and volume configuration:
//! - Decimal: "512kB", "10MB", "10GB", "1TB" (powers of 1000)
//! - Binary: "512KiB", "2GiB", "1TiB" (powers of 1024)
//! - Plain bytes: "1048576"

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SiloError, SiloResult};

/// A size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteSize(u64);

const SUFFIXES: [(&str, u64); 14] = [
    ("KiB", 1 << 10),
    ("MiB", 1 << 20),
    ("GiB", 1 << 30),
    ("TiB", 1 << 40),
    ("PiB", 1 << 50),
    ("EiB", 1 << 60),
    ("kB", 1_000),
    ("KB", 1_000),
    ("MB", 1_000_000),
    ("GB", 1_000_000_000),
    ("TB", 1_000_000_000_000),
    ("PB", 1_000_000_000_000_000),
    ("EB", 1_000_000_000_000_000_000),
    ("B", 1),
];

impl ByteSize {
    /// Create a size from a byte count.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from gibibytes.
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib << 30)
    }

    /// Get the size in bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Parse a size string.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::InvalidSize`] for unknown suffixes, negative or
    /// overflowing values.
    pub fn parse(s: &str) -> SiloResult<Self> {
        let trimmed = s.trim();
        let err = || SiloError::InvalidSize {
            value: s.to_string(),
        };

        for (suffix, multiplier) in SUFFIXES {
            if let Some(number) = trimmed.strip_suffix(suffix) {
                let value: u64 = number.trim().parse().map_err(|_| err())?;
                return value.checked_mul(multiplier).map(Self).ok_or_else(err);
            }
        }

        trimmed.parse().map(Self).map_err(|_| err())
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GB: u64 = 1_000_000_000;
        const MB: u64 = 1_000_000;
        const GIB: u64 = 1 << 30;
        const MIB: u64 = 1 << 20;

        match self.0 {
            0 => write!(f, "0B"),
            v if v % GB == 0 => write!(f, "{}GB", v / GB),
            v if v % GIB == 0 => write!(f, "{}GiB", v / GIB),
            v if v % MB == 0 => write!(f, "{}MB", v / MB),
            v if v % MIB == 0 => write!(f, "{}MiB", v / MIB),
            v => write!(f, "{v}B"),
        }
    }
}

impl FromStr for ByteSize {
    type Err = SiloError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_decimal() {
        assert_eq!(ByteSize::parse("10GB").unwrap().as_bytes(), 10_000_000_000);
        assert_eq!(ByteSize::parse("512MB").unwrap().as_bytes(), 512_000_000);
        assert_eq!(ByteSize::parse("1kB").unwrap().as_bytes(), 1000);
    }

    #[test]
    fn parse_binary() {
        assert_eq!(ByteSize::parse("2GiB").unwrap().as_bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(ByteSize::parse("1 MiB").unwrap().as_bytes(), 1024 * 1024);
    }

    #[test]
    fn parse_plain() {
        assert_eq!(ByteSize::parse("1048576").unwrap().as_bytes(), 1_048_576);
        assert_eq!(ByteSize::parse("512B").unwrap().as_bytes(), 512);
    }

    #[test]
    fn parse_invalid() {
        assert!(ByteSize::parse("").is_err());
        assert!(ByteSize::parse("ten GB").is_err());
        assert!(ByteSize::parse("-1GB").is_err());
        assert!(ByteSize::parse("10XB").is_err());
        assert!(ByteSize::parse("99999999EiB").is_err());
    }

    #[test]
    fn display() {
        assert_eq!(ByteSize::bytes(10_000_000_000).to_string(), "10GB");
        assert_eq!(ByteSize::gibibytes(2).to_string(), "2GiB");
        assert_eq!(ByteSize::bytes(1 << 20).to_string(), "1MiB");
        assert_eq!(ByteSize::bytes(1234).to_string(), "1234B");
    }

    proptest! {
        #[test]
        fn display_parses_back(bytes in 0u64..(1 << 50)) {
            let size = ByteSize::bytes(bytes);
            prop_assert_eq!(ByteSize::parse(&size.to_string()).unwrap(), size);
        }
    }
}
