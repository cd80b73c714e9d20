//! Instance, snapshot and image name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SiloError, SiloResult};

/// Separator between an instance name and one of its snapshots
/// (`c1/snap0`).
pub const SNAPSHOT_DELIMITER: &str = "/";

/// A validated instance name.
///
/// Either a plain instance name (`c1`) or a snapshot name (`c1/snap0`).
/// The instance part must:
/// - Be 1-63 characters long
/// - Contain only ASCII letters, digits and hyphens
/// - Start with a letter and not end with a hyphen
///
/// The snapshot part must be non-empty, at most 63 characters, and free of
/// whitespace and further delimiters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceName(String);

impl InstanceName {
    /// Maximum length of either part of a name.
    pub const MAX_LENGTH: usize = 63;

    /// Create a new instance name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::InvalidName`] if either part is malformed.
    pub fn new(name: impl Into<String>) -> SiloResult<Self> {
        let name = name.into();
        match name.split_once(SNAPSHOT_DELIMITER) {
            Some((parent, snap)) => {
                validate_instance_part(&name, parent)?;
                validate_snapshot_part(&name, snap)?;
            }
            None => validate_instance_part(&name, &name)?,
        }
        Ok(Self(name))
    }

    /// Build the name of snapshot `snap` of this instance.
    ///
    /// # Errors
    ///
    /// Returns an error if `self` is already a snapshot or `snap` is invalid.
    pub fn snapshot_of(&self, snap: &str) -> SiloResult<Self> {
        if self.is_snapshot() {
            return Err(SiloError::InvalidName {
                name: self.0.clone(),
                reason: "snapshots cannot have snapshots".to_string(),
            });
        }
        Self::new(format!("{}{SNAPSHOT_DELIMITER}{snap}", self.0))
    }

    /// Whether this names a snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.0.contains(SNAPSHOT_DELIMITER)
    }

    /// The instance part of the name.
    #[must_use]
    pub fn parent(&self) -> &str {
        self.0
            .split_once(SNAPSHOT_DELIMITER)
            .map_or(self.0.as_str(), |(parent, _)| parent)
    }

    /// The snapshot part of the name, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<&str> {
        self.0.split_once(SNAPSHOT_DELIMITER).map(|(_, snap)| snap)
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn invalid(name: &str, reason: &str) -> SiloError {
    SiloError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_instance_part(full: &str, part: &str) -> SiloResult<()> {
    if part.is_empty() {
        return Err(invalid(full, "name is empty"));
    }
    if part.len() > InstanceName::MAX_LENGTH {
        return Err(invalid(full, "name is longer than 63 characters"));
    }
    if !part.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(invalid(full, "name must start with a letter"));
    }
    if part.ends_with('-') {
        return Err(invalid(full, "name must not end with a hyphen"));
    }
    if let Some(c) = part
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-')
    {
        return Err(invalid(full, &format!("character {c:?} is not allowed")));
    }
    Ok(())
}

/// Validate a bare snapshot name (the part after the delimiter).
///
/// # Errors
///
/// Returns [`SiloError::InvalidName`] if the name is empty, too long, or
/// contains whitespace or a delimiter.
pub fn validate_snapshot_name(snap: &str) -> SiloResult<()> {
    validate_snapshot_part(snap, snap)
}

fn validate_snapshot_part(full: &str, snap: &str) -> SiloResult<()> {
    if snap.is_empty() {
        return Err(invalid(full, "snapshot name is empty"));
    }
    if snap.len() > InstanceName::MAX_LENGTH {
        return Err(invalid(full, "snapshot name is longer than 63 characters"));
    }
    if snap.contains(SNAPSHOT_DELIMITER) || snap.contains('@') {
        return Err(invalid(full, "snapshot name contains a delimiter"));
    }
    if snap.chars().any(char::is_whitespace) {
        return Err(invalid(full, "snapshot name contains whitespace"));
    }
    Ok(())
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceName {
    type Err = SiloError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for InstanceName {
    type Error = SiloError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<InstanceName> for String {
    fn from(name: InstanceName) -> Self {
        name.0
    }
}

impl AsRef<str> for InstanceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An image fingerprint (lowercase hex, as stored in the image store).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Maximum length (a full SHA-256 hex digest).
    pub const MAX_LENGTH: usize = 64;

    /// Create a fingerprint, validating that it is hex.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty, too long or not hex.
    pub fn new(value: impl Into<String>) -> SiloResult<Self> {
        let value = value.into().to_ascii_lowercase();
        if value.is_empty()
            || value.len() > Self::MAX_LENGTH
            || !value.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(invalid(&value, "fingerprint must be 1-64 hex characters"));
        }
        Ok(Self(value))
    }

    /// Get the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = SiloError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = SiloError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_instance_names() {
        assert!(InstanceName::new("c1").is_ok());
        assert!(InstanceName::new("web-frontend").is_ok());
        assert!(InstanceName::new("a".repeat(63)).is_ok());
    }

    #[test]
    fn invalid_instance_names() {
        assert!(InstanceName::new("").is_err());
        assert!(InstanceName::new("1abc").is_err());
        assert!(InstanceName::new("-abc").is_err());
        assert!(InstanceName::new("abc-").is_err());
        assert!(InstanceName::new("my_container").is_err());
        assert!(InstanceName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn snapshot_names() {
        let snap = InstanceName::new("c1/snap0").unwrap();
        assert!(snap.is_snapshot());
        assert_eq!(snap.parent(), "c1");
        assert_eq!(snap.snapshot(), Some("snap0"));

        let plain = InstanceName::new("c1").unwrap();
        assert!(!plain.is_snapshot());
        assert_eq!(plain.parent(), "c1");
        assert_eq!(plain.snapshot(), None);
        assert_eq!(plain.snapshot_of("snap0").unwrap(), snap);
        assert!(snap.snapshot_of("again").is_err());
    }

    #[test]
    fn invalid_snapshot_names() {
        assert!(InstanceName::new("c1/").is_err());
        assert!(InstanceName::new("c1/a/b").is_err());
        assert!(InstanceName::new("c1/has space").is_err());
        assert!(InstanceName::new("c1/at@sign").is_err());
        assert!(validate_snapshot_name("snap0").is_ok());
        assert!(validate_snapshot_name("").is_err());
    }

    #[test]
    fn name_serde_validates() {
        let name: InstanceName = serde_json::from_str("\"c1/snap0\"").unwrap();
        assert_eq!(name.as_str(), "c1/snap0");
        assert!(serde_json::from_str::<InstanceName>("\"-bad\"").is_err());
    }

    #[test]
    fn fingerprints() {
        assert_eq!(Fingerprint::new("ABC123").unwrap().as_str(), "abc123");
        assert!(Fingerprint::new("").is_err());
        assert!(Fingerprint::new("xyz").is_err());
        assert!(Fingerprint::new("a".repeat(65)).is_err());
    }

    proptest! {
        #[test]
        fn generated_names_round_trip(name in "[a-z][a-z0-9-]{0,61}[a-z0-9]") {
            let parsed = InstanceName::new(name.clone()).unwrap();
            prop_assert_eq!(parsed.as_str(), name.as_str());
            prop_assert!(!parsed.is_snapshot());
        }

        #[test]
        fn snapshot_parent_is_prefix(parent in "[a-z][a-z0-9]{0,20}", snap in "[a-z0-9._-]{1,20}") {
            let name = InstanceName::new(format!("{parent}/{snap}")).unwrap();
            prop_assert_eq!(name.parent(), parent.as_str());
            prop_assert_eq!(name.snapshot(), Some(snap.as_str()));
        }
    }
}
