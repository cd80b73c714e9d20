//! Requested identity and configuration of an instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use silo_common::{ByteSize, Fingerprint, InstanceName, SiloError, SiloResult};
use silo_storage::volume::parse_bool;

/// Configuration key namespaces an instance may set.
pub const CONFIG_NAMESPACES: &[&str] = &[
    "boot.",
    "environment.",
    "image.",
    "limits.",
    "migration.",
    "raw.",
    "security.",
    "user.",
    "volatile.",
];

/// Device types an instance may declare.
pub const DEVICE_TYPES: &[&str] = &["disk", "nic", "unix-char", "unix-block", "none"];

/// Boolean keys that are checked at validation time.
const BOOL_KEYS: &[&str] = &[
    "boot.autostart",
    "security.privileged",
    "security.nesting",
    "migration.incremental.memory",
];

/// Device map of a single device (`type`, `path`, `pool`, ...).
pub type Device = BTreeMap<String, String>;

/// Whether an instance is a container or one of its snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    /// A container.
    Container,
    /// A point-in-time snapshot of a container.
    Snapshot,
}

/// Arguments of a creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceArgs {
    /// Instance name (`c1` or `c1/snap0`).
    pub name: InstanceName,
    /// Container or snapshot.
    pub kind: InstanceKind,
    /// Profiles applied to the instance.
    pub profiles: Vec<String>,
    /// Devices by device name.
    pub devices: BTreeMap<String, Device>,
    /// Instance configuration.
    pub config: BTreeMap<String, String>,
    /// Image the instance is built from.
    pub base_image: Option<Fingerprint>,
    /// Whether the snapshot carries runtime state.
    pub stateful: bool,
    /// Whether the instance is removed when stopped.
    pub ephemeral: bool,
}

impl InstanceArgs {
    /// Arguments for `name`, with the kind taken from the name.
    #[must_use]
    pub fn new(name: InstanceName) -> Self {
        let kind = if name.is_snapshot() {
            InstanceKind::Snapshot
        } else {
            InstanceKind::Container
        };
        Self {
            name,
            kind,
            profiles: vec!["default".to_string()],
            devices: BTreeMap::new(),
            config: BTreeMap::new(),
            base_image: None,
            stateful: false,
            ephemeral: false,
        }
    }

    /// Replace the profile list.
    #[must_use]
    pub fn with_profiles(mut self, profiles: Vec<String>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Add a device.
    #[must_use]
    pub fn with_device(mut self, name: impl Into<String>, device: Device) -> Self {
        self.devices.insert(name.into(), device);
        self
    }

    /// Add a root disk device on `pool`, optionally with a quota.
    #[must_use]
    pub fn with_root_disk(self, pool: &str, size: Option<ByteSize>) -> Self {
        let mut device = Device::from([
            ("type".to_string(), "disk".to_string()),
            ("path".to_string(), "/".to_string()),
            ("pool".to_string(), pool.to_string()),
        ]);
        if let Some(size) = size {
            device.insert("size".to_string(), size.as_bytes().to_string());
        }
        self.with_device("root", device)
    }

    /// Move the root disk to `pool`, adding one if there is none.
    #[must_use]
    pub fn with_root_pool(mut self, pool: &str) -> Self {
        match self.devices.values_mut().find(|device| is_root_disk(device)) {
            Some(device) => {
                device.insert("pool".to_string(), pool.to_string());
                self
            }
            None => self.with_root_disk(pool, None),
        }
    }

    /// Set a configuration key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Set the base image.
    #[must_use]
    pub fn with_image(mut self, fingerprint: Fingerprint) -> Self {
        self.base_image = Some(fingerprint);
        self
    }

    /// Mark the snapshot stateful.
    #[must_use]
    pub const fn with_stateful(mut self, stateful: bool) -> Self {
        self.stateful = stateful;
        self
    }

    /// Mark the instance ephemeral.
    #[must_use]
    pub const fn with_ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Reject malformed configuration and devices before anything touches
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Validation`] or [`SiloError::InvalidSize`]
    /// describing the first problem found.
    pub fn validate(&self) -> SiloResult<()> {
        let is_snapshot = self.kind == InstanceKind::Snapshot;
        if is_snapshot != self.name.is_snapshot() {
            return Err(SiloError::validation(format!(
                "{:?} is not a valid {} name",
                self.name.as_str(),
                if is_snapshot { "snapshot" } else { "container" }
            )));
        }
        if self.stateful && !is_snapshot {
            return Err(SiloError::validation("Only snapshots can be stateful"));
        }

        for (key, value) in &self.config {
            if !CONFIG_NAMESPACES.iter().any(|ns| key.starts_with(ns)) {
                return Err(SiloError::validation(format!(
                    "Unknown configuration key: {key}"
                )));
            }
            if BOOL_KEYS.contains(&key.as_str()) {
                parse_bool(key, value)?;
            }
        }

        let mut root_disks = 0;
        for (name, device) in &self.devices {
            validate_device(name, device)?;
            if is_root_disk(device) {
                root_disks += 1;
            }
        }
        if root_disks > 1 {
            return Err(SiloError::validation(
                "More than one root disk device is defined",
            ));
        }
        Ok(())
    }

    /// The root disk device, if any.
    #[must_use]
    pub fn root_disk(&self) -> Option<&Device> {
        self.devices.values().find(|device| is_root_disk(device))
    }

    /// Pool named by the root disk device.
    #[must_use]
    pub fn root_pool(&self) -> Option<&str> {
        self.root_disk()
            .and_then(|device| device.get("pool"))
            .map(String::as_str)
    }

    /// Quota requested on the root disk device.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::InvalidSize`] for a malformed size.
    pub fn root_size(&self) -> SiloResult<Option<ByteSize>> {
        self.root_disk()
            .and_then(|device| device.get("size"))
            .map(|size| ByteSize::parse(size))
            .transpose()
    }

    /// Whether the instance runs without user-namespace id shifting.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.config
            .get("security.privileged")
            .is_some_and(|value| parse_bool("security.privileged", value).unwrap_or(false))
    }
}

fn is_root_disk(device: &Device) -> bool {
    device.get("type").map(String::as_str) == Some("disk")
        && device.get("path").map(String::as_str) == Some("/")
}

fn validate_device(name: &str, device: &Device) -> SiloResult<()> {
    let Some(kind) = device.get("type") else {
        return Err(SiloError::validation(format!(
            "Device {name:?} is missing its type"
        )));
    };
    if !DEVICE_TYPES.contains(&kind.as_str()) {
        return Err(SiloError::validation(format!(
            "Device {name:?} has invalid type {kind:?}"
        )));
    }
    if kind != "disk" {
        return Ok(());
    }

    match device.get("path") {
        None => {
            return Err(SiloError::validation(format!(
                "Disk device {name:?} is missing its path"
            )));
        }
        Some(path) if !path.starts_with('/') => {
            return Err(SiloError::validation(format!(
                "Disk device {name:?} path must be absolute"
            )));
        }
        Some(_) => {}
    }
    if is_root_disk(device) && device.get("pool").is_none_or(String::is_empty) {
        return Err(SiloError::validation(format!(
            "Root disk device {name:?} must name a storage pool"
        )));
    }
    if let Some(size) = device.get("size") {
        ByteSize::parse(size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(name: &str) -> InstanceArgs {
        InstanceArgs::new(InstanceName::new(name).unwrap())
    }

    #[test]
    fn kind_follows_name() {
        assert_eq!(args("c1").kind, InstanceKind::Container);
        assert_eq!(args("c1/snap0").kind, InstanceKind::Snapshot);
        assert!(args("c1").validate().is_ok());

        let mut mismatched = args("c1");
        mismatched.kind = InstanceKind::Snapshot;
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn root_disk_accessors() {
        let args = args("c1").with_root_disk("fast", Some(ByteSize::gibibytes(2)));
        args.validate().unwrap();
        assert_eq!(args.root_pool(), Some("fast"));
        assert_eq!(args.root_size().unwrap(), Some(ByteSize::gibibytes(2)));

        let moved = args.with_root_pool("slow");
        assert_eq!(moved.root_pool(), Some("slow"));
        assert_eq!(moved.root_size().unwrap(), Some(ByteSize::gibibytes(2)));
        assert_eq!(moved.devices.len(), 1);
    }

    #[test]
    fn unknown_config_namespace_is_rejected() {
        let err = args("c1").with_config("bogus.key", "1").validate().unwrap_err();
        assert!(err.to_string().contains("bogus.key"));
        assert!(args("c1").with_config("user.note", "hi").validate().is_ok());
    }

    #[test]
    fn privileged_flag() {
        assert!(!args("c1").is_privileged());
        assert!(args("c1").with_config("security.privileged", "true").is_privileged());
        assert!(
            args("c1")
                .with_config("security.privileged", "maybe")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn malformed_devices_are_rejected() {
        let disk = |pairs: &[(&str, &str)]| -> Device {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect()
        };

        let cases = [
            disk(&[("path", "/")]),
            disk(&[("type", "gpu")]),
            disk(&[("type", "disk")]),
            disk(&[("type", "disk"), ("path", "data")]),
            disk(&[("type", "disk"), ("path", "/")]),
            disk(&[("type", "disk"), ("path", "/"), ("pool", "p"), ("size", "lots")]),
        ];
        for device in cases {
            assert!(
                args("c1").with_device("d", device.clone()).validate().is_err(),
                "{device:?} should be rejected"
            );
        }

        let two_roots = args("c1")
            .with_root_disk("a", None)
            .with_device("other", disk(&[("type", "disk"), ("path", "/"), ("pool", "b")]));
        assert!(two_roots.validate().is_err());
    }

    #[test]
    fn only_snapshots_are_stateful() {
        assert!(args("c1").with_stateful(true).validate().is_err());
        assert!(args("c1/snap0").with_stateful(true).validate().is_ok());
    }
}
