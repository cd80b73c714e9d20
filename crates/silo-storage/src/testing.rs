//! In-process model of the `zfs` and `zpool` tools.
//!
//! [`FakeZfs`] keeps datasets, snapshots, origin/clone links, mount state and
//! an opaque content token per dataset. Snapshots capture the token, clones
//! inherit it and `zfs send`/`zfs receive` carry it across. Every invocation
//! is recorded, and failures can be injected by command-line substring.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use silo_common::{SiloError, SiloResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::runner::{CommandRunner, Pipe, PipedCommand, render};

#[derive(Debug, Clone, Default)]
struct Dataset {
    props: BTreeMap<String, String>,
    mounted: bool,
    mounts: usize,
    content: String,
    origin: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    content: String,
    clones: BTreeSet<String>,
    created: u64,
}

#[derive(Debug, Default)]
struct Exported {
    datasets: Vec<(String, Dataset)>,
    snapshots: Vec<(String, Snapshot)>,
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeSet<String>,
    exported: BTreeMap<String, Exported>,
    datasets: BTreeMap<String, Dataset>,
    snapshots: BTreeMap<String, Snapshot>,
    clock: u64,
    invocations: Vec<String>,
    fail_on: Vec<String>,
    fail_next: Vec<String>,
    mount_delay: Duration,
}

/// What a fake `zfs send` stream carries.
#[derive(Debug, Serialize, Deserialize)]
struct StreamPayload {
    snapshot: String,
    content: String,
    from: Option<String>,
}

/// Fake `zfs`/`zpool` runner.
#[derive(Debug, Clone, Default)]
pub struct FakeZfs {
    state: Arc<Mutex<State>>,
}

fn fail(command: &str, output: impl Into<String>) -> SiloError {
    SiloError::Tool {
        command: command.to_string(),
        status: Some(1),
        output: output.into(),
    }
}

/// Whether `name` is `root` or lives below it.
fn within(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('@'))
}

/// Replace the `old` prefix of `name` with `new`.
fn reroot(name: &str, old: &str, new: &str) -> String {
    format!("{new}{}", &name[old.len()..])
}

/// Arguments split into valued options and positionals. Bare flags are
/// accepted and ignored.
#[derive(Debug, Default)]
struct Args {
    options: Vec<(String, String)>,
    positional: Vec<String>,
}

impl Args {
    fn parse(args: &[&str]) -> Self {
        const VALUED: [&str; 7] = ["-o", "-t", "-d", "-s", "-i", "-O", "-m"];
        let mut parsed = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if VALUED.contains(arg) {
                let value = iter.next().copied().unwrap_or_default();
                parsed.options.push(((*arg).to_string(), value.to_string()));
            } else if !arg.starts_with('-') {
                parsed.positional.push((*arg).to_string());
            }
        }
        parsed
    }

    fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn properties(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.options
            .iter()
            .filter(|(k, _)| k == "-o")
            .filter_map(|(_, v)| v.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
    }

    fn arg(&self, index: usize, command: &str) -> SiloResult<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| fail(command, "missing argument"))
    }
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn exists(&self, name: &str) -> bool {
        self.datasets.contains_key(name) || self.snapshots.contains_key(name)
    }

    fn ensure_parents(&mut self, name: &str, command: &str) -> SiloResult<()> {
        let pool = name.split('/').next().unwrap_or(name);
        if !self.pools.contains(pool) {
            return Err(fail(command, format!("cannot open '{pool}': no such pool")));
        }
        let mut prefix = String::new();
        let parts: Vec<&str> = name.split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.datasets.entry(prefix.clone()).or_default();
        }
        Ok(())
    }

    fn snapshots_of(&self, fs: &str) -> Vec<(String, u64)> {
        let mut snaps: Vec<(String, u64)> = self
            .snapshots
            .iter()
            .filter_map(|(name, snap)| {
                let (owner, short) = name.split_once('@')?;
                (owner == fs).then(|| (short.to_string(), snap.created))
            })
            .collect();
        snaps.sort_by_key(|(_, created)| *created);
        snaps
    }

    fn unlink_origin(&mut self, dataset: &str, origin: Option<&String>) {
        if let Some(snap) = origin.and_then(|o| self.snapshots.get_mut(o)) {
            snap.clones.remove(dataset);
        }
    }

    fn zpool(&mut self, command: &str, args: &Args) -> SiloResult<String> {
        match args.arg(0, command)? {
            "create" => {
                let pool = args.arg(1, command)?;
                if self.pools.contains(pool) {
                    return Err(fail(command, format!("pool '{pool}' already exists")));
                }
                self.pools.insert(pool.to_string());
                let mut root = Dataset::default();
                root.props.insert("mountpoint".into(), "none".into());
                self.datasets.insert(pool.to_string(), root);
                Ok(String::new())
            }
            "import" => {
                let pool = args.arg(1, command)?;
                let Some(exported) = self.exported.remove(pool) else {
                    return Err(fail(command, format!("cannot import '{pool}': no such pool available")));
                };
                self.pools.insert(pool.to_string());
                self.datasets.extend(exported.datasets);
                self.snapshots.extend(exported.snapshots);
                Ok(String::new())
            }
            "destroy" => {
                let pool = args.arg(1, command)?.to_string();
                if !self.pools.remove(&pool) {
                    return Err(fail(command, format!("cannot open '{pool}': no such pool")));
                }
                self.datasets.retain(|name, _| !within(name, &pool));
                self.snapshots.retain(|name, _| !within(name, &pool));
                Ok(String::new())
            }
            other => Err(fail(command, format!("unrecognized command '{other}'"))),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn zfs(&mut self, command: &str, args: &Args) -> SiloResult<String> {
        match args.arg(0, command)? {
            "get" => self.get(command, args),
            "set" => {
                let assignment = args.arg(1, command)?;
                let name = args.arg(2, command)?;
                let (key, value) = assignment
                    .split_once('=')
                    .ok_or_else(|| fail(command, "bad property assignment"))?;
                let ds = self
                    .datasets
                    .get_mut(name)
                    .ok_or_else(|| fail(command, format!("cannot open '{name}': dataset does not exist")))?;
                if key == "mountpoint" && value == "none" {
                    ds.mounted = false;
                }
                ds.props.insert(key.to_string(), value.to_string());
                Ok(String::new())
            }
            "create" => {
                let name = args.arg(1, command)?;
                if self.exists(name) {
                    return Err(fail(command, format!("cannot create '{name}': dataset already exists")));
                }
                self.ensure_parents(name, command)?;
                let ds = Dataset {
                    props: args.properties().collect(),
                    ..Dataset::default()
                };
                self.datasets.insert(name.to_string(), ds);
                Ok(String::new())
            }
            "snapshot" => {
                let entity = args.arg(1, command)?;
                let (fs, _) = entity
                    .split_once('@')
                    .ok_or_else(|| fail(command, "not a snapshot name"))?;
                if self.snapshots.contains_key(entity) {
                    return Err(fail(command, format!("cannot create snapshot '{entity}': dataset already exists")));
                }
                let content = self
                    .datasets
                    .get(fs)
                    .ok_or_else(|| fail(command, format!("cannot open '{fs}': dataset does not exist")))?
                    .content
                    .clone();
                let created = self.tick();
                self.snapshots.insert(
                    entity.to_string(),
                    Snapshot {
                        content,
                        clones: BTreeSet::new(),
                        created,
                    },
                );
                Ok(String::new())
            }
            "destroy" => self.destroy(command, args.arg(1, command)?),
            "clone" => {
                let origin = args.arg(1, command)?;
                let dest = args.arg(2, command)?;
                if self.exists(dest) {
                    return Err(fail(command, format!("cannot create '{dest}': dataset already exists")));
                }
                let content = self
                    .snapshots
                    .get(origin)
                    .ok_or_else(|| fail(command, format!("cannot open '{origin}': dataset does not exist")))?
                    .content
                    .clone();
                self.ensure_parents(dest, command)?;
                self.datasets.insert(
                    dest.to_string(),
                    Dataset {
                        props: args.properties().collect(),
                        content,
                        origin: Some(origin.to_string()),
                        ..Dataset::default()
                    },
                );
                if let Some(snap) = self.snapshots.get_mut(origin) {
                    snap.clones.insert(dest.to_string());
                }
                Ok(String::new())
            }
            "rename" => {
                let src = args.arg(1, command)?.to_string();
                let dest = args.arg(2, command)?.to_string();
                if src.contains('@') {
                    self.rename_snapshot(command, &src, &dest)
                } else {
                    self.rename_dataset(command, &src, &dest)
                }
            }
            "rollback" => {
                let entity = args.arg(1, command)?;
                let (fs, short) = entity
                    .split_once('@')
                    .ok_or_else(|| fail(command, "not a snapshot name"))?;
                let snaps = self.snapshots_of(fs);
                let Some((latest, _)) = snaps.last() else {
                    return Err(fail(command, format!("cannot open '{entity}': dataset does not exist")));
                };
                if latest != short {
                    if snaps.iter().any(|(s, _)| s == short) {
                        return Err(fail(
                            command,
                            format!("cannot rollback to '{entity}': more recent snapshots or bookmarks exist"),
                        ));
                    }
                    return Err(fail(command, format!("cannot open '{entity}': dataset does not exist")));
                }
                let content = self.snapshots[entity].content.clone();
                if let Some(ds) = self.datasets.get_mut(fs) {
                    ds.content = content;
                }
                Ok(String::new())
            }
            "list" => {
                let name = args
                    .positional
                    .get(1)
                    .ok_or_else(|| fail(command, "missing argument"))?;
                if !self.datasets.contains_key(name) {
                    return Err(fail(command, format!("cannot open '{name}': dataset does not exist")));
                }
                let lines: Vec<String> = if args.option("-t") == Some("snapshot") {
                    self.snapshots_of(name)
                        .into_iter()
                        .map(|(short, _)| format!("{name}@{short}"))
                        .collect()
                } else {
                    self.datasets
                        .keys()
                        .filter(|ds| within(ds, name))
                        .cloned()
                        .collect()
                };
                Ok(lines.iter().map(|l| format!("{l}\n")).collect())
            }
            "unmount" => {
                let name = args.arg(1, command)?;
                let ds = self
                    .datasets
                    .get_mut(name)
                    .ok_or_else(|| fail(command, format!("cannot open '{name}': dataset does not exist")))?;
                if !ds.mounted {
                    return Err(fail(command, format!("cannot unmount '{name}': not currently mounted")));
                }
                ds.mounted = false;
                Ok(String::new())
            }
            other => Err(fail(command, format!("unrecognized command '{other}'"))),
        }
    }

    fn get(&self, command: &str, args: &Args) -> SiloResult<String> {
        let missing = |name: &str| fail(command, format!("cannot open '{name}': dataset does not exist"));
        // `get -H -o name type <name>`
        if args.option("-o") == Some("name") {
            let name = args.arg(2, command)?;
            return if self.exists(name) {
                Ok(format!("{name}\n"))
            } else {
                Err(missing(name))
            };
        }

        let key = args.arg(1, command)?;
        let name = args.arg(2, command)?;
        if let Some(snap) = self.snapshots.get(name) {
            let value = match key {
                "clones" => snap.clones.iter().cloned().collect::<Vec<_>>().join(","),
                "used" | "referenced" => snap.content.len().to_string(),
                "type" => "snapshot".to_string(),
                _ => "-".to_string(),
            };
            return Ok(format!("{value}\n"));
        }

        let ds = self.datasets.get(name).ok_or_else(|| missing(name))?;
        let value = match key {
            "mounted" => (if ds.mounted { "yes" } else { "no" }).to_string(),
            "origin" => ds.origin.clone().unwrap_or_else(|| "-".to_string()),
            "used" | "referenced" => ds.content.len().to_string(),
            "type" => "filesystem".to_string(),
            _ => ds.props.get(key).cloned().unwrap_or_else(|| "-".to_string()),
        };
        Ok(format!("{value}\n"))
    }

    fn destroy(&mut self, command: &str, entity: &str) -> SiloResult<String> {
        if let Some(snap) = self.snapshots.get(entity) {
            if !snap.clones.is_empty() {
                return Err(fail(
                    command,
                    format!("cannot destroy '{entity}': snapshot has dependent clones"),
                ));
            }
            self.snapshots.remove(entity);
            return Ok(String::new());
        }
        if !self.datasets.contains_key(entity) {
            return Err(fail(command, format!("cannot open '{entity}': dataset does not exist")));
        }

        let doomed: Vec<String> = self
            .datasets
            .keys()
            .filter(|name| within(name, entity))
            .cloned()
            .collect();
        for (name, snap) in &self.snapshots {
            if within(name, entity) && snap.clones.iter().any(|c| !within(c, entity)) {
                return Err(fail(
                    command,
                    format!("cannot destroy '{entity}': filesystem has dependent clones"),
                ));
            }
        }

        for name in &doomed {
            if let Some(ds) = self.datasets.remove(name) {
                self.unlink_origin(name, ds.origin.as_ref());
            }
        }
        self.snapshots.retain(|name, _| !within(name, entity));
        Ok(String::new())
    }

    fn rename_dataset(&mut self, command: &str, src: &str, dest: &str) -> SiloResult<String> {
        if !self.datasets.contains_key(src) {
            return Err(fail(command, format!("cannot open '{src}': dataset does not exist")));
        }
        if self.exists(dest) {
            return Err(fail(command, format!("cannot rename to '{dest}': dataset already exists")));
        }
        self.ensure_parents(dest, command)?;

        let moved: Vec<String> = self
            .datasets
            .keys()
            .filter(|name| within(name, src))
            .cloned()
            .collect();
        for name in moved {
            if let Some(ds) = self.datasets.remove(&name) {
                self.datasets.insert(reroot(&name, src, dest), ds);
            }
        }
        let moved: Vec<String> = self
            .snapshots
            .keys()
            .filter(|name| within(name, src))
            .cloned()
            .collect();
        for name in moved {
            if let Some(snap) = self.snapshots.remove(&name) {
                self.snapshots.insert(reroot(&name, src, dest), snap);
            }
        }

        for ds in self.datasets.values_mut() {
            if let Some(origin) = ds.origin.as_mut().filter(|o| within(o, src)) {
                *origin = reroot(origin, src, dest);
            }
        }
        for snap in self.snapshots.values_mut() {
            snap.clones = snap
                .clones
                .iter()
                .map(|c| if within(c, src) { reroot(c, src, dest) } else { c.clone() })
                .collect();
        }
        Ok(String::new())
    }

    fn rename_snapshot(&mut self, command: &str, src: &str, dest: &str) -> SiloResult<String> {
        if self.snapshots.contains_key(dest) {
            return Err(fail(command, format!("cannot rename to '{dest}': dataset already exists")));
        }
        let snap = self
            .snapshots
            .remove(src)
            .ok_or_else(|| fail(command, format!("cannot open '{src}': dataset does not exist")))?;
        for clone in &snap.clones {
            if let Some(ds) = self.datasets.get_mut(clone) {
                ds.origin = Some(dest.to_string());
            }
        }
        self.snapshots.insert(dest.to_string(), snap);
        Ok(String::new())
    }

    fn send(&self, command: &str, args: &Args) -> SiloResult<Vec<u8>> {
        let entity = args.arg(1, command)?;
        let snap = self
            .snapshots
            .get(entity)
            .ok_or_else(|| fail(command, format!("cannot open '{entity}': dataset does not exist")))?;
        let from = match args.option("-i") {
            Some(base) => {
                if !self.snapshots.contains_key(base) {
                    return Err(fail(command, format!("cannot open '{base}': dataset does not exist")));
                }
                base.split_once('@').map(|(_, short)| short.to_string())
            }
            None => None,
        };
        let short = entity.split_once('@').map_or("", |(_, s)| s);
        let payload = StreamPayload {
            snapshot: short.to_string(),
            content: snap.content.clone(),
            from,
        };
        serde_json::to_vec(&payload).map_err(|e| fail(command, e.to_string()))
    }

    fn receive(&mut self, command: &str, target: &str, data: &[u8]) -> SiloResult<()> {
        let payload: StreamPayload = serde_json::from_slice(data)
            .map_err(|e| fail(command, format!("cannot receive: invalid stream ({e})")))?;
        let (fs, short) = match target.split_once('@') {
            Some((fs, short)) => (fs.to_string(), short.to_string()),
            None => (target.to_string(), payload.snapshot.clone()),
        };

        if let Some(base) = &payload.from {
            if !self.snapshots.contains_key(&format!("{fs}@{base}")) {
                return Err(fail(
                    command,
                    format!("cannot receive incremental stream: destination {fs} does not have snapshot {base}"),
                ));
            }
        } else if !self.snapshots_of(&fs).is_empty() {
            return Err(fail(
                command,
                format!("cannot receive new filesystem stream: destination has snapshots ({fs})"),
            ));
        }

        if !self.datasets.contains_key(&fs) {
            self.ensure_parents(&fs, command)?;
            self.datasets.insert(fs.clone(), Dataset::default());
        }
        if let Some(ds) = self.datasets.get_mut(&fs) {
            ds.content.clone_from(&payload.content);
            ds.mounted = false;
        }
        let created = self.tick();
        self.snapshots.insert(
            format!("{fs}@{short}"),
            Snapshot {
                content: payload.content,
                clones: BTreeSet::new(),
                created,
            },
        );
        Ok(())
    }
}

impl FakeZfs {
    /// Create an empty model with no pools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an imported pool.
    pub fn add_pool(&self, pool: &str) {
        let mut state = self.state.lock();
        state.pools.insert(pool.to_string());
        state.datasets.entry(pool.to_string()).or_default();
    }

    /// Add a dataset (and its parents) to an existing pool.
    pub fn add_dataset(&self, name: &str) {
        let mut state = self.state.lock();
        if state.ensure_parents(name, "setup").is_ok() {
            state.datasets.entry(name.to_string()).or_default();
        }
    }

    /// Export a pool so it has to be imported again.
    pub fn export(&self, pool: &str) {
        let mut state = self.state.lock();
        if !state.pools.remove(pool) {
            return;
        }
        let datasets: Vec<String> = state
            .datasets
            .keys()
            .filter(|name| within(name, pool))
            .cloned()
            .collect();
        let snapshots: Vec<String> = state
            .snapshots
            .keys()
            .filter(|name| within(name, pool))
            .cloned()
            .collect();
        let mut exported = Exported::default();
        for name in datasets {
            if let Some(ds) = state.datasets.remove(&name) {
                exported.datasets.push((name, ds));
            }
        }
        for name in snapshots {
            if let Some(snap) = state.snapshots.remove(&name) {
                exported.snapshots.push((name, snap));
            }
        }
        state.exported.insert(pool.to_string(), exported);
    }

    /// Delay every `zfs mount` by `delay`.
    pub fn set_mount_delay(&self, delay: Duration) {
        self.state.lock().mount_delay = delay;
    }

    /// Fail every command whose command line contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.state.lock().fail_on.push(pattern.to_string());
    }

    /// Fail the next command whose command line contains `pattern`.
    pub fn fail_next(&self, pattern: &str) {
        self.state.lock().fail_next.push(pattern.to_string());
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_on.clear();
        state.fail_next.clear();
    }

    /// Whether a dataset or snapshot exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().exists(name)
    }

    /// All dataset names, sorted.
    #[must_use]
    pub fn datasets(&self) -> Vec<String> {
        self.state.lock().datasets.keys().cloned().collect()
    }

    /// Datasets below `root`, excluding `root` itself.
    #[must_use]
    pub fn datasets_under(&self, root: &str) -> Vec<String> {
        self.state
            .lock()
            .datasets
            .keys()
            .filter(|name| within(name, root) && name.as_str() != root)
            .cloned()
            .collect()
    }

    /// Snapshot names of `fs` (after the `@`), oldest first.
    #[must_use]
    pub fn snapshots(&self, fs: &str) -> Vec<String> {
        self.state
            .lock()
            .snapshots_of(fs)
            .into_iter()
            .map(|(short, _)| short)
            .collect()
    }

    /// Content token of a dataset or snapshot.
    #[must_use]
    pub fn content(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .datasets
            .get(name)
            .map(|ds| ds.content.clone())
            .or_else(|| state.snapshots.get(name).map(|s| s.content.clone()))
    }

    /// Replace the content token of a dataset, as if files were written.
    pub fn set_content(&self, name: &str, content: &str) {
        if let Some(ds) = self.state.lock().datasets.get_mut(name) {
            ds.content = content.to_string();
        }
    }

    /// Origin snapshot of a dataset.
    #[must_use]
    pub fn origin(&self, name: &str) -> Option<String> {
        self.state.lock().datasets.get(name).and_then(|ds| ds.origin.clone())
    }

    /// Clones of a snapshot.
    #[must_use]
    pub fn clones(&self, snapshot: &str) -> Vec<String> {
        self.state
            .lock()
            .snapshots
            .get(snapshot)
            .map(|s| s.clones.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A dataset property as set on it.
    #[must_use]
    pub fn property(&self, name: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .datasets
            .get(name)
            .and_then(|ds| ds.props.get(key).cloned())
    }

    /// Whether a dataset is mounted.
    #[must_use]
    pub fn is_mounted(&self, name: &str) -> bool {
        self.state.lock().datasets.get(name).is_some_and(|ds| ds.mounted)
    }

    /// How many times a dataset was mounted.
    #[must_use]
    pub fn mount_count(&self, name: &str) -> usize {
        self.state.lock().datasets.get(name).map_or(0, |ds| ds.mounts)
    }

    /// Every command line run so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<String> {
        self.state.lock().invocations.clone()
    }

    /// How many command lines contained `pattern`.
    #[must_use]
    pub fn count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .invocations
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    /// Record an invocation and apply failure injection.
    fn admit(&self, command: &str) -> SiloResult<()> {
        let mut state = self.state.lock();
        state.invocations.push(command.to_string());
        if let Some(pos) = state.fail_next.iter().position(|p| command.contains(p.as_str())) {
            state.fail_next.remove(pos);
            return Err(fail(command, "injected failure"));
        }
        if state.fail_on.iter().any(|p| command.contains(p.as_str())) {
            return Err(fail(command, "injected failure"));
        }
        Ok(())
    }

    async fn mount(&self, command: &str, name: &str) -> SiloResult<String> {
        let delay = {
            let state = self.state.lock();
            let ds = state
                .datasets
                .get(name)
                .ok_or_else(|| fail(command, format!("cannot open '{name}': dataset does not exist")))?;
            if ds.mounted {
                return Err(fail(command, format!("cannot mount '{name}': filesystem already mounted")));
            }
            if ds.props.get("mountpoint").is_none_or(|mp| mp == "none" || mp == "-") {
                return Err(fail(command, format!("cannot mount '{name}': no mountpoint set")));
            }
            state.mount_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let ds = state
            .datasets
            .get_mut(name)
            .ok_or_else(|| fail(command, format!("cannot open '{name}': dataset does not exist")))?;
        if ds.mounted {
            return Err(fail(command, format!("cannot mount '{name}': filesystem already mounted")));
        }
        ds.mounted = true;
        ds.mounts += 1;
        Ok(String::new())
    }
}

#[async_trait]
impl CommandRunner for FakeZfs {
    async fn run(&self, tool: &str, args: &[&str]) -> SiloResult<String> {
        let command = render(tool, args);
        self.admit(&command)?;
        let parsed = Args::parse(args);

        if tool == "zfs" && args.first() == Some(&"mount") {
            let name = parsed.arg(1, &command)?.to_string();
            return self.mount(&command, &name).await;
        }

        let mut state = self.state.lock();
        match tool {
            "zpool" => state.zpool(&command, &parsed),
            "zfs" => state.zfs(&command, &parsed),
            other => Err(fail(&command, format!("{other}: command not found"))),
        }
    }

    async fn spawn_piped(&self, tool: &str, args: &[&str], pipe: Pipe) -> SiloResult<PipedCommand> {
        let command = render(tool, args);
        self.admit(&command)?;
        let parsed = Args::parse(args);

        match (tool, parsed.positional.first().map(String::as_str), pipe) {
            ("zfs", Some("send"), Pipe::Stdout) => {
                let data = self.state.lock().send(&command, &parsed)?;
                let stdout: Box<dyn AsyncRead + Send + Unpin> = Box::new(Cursor::new(data));
                Ok(PipedCommand::new(Some(stdout), None, async { Ok(()) }.boxed()))
            }
            ("zfs", Some("receive"), Pipe::Stdin) => {
                let target = parsed.arg(1, &command)?.to_string();
                let (writer, mut reader) = tokio::io::duplex(64 * 1024);
                let state = self.state.clone();
                let task = tokio::spawn(async move {
                    let mut data = Vec::new();
                    reader.read_to_end(&mut data).await?;
                    state.lock().receive(&command, &target, &data)
                });
                let completion = async move {
                    task.await
                        .map_err(|e| SiloError::internal(format!("receive task failed: {e}")))?
                }
                .boxed();
                let stdin: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
                Ok(PipedCommand::new(None, Some(stdin), completion))
            }
            _ => Err(fail(&command, "unsupported streaming command")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn zfs(fake: &FakeZfs, args: &[&str]) -> SiloResult<String> {
        fake.run("zfs", args).await
    }

    #[tokio::test]
    async fn clones_pin_their_origin() {
        let fake = FakeZfs::new();
        fake.add_pool("tank");
        zfs(&fake, &["create", "-p", "tank/images/abc"]).await.unwrap();
        fake.set_content("tank/images/abc", "rootfs-v1");
        zfs(&fake, &["snapshot", "-r", "tank/images/abc@readonly"]).await.unwrap();
        zfs(&fake, &["clone", "-p", "-o", "mountpoint=/mnt/c1", "tank/images/abc@readonly", "tank/containers/c1"])
            .await
            .unwrap();

        assert_eq!(fake.content("tank/containers/c1").as_deref(), Some("rootfs-v1"));
        assert_eq!(fake.origin("tank/containers/c1").as_deref(), Some("tank/images/abc@readonly"));
        assert!(zfs(&fake, &["destroy", "-r", "tank/images/abc"]).await.is_err());

        zfs(&fake, &["rename", "-p", "tank/images/abc", "tank/deleted/images/abc"])
            .await
            .unwrap();
        assert_eq!(
            fake.origin("tank/containers/c1").as_deref(),
            Some("tank/deleted/images/abc@readonly")
        );
        zfs(&fake, &["destroy", "-r", "tank/containers/c1"]).await.unwrap();
        zfs(&fake, &["destroy", "-r", "tank/deleted/images/abc"]).await.unwrap();
        assert!(fake.datasets_under("tank/deleted").iter().all(|d| !d.contains("abc")));
    }

    #[tokio::test]
    async fn rollback_only_to_latest() {
        let fake = FakeZfs::new();
        fake.add_pool("tank");
        zfs(&fake, &["create", "-p", "tank/containers/c1"]).await.unwrap();
        fake.set_content("tank/containers/c1", "v0");
        zfs(&fake, &["snapshot", "-r", "tank/containers/c1@snapshot-s0"]).await.unwrap();
        fake.set_content("tank/containers/c1", "v1");
        zfs(&fake, &["snapshot", "-r", "tank/containers/c1@snapshot-s1"]).await.unwrap();
        fake.set_content("tank/containers/c1", "v2");

        assert!(zfs(&fake, &["rollback", "tank/containers/c1@snapshot-s0"]).await.is_err());
        zfs(&fake, &["rollback", "tank/containers/c1@snapshot-s1"]).await.unwrap();
        assert_eq!(fake.content("tank/containers/c1").as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn injected_failures() {
        let fake = FakeZfs::new();
        fake.add_pool("tank");
        fake.fail_next("create");
        assert!(zfs(&fake, &["create", "-p", "tank/custom/v1"]).await.is_err());
        zfs(&fake, &["create", "-p", "tank/custom/v1"]).await.unwrap();
        assert_eq!(fake.count("zfs create -p tank/custom/v1"), 2);
    }
}
