//! Test doubles: a simulated host and in-memory cluster collaborators.
//!
//! [`FakeHost`] answers the host commands the driver issues.  Each fake disk
//! owns a directory under `{root}/disks/`; mounting the disk replaces the
//! mount point with a symlink to that directory, so files written through a
//! scratch mount land on the disk and stay there after unmount.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::config::ExpansionEnv;
use crate::error::CsiError;
use crate::exec::{CommandOutput, FsUsage, HostSystem, render};
use crate::metadata::{ExpansionHelper, VolumeMetadata};
use crate::types::{StorageParams, VolumeId};

const INODES: u64 = 65_536;

#[derive(Debug, Clone)]
struct FakeDisk {
    name: String,
    model: String,
    rotational: bool,
    total_bytes: u64,
    used_bytes: u64,
    fs_type: Option<String>,
    present: bool,
}

#[derive(Debug, Clone)]
enum FakeMount {
    Disk(String),
    Loop(u32),
    Bind(PathBuf),
}

#[derive(Debug, Clone)]
struct LoopBinding {
    path: PathBuf,
    canonical: Option<PathBuf>,
    size: u64,
}

#[derive(Debug, Default)]
struct FakeState {
    disks: Vec<FakeDisk>,
    mounts: BTreeMap<PathBuf, FakeMount>,
    loops: BTreeMap<u32, LoopBinding>,
    loop_nodes: BTreeSet<u32>,
    association_lag: u32,
    pending_lag: u32,
    failures: Vec<String>,
    commands: Vec<String>,
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

fn loop_minor(device: &str) -> Option<u32> {
    device.strip_prefix("/dev/loop")?.parse().ok()
}

fn usage(total: u64, free: u64) -> FsUsage {
    FsUsage {
        total_bytes: total,
        free_bytes: free,
        total_inodes: INODES,
        free_inodes: INODES - 11,
    }
}

impl FakeState {
    fn disk(&self, name: &str) -> Option<&FakeDisk> {
        self.disks.iter().find(|d| d.name == name)
    }

    fn disk_by_path(&self, path: &str) -> Option<&FakeDisk> {
        self.disk(path.strip_prefix("/dev/")?)
    }

    fn first_free_loop(&self) -> u32 {
        (0..).find(|n| !self.loops.contains_key(n)).unwrap_or_default()
    }

    fn bindings_for(&self, file: &str) -> Vec<u32> {
        let canonical = std::fs::canonicalize(file).ok();
        self.loops
            .iter()
            .filter(|(_, b)| {
                b.path == Path::new(file) || (canonical.is_some() && b.canonical == canonical)
            })
            .map(|(n, _)| *n)
            .collect()
    }

    /// What `findmnt` reports as the source of the mount at `dest`.
    fn source_of(&self, dest: &Path) -> Option<String> {
        match self.mounts.get(dest)? {
            FakeMount::Disk(name) => Some(format!("/dev/{name}")),
            FakeMount::Loop(n) => Some(format!("/dev/loop{n}")),
            FakeMount::Bind(src) => {
                Some(self.source_of(src).unwrap_or_else(|| src.display().to_string()))
            }
        }
    }
}

/// Simulated Linux host.
pub(crate) struct FakeHost {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new(root: &Path) -> Arc<Self> {
        let state = FakeState {
            loop_nodes: (0..8).collect(),
            ..Default::default()
        };
        Arc::new(Self {
            root: root.join("host"),
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn disk_dir(&self, name: &str) -> PathBuf {
        self.root.join("disks").join(name)
    }

    pub fn add_disk(&self, name: &str, model: &str, rotational: bool, total_bytes: u64, fs_type: Option<&str>) {
        std::fs::create_dir_all(self.disk_dir(name)).unwrap();
        self.state().disks.push(FakeDisk {
            name: name.to_owned(),
            model: model.to_owned(),
            rotational,
            total_bytes,
            used_bytes: 0,
            fs_type: fs_type.map(str::to_owned),
            present: true,
        });
    }

    /// Bytes in use on `name` besides the files under its directory.
    pub fn set_used(&self, name: &str, bytes: u64) {
        if let Some(disk) = self.state().disks.iter_mut().find(|d| d.name == name) {
            disk.used_bytes = bytes;
        }
    }

    /// Keep `name` in `lsblk` output but remove its device node.
    pub fn hide_device(&self, name: &str) {
        if let Some(disk) = self.state().disks.iter_mut().find(|d| d.name == name) {
            disk.present = false;
        }
    }

    /// Only `/dev/loop0` .. `/dev/loop{count-1}` exist initially.
    pub fn set_loop_nodes(&self, count: u32) {
        self.state().loop_nodes = (0..count).collect();
    }

    /// Hide a new binding from the next `lag` association queries.
    pub fn set_association_lag(&self, lag: u32) {
        self.state().association_lag = lag;
    }

    /// Fail every command whose rendered form starts with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        self.state().failures.push(prefix.to_owned());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn mounted_paths(&self) -> Vec<PathBuf> {
        self.state().mounts.keys().cloned().collect()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state().mounts.contains_key(path)
    }

    pub fn bound_loops(&self) -> usize {
        self.state().loops.len()
    }

    fn lsblk(state: &FakeState) -> CommandOutput {
        let lines: Vec<String> = state
            .disks
            .iter()
            .map(|d| {
                format!(
                    "NAME=\"{}\" MODEL=\"{}\" ROTA=\"{}\"",
                    d.name,
                    d.model,
                    u8::from(d.rotational)
                )
            })
            .collect();
        CommandOutput::ok(lines.join("\n"))
    }

    fn mount(&self, state: &mut FakeState, args: &[&str]) -> CommandOutput {
        match args {
            ["--bind", src, dest] => {
                if !Path::new(src).exists() {
                    return CommandOutput::failed(32, format!("special device {src} does not exist"));
                }
                state
                    .mounts
                    .insert(PathBuf::from(dest), FakeMount::Bind(PathBuf::from(src)));
                CommandOutput::ok("")
            }
            ["-o", _, dest] => {
                if state.mounts.contains_key(Path::new(dest)) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(32, format!("{dest} not mounted"))
                }
            }
            [src, dest] => {
                if let Some(n) = loop_minor(src) {
                    if !state.loops.contains_key(&n) {
                        return CommandOutput::failed(32, format!("{src} is not bound"));
                    }
                    state.mounts.insert(PathBuf::from(dest), FakeMount::Loop(n));
                    return CommandOutput::ok("");
                }
                let Some(disk) = state.disk_by_path(src).filter(|d| d.present).cloned() else {
                    return CommandOutput::failed(32, format!("special device {src} does not exist"));
                };
                if disk.fs_type.is_none() {
                    return CommandOutput::failed(32, "wrong fs type, bad option, bad superblock");
                }
                if std::fs::remove_dir(dest).is_err()
                    || symlink(self.disk_dir(&disk.name), dest).is_err()
                {
                    return CommandOutput::failed(32, format!("mount point {dest} is not an empty directory"));
                }
                state.mounts.insert(PathBuf::from(dest), FakeMount::Disk(disk.name));
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "unsupported mount invocation"),
        }
    }

    fn umount(state: &mut FakeState, args: &[&str]) -> CommandOutput {
        let Some(dest) = args.last() else {
            return CommandOutput::failed(1, "usage");
        };
        match state.mounts.remove(Path::new(dest)) {
            Some(FakeMount::Disk(_)) => {
                let restored = std::fs::remove_file(dest).and_then(|_| std::fs::create_dir(dest));
                match restored {
                    Ok(()) => CommandOutput::ok(""),
                    Err(e) => CommandOutput::failed(32, e.to_string()),
                }
            }
            Some(_) => CommandOutput::ok(""),
            None => CommandOutput::failed(32, format!("{dest}: not mounted")),
        }
    }

    fn losetup(state: &mut FakeState, args: &[&str]) -> CommandOutput {
        match args {
            ["-j", file] => {
                if state.pending_lag > 0 {
                    state.pending_lag -= 1;
                    return CommandOutput::ok("");
                }
                let lines: Vec<String> = state
                    .bindings_for(file)
                    .into_iter()
                    .map(|n| format!("/dev/loop{n}: [2049]:131 ({file})"))
                    .collect();
                CommandOutput::ok(lines.join("\n"))
            }
            ["-f"] => CommandOutput::ok(format!("/dev/loop{}\n", state.first_free_loop())),
            ["--direct-io=on", "-f", file] => {
                let Ok(meta) = std::fs::metadata(file) else {
                    return CommandOutput::failed(1, format!("{file}: No such file or directory"));
                };
                let n = state.first_free_loop();
                if !state.loop_nodes.contains(&n) {
                    return CommandOutput::failed(1, "could not find any free loop device");
                }
                state.loops.insert(
                    n,
                    LoopBinding {
                        path: PathBuf::from(file),
                        canonical: std::fs::canonicalize(file).ok(),
                        size: meta.len(),
                    },
                );
                state.pending_lag = state.association_lag;
                CommandOutput::ok("")
            }
            ["-d", device] => match loop_minor(device).and_then(|n| state.loops.remove(&n)) {
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::failed(1, format!("{device}: detach failed")),
            },
            ["-c", device] => match loop_minor(device).and_then(|n| state.loops.get_mut(&n)) {
                Some(binding) => {
                    if let Some(meta) = binding.canonical.as_ref().and_then(|p| std::fs::metadata(p).ok()) {
                        binding.size = meta.len();
                    }
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, format!("{device}: not bound")),
            },
            _ => CommandOutput::failed(1, "unsupported losetup invocation"),
        }
    }

    fn blkid(state: &FakeState, src: &str) -> CommandOutput {
        if let Some(n) = loop_minor(src) {
            // Every image is formatted as ext4.
            return if state.loops.contains_key(&n) {
                CommandOutput::ok("ext4\n")
            } else {
                CommandOutput::failed(2, "")
            };
        }
        match state.disk_by_path(src).and_then(|d| d.fs_type.clone()) {
            Some(fs_type) => CommandOutput::ok(format!("{fs_type}\n")),
            None => CommandOutput::failed(2, ""),
        }
    }
}

#[async_trait]
impl HostSystem for FakeHost {
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CsiError> {
        let command = render(program, args);
        let mut state = self.state();
        state.commands.push(command.clone());
        if state.failures.iter().any(|f| command.starts_with(f.as_str())) {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        let out = match program {
            "lsblk" => Self::lsblk(&state),
            "findmnt" => {
                let dest = Path::new(args.last().copied().unwrap_or_default());
                match state.source_of(dest) {
                    Some(source) => CommandOutput::ok(
                        json!({ "filesystems": [{ "target": dest, "source": source }] }).to_string(),
                    ),
                    None => CommandOutput::failed(1, ""),
                }
            }
            "blkid" => Self::blkid(&state, args.last().copied().unwrap_or_default()),
            "mkfs.xfs" => {
                let src = args.last().copied().unwrap_or_default();
                match state.disks.iter_mut().find(|d| format!("/dev/{}", d.name) == src) {
                    Some(disk) => {
                        disk.fs_type = Some("xfs".to_owned());
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(1, format!("{src}: No such file or directory")),
                }
            }
            "mkfs.ext4" => {
                let file = args.last().copied().unwrap_or_default();
                if Path::new(file).exists() {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, format!("{file}: No such file or directory"))
                }
            }
            "mount" => self.mount(&mut state, args),
            "umount" => Self::umount(&mut state, args),
            "losetup" => Self::losetup(&mut state, args),
            "mknod" => match args.first().and_then(|dev| loop_minor(dev)) {
                Some(n) => {
                    state.loop_nodes.insert(n);
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, "unsupported mknod invocation"),
            },
            "resize2fs" | "xfs_growfs" => CommandOutput::ok(""),
            _ => CommandOutput::failed(127, format!("{program}: command not found")),
        };
        Ok(out)
    }

    async fn fs_usage(&self, path: &Path) -> Result<FsUsage, CsiError> {
        let state = self.state();
        let mut at = path.to_path_buf();
        loop {
            match state.mounts.get(&at) {
                Some(FakeMount::Disk(name)) => {
                    let disk = state
                        .disk(name)
                        .ok_or_else(|| CsiError::Internal(format!("unknown disk {name}")))?;
                    let used = disk.used_bytes + dir_size(&self.disk_dir(name));
                    return Ok(usage(disk.total_bytes, disk.total_bytes.saturating_sub(used)));
                }
                Some(FakeMount::Loop(n)) => {
                    let size = state.loops.get(n).map(|b| b.size).unwrap_or_default();
                    return Ok(usage(size, size));
                }
                Some(FakeMount::Bind(src)) => at = src.clone(),
                None => {
                    return Err(CsiError::Internal(format!(
                        "statvfs: {} is not on a simulated filesystem",
                        path.display()
                    )));
                }
            }
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        let as_str = path.to_string_lossy();
        if let Some(n) = loop_minor(&as_str) {
            return self.state().loop_nodes.contains(&n);
        }
        if let Some(disk) = self.state().disk_by_path(&as_str) {
            return disk.present;
        }
        if as_str.starts_with("/dev/") {
            return false;
        }
        path.exists()
    }
}

// ---------------------------------------------------------------------------
// Cluster collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MetadataState {
    classes: HashMap<String, StorageParams>,
    volumes: HashMap<VolumeId, (String, String)>,
    failure: Option<String>,
}

/// PV and StorageClass metadata held in memory.
#[derive(Debug, Default)]
pub(crate) struct InMemoryMetadata {
    state: Mutex<MetadataState>,
}

impl InMemoryMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_class(&self, name: &str, params: StorageParams) {
        self.state.lock().unwrap().classes.insert(name.to_owned(), params);
    }

    pub fn add_volume(&self, volume_id: &str, class: &str, node: &str) {
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(VolumeId::from(volume_id), (class.to_owned(), node.to_owned()));
    }

    pub fn remove_volume(&self, volume_id: &str) {
        self.state.lock().unwrap().volumes.remove(&VolumeId::from(volume_id));
    }

    /// Make every lookup fail with a non-absence error.
    pub fn fail_with(&self, message: &str) {
        self.state.lock().unwrap().failure = Some(message.to_owned());
    }

    fn volume(&self, volume_id: &VolumeId) -> Result<(String, String), CsiError> {
        let state = self.state.lock().unwrap();
        if let Some(message) = &state.failure {
            return Err(CsiError::Metadata(message.clone()));
        }
        state
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| CsiError::MetadataNotFound {
                kind: "PersistentVolume",
                name: volume_id.to_string(),
            })
    }
}

#[async_trait]
impl VolumeMetadata for InMemoryMetadata {
    async fn storage_class_of(&self, volume_id: &VolumeId) -> Result<String, CsiError> {
        Ok(self.volume(volume_id)?.0)
    }

    async fn storage_params(&self, storage_class: &str) -> Result<StorageParams, CsiError> {
        self.state
            .lock()
            .unwrap()
            .classes
            .get(storage_class)
            .cloned()
            .ok_or_else(|| CsiError::MetadataNotFound {
                kind: "StorageClass",
                name: storage_class.to_owned(),
            })
    }

    async fn node_of(&self, volume_id: &VolumeId) -> Result<String, CsiError> {
        Ok(self.volume(volume_id)?.1)
    }
}

/// Records helper invocations and reports a fixed outcome.
#[derive(Debug)]
pub(crate) struct FakeExpansionHelper {
    succeed: bool,
    calls: Mutex<Vec<(String, ExpansionEnv)>>,
}

impl FakeExpansionHelper {
    pub fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            succeed,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, ExpansionEnv)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExpansionHelper for FakeExpansionHelper {
    async fn expand(&self, node: &str, env: &ExpansionEnv) -> Result<bool, CsiError> {
        self.calls
            .lock()
            .unwrap()
            .push((node.to_owned(), env.clone()));
        Ok(self.succeed)
    }
}
