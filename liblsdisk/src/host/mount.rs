//! Mount Manager: idempotent mount, bind-mount and unmount with filesystem
//! detection, plus online filesystem growth.
//!
//! Mounting a target that is already mounted is a no-op, and so is
//! unmounting a target that is not mounted.  Mount state is always read back
//! from the kernel (via `findmnt`) rather than inferred from directories.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::CsiError;
use crate::exec::HostSystem;
use crate::lock::KeyedLocks;

/// Filesystem every raw disk is formatted with on first use.
pub const DISK_FS_TYPE: &str = "xfs";

/// Filesystem types the driver mounts without formatting.
const SUPPORTED_FS_TYPES: [&str; 2] = ["xfs", "ext4"];

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<FindmntEntry>,
}

#[derive(Debug, Deserialize)]
struct FindmntEntry {
    source: String,
}

/// Lock key held while deciding whether `src` needs formatting.
fn format_key(src: &str) -> String {
    format!("format:{src}")
}

#[derive(Clone)]
pub struct MountManager {
    host: Arc<dyn HostSystem>,
    locks: KeyedLocks,
}

impl MountManager {
    pub fn new(host: Arc<dyn HostSystem>, locks: KeyedLocks) -> Self {
        Self { host, locks }
    }

    /// Source of the filesystem mounted exactly at `path`, or `None` when
    /// `path` is not a mount point.
    pub async fn mount_source(&self, path: &Path) -> Result<Option<String>, CsiError> {
        let target = path.to_string_lossy();
        let out = self
            .host
            .output(
                "findmnt",
                &["--json", "--first-only", "--nofsroot", "--mountpoint", &target],
            )
            .await?;
        // findmnt exits 1 when nothing is mounted there.
        if !out.success() || out.stdout.trim().is_empty() {
            return Ok(None);
        }
        let parsed: FindmntOutput = serde_json::from_str(out.stdout.trim())
            .map_err(|e| CsiError::Internal(format!("parse findmnt output for {target}: {e}")))?;
        Ok(parsed.filesystems.into_iter().next().map(|fs| fs.source))
    }

    pub async fn is_mounted(&self, path: &Path) -> Result<bool, CsiError> {
        Ok(self.mount_source(path).await?.is_some())
    }

    /// Filesystem type on `src`, `None` when blkid finds no signature.
    pub async fn fs_type(&self, src: &str) -> Result<Option<String>, CsiError> {
        let out = self
            .host
            .output("blkid", &["-o", "value", "-s", "TYPE", src])
            .await?;
        match out.code {
            Some(0) => {
                let fs_type = out.stdout.trim();
                Ok((!fs_type.is_empty()).then(|| fs_type.to_owned()))
            }
            // blkid exits 2 when no recognisable signature is found.
            Some(2) => Ok(None),
            code => Err(CsiError::CommandFailed {
                command: format!("blkid -o value -s TYPE {src}"),
                code,
                stderr: out.stderr.trim().to_owned(),
            }),
        }
    }

    /// Mount `src` at `dest`, creating `dest` if needed.
    ///
    /// A source without any filesystem is formatted as xfs first, which is
    /// how raw disks are initialised on first use.  Detection and formatting
    /// run under the device's format key.  Filesystems other than xfs and
    /// ext4 are rejected.
    pub async fn mount(&self, src: &str, dest: &Path) -> Result<(), CsiError> {
        if !self.host.exists(Path::new(src)).await {
            return Err(CsiError::MountFailed {
                path: dest.display().to_string(),
                reason: format!("source {src} does not exist"),
            });
        }
        tokio::fs::create_dir_all(dest).await?;

        if self.is_mounted(dest).await? {
            debug!(src, dest = %dest.display(), "already mounted");
            return Ok(());
        }

        let dest_str = dest.to_string_lossy();
        {
            let _format = self.locks.lock(&format_key(src)).await;
            match self.fs_type(src).await? {
                Some(fs_type) if SUPPORTED_FS_TYPES.contains(&fs_type.as_str()) => {}
                Some(fs_type) => {
                    return Err(CsiError::UnsupportedFilesystem {
                        device: src.to_owned(),
                        fs_type,
                    });
                }
                None => {
                    info!(src, "no filesystem found, formatting as {DISK_FS_TYPE}");
                    self.host.run("mkfs.xfs", &["-f", src]).await?;
                }
            }
        }

        self.host.run("mount", &[src, &dest_str]).await?;
        debug!(src, dest = %dest_str, "mounted");
        Ok(())
    }

    /// Bind-mount directory `src` at `dest`, creating `dest` and its parents.
    pub async fn mount_bind(&self, src: &Path, dest: &Path, read_only: bool) -> Result<(), CsiError> {
        if !self.host.exists(src).await {
            return Err(CsiError::MountFailed {
                path: dest.display().to_string(),
                reason: format!("bind source {} does not exist", src.display()),
            });
        }
        tokio::fs::create_dir_all(dest).await?;

        if self.is_mounted(dest).await? {
            debug!(dest = %dest.display(), "bind target already mounted");
            return Ok(());
        }

        let src_str = src.to_string_lossy();
        let dest_str = dest.to_string_lossy();
        self.host.run("mount", &["--bind", &src_str, &dest_str]).await?;

        // MS_RDONLY is ignored on the initial bind; it takes a remount.
        if read_only {
            self.host
                .run("mount", &["-o", "remount,bind,ro", &dest_str])
                .await?;
        }
        Ok(())
    }

    /// Lazily unmount `dest` if it is mounted.  Returns whether an unmount
    /// happened.
    pub async fn unmount(&self, dest: &Path) -> Result<bool, CsiError> {
        if !self.is_mounted(dest).await? {
            debug!(dest = %dest.display(), "not mounted, nothing to unmount");
            return Ok(false);
        }
        let dest_str = dest.to_string_lossy();
        self.host
            .run("umount", &["-l", &dest_str])
            .await
            .map_err(|e| CsiError::UnmountFailed {
                path: dest_str.to_string(),
                reason: e.to_string(),
            })?;
        Ok(true)
    }

    /// Grow the live filesystem on `device`, which is mounted at
    /// `mount_point`, to fill the (already larger) device.
    pub async fn extend_fs(&self, device: &str, mount_point: &Path) -> Result<(), CsiError> {
        match self.fs_type(device).await?.as_deref() {
            Some("ext4") => {
                self.host.run("resize2fs", &[device]).await?;
            }
            Some("xfs") => {
                let target = mount_point.to_string_lossy();
                self.host.run("xfs_growfs", &["-d", &target]).await?;
            }
            other => {
                return Err(CsiError::UnsupportedFilesystem {
                    device: device.to_owned(),
                    fs_type: other.unwrap_or_default().to_owned(),
                });
            }
        }
        info!(device, "filesystem extended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::FakeHost;

    fn manager(host: &Arc<FakeHost>) -> MountManager {
        MountManager::new(host.clone(), KeyedLocks::new())
    }

    #[tokio::test]
    async fn mount_twice_mounts_once() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        host.add_disk("sdb", "SSD-A", false, 1 << 30, Some("xfs"));
        let mounts = manager(&host);
        let dest = tmp.path().join("scratch");

        mounts.mount("/dev/sdb", &dest).await.unwrap();
        mounts.mount("/dev/sdb", &dest).await.unwrap();

        assert_eq!(host.count_commands("mount /dev/sdb"), 1);
        assert_eq!(
            mounts.mount_source(&dest).await.unwrap().as_deref(),
            Some("/dev/sdb")
        );
    }

    #[tokio::test]
    async fn raw_disk_is_formatted_before_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        host.add_disk("sdc", "SSD-A", false, 1 << 30, None);
        let mounts = manager(&host);

        mounts.mount("/dev/sdc", &tmp.path().join("m")).await.unwrap();

        assert_eq!(host.count_commands("mkfs.xfs -f /dev/sdc"), 1);
        assert_eq!(mounts.fs_type("/dev/sdc").await.unwrap().as_deref(), Some("xfs"));
    }

    #[tokio::test]
    async fn blank_disk_is_formatted_once_across_mount_points() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        host.add_disk("sdc", "SSD-A", false, 1 << 30, None);
        let locks = KeyedLocks::new();
        let mounts = MountManager::new(host.clone(), locks.clone());
        let first = tmp.path().join("scratch/SSD-A-v1");
        let second = tmp.path().join("scratch/SSD-A-v2");

        // Detection waits while another caller holds the device's key.
        let held = locks.lock("format:/dev/sdc").await;
        let pending = mounts.mount("/dev/sdc", &first);
        tokio::pin!(pending);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut pending)
                .await
                .is_err()
        );
        assert_eq!(host.count_commands("blkid"), 0);
        drop(held);
        pending.await.unwrap();

        let other = MountManager::new(host.clone(), locks.clone());
        let (a, b) = tokio::join!(mounts.unmount(&first), other.mount("/dev/sdc", &second));
        a.unwrap();
        b.unwrap();

        assert_eq!(host.count_commands("mkfs.xfs -f /dev/sdc"), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn foreign_filesystem_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        host.add_disk("sdd", "SSD-A", false, 1 << 30, Some("ntfs"));
        let mounts = manager(&host);

        let err = mounts.mount("/dev/sdd", &tmp.path().join("m")).await.unwrap_err();
        assert!(matches!(err, CsiError::UnsupportedFilesystem { .. }));
        assert_eq!(host.count_commands("mount /dev/sdd"), 0);
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        let mounts = manager(&host);
        let err = mounts.mount("/dev/nope", &tmp.path().join("m")).await.unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }));
    }

    #[tokio::test]
    async fn unmount_only_when_mounted() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        host.add_disk("sdb", "SSD-A", false, 1 << 30, Some("ext4"));
        let mounts = manager(&host);
        let dest = tmp.path().join("scratch");

        assert!(!mounts.unmount(&dest).await.unwrap());
        mounts.mount("/dev/sdb", &dest).await.unwrap();
        assert!(mounts.unmount(&dest).await.unwrap());
        assert!(!mounts.is_mounted(&dest).await.unwrap());
        assert_eq!(host.count_commands("umount -l"), 1);
    }

    #[tokio::test]
    async fn bind_mount_creates_target_and_remounts_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        let mounts = manager(&host);
        let src = tmp.path().join("staging");
        std::fs::create_dir_all(&src).unwrap();
        let dest = tmp.path().join("pods/uid/volumes/v1");

        mounts.mount_bind(&src, &dest, true).await.unwrap();
        mounts.mount_bind(&src, &dest, true).await.unwrap();

        assert!(dest.is_dir());
        assert_eq!(host.count_commands("mount --bind"), 1);
        assert_eq!(host.count_commands("mount -o remount,bind,ro"), 1);
    }

    #[tokio::test]
    async fn extend_fs_dispatches_on_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(tmp.path());
        host.add_disk("sdb", "SSD-A", false, 1 << 30, Some("ext4"));
        host.add_disk("sdc", "SSD-A", false, 1 << 30, Some("xfs"));
        host.add_disk("sdd", "SSD-A", false, 1 << 30, Some("btrfs"));
        let mounts = manager(&host);
        let mp = tmp.path().join("mp");

        mounts.extend_fs("/dev/sdb", &mp).await.unwrap();
        mounts.extend_fs("/dev/sdc", &mp).await.unwrap();
        let err = mounts.extend_fs("/dev/sdd", &mp).await.unwrap_err();

        assert_eq!(host.count_commands("resize2fs /dev/sdb"), 1);
        assert_eq!(host.count_commands("xfs_growfs -d"), 1);
        assert!(matches!(err, CsiError::UnsupportedFilesystem { .. }));
    }
}
