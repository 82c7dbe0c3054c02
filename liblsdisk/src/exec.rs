//! The narrow OS interface every host operation goes through.
//!
//! Disk discovery, mounting, formatting and loop-device management all shell
//! out to the standard util-linux / e2fsprogs / xfsprogs tools.  Routing them
//! through [`HostSystem`] gives each call explicit success/failure with
//! captured output, and lets tests substitute a simulated host.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CsiError;

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Filesystem usage as reported by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    /// `f_frsize * f_blocks`.
    pub total_bytes: u64,
    /// `f_frsize * f_bavail`, space available to unprivileged users.
    pub free_bytes: u64,
    /// `f_files`.
    pub total_inodes: u64,
    /// `f_favail`.
    pub free_inodes: u64,
}

impl FsUsage {
    /// A disk nothing has been written to: every byte is still free.
    pub fn is_untouched(&self) -> bool {
        self.free_bytes == self.total_bytes
    }
}

/// Host operations the driver performs.
#[async_trait]
pub trait HostSystem: Send + Sync {
    /// Run `program` with `args` and capture its output.
    ///
    /// Only a failure to spawn the process is an `Err`; a non-zero exit is
    /// reported through [`CommandOutput::code`].
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CsiError>;

    /// Usage of the filesystem containing `path`.
    async fn fs_usage(&self, path: &Path) -> Result<FsUsage, CsiError>;

    /// Whether `path` (a device node or directory) exists on the host.
    async fn exists(&self, path: &Path) -> bool;

    /// Like [`Self::output`], but a non-zero exit becomes
    /// [`CsiError::CommandFailed`].
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CsiError> {
        let out = self.output(program, args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(CsiError::CommandFailed {
                command: render(program, args),
                code: out.code,
                stderr: out.stderr.trim().to_owned(),
            })
        }
    }
}

pub(crate) fn render(program: &str, args: &[&str]) -> String {
    let mut command = program.to_owned();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

/// [`HostSystem`] backed by the real Linux host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxHost;

#[async_trait]
impl HostSystem for LinuxHost {
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CsiError> {
        debug!(command = %render(program, args), "running host command");
        let out = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| CsiError::Internal(format!("spawn {program}: {e}")))?;
        Ok(CommandOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    async fn fs_usage(&self, path: &Path) -> Result<FsUsage, CsiError> {
        let path = path.to_path_buf();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(path.as_path()))
            .await
            .map_err(CsiError::internal)?
            .map_err(|e| CsiError::Internal(format!("statvfs: {e}")))?;
        let frsize = stat.fragment_size() as u64;
        Ok(FsUsage {
            total_bytes: frsize * stat.blocks() as u64,
            free_bytes: frsize * stat.blocks_available() as u64,
            total_inodes: stat.files() as u64,
            free_inodes: stat.files_available() as u64,
        })
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}
