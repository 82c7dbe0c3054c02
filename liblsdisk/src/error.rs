//! CSI error types.
//!
//! All errors in the `liblsdisk` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! converts into a [`tonic::Status`] so the CSI caller sees the right gRPC
//! status code.  Host-command failures are never retried locally; they
//! surface as RPC failures and the orchestrator retries the whole call.

use thiserror::Error;
use tonic::{Code, Status};

/// Unified error type for CSI operations.
#[derive(Debug, Error)]
pub enum CsiError {
    /// The caller supplied an invalid argument (e.g. an unsupported access mode).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No disk satisfies the storage model / disk type / full-disk policy.
    #[error("no disk with storage model {0} found")]
    NoMatchingDisk(String),

    /// The Kubernetes object backing a lookup is gone.
    #[error("{kind} {name} not found")]
    MetadataNotFound {
        /// Object kind, e.g. `PersistentVolume`.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// The metadata store failed for a reason other than absence.
    #[error("metadata lookup failed: {0}")]
    Metadata(String),

    /// A filesystem type outside `{ext4, xfs}` was found where one of those is required.
    #[error("unsupported filesystem type {fs_type:?} on {device}")]
    UnsupportedFilesystem {
        /// Device or file that was probed.
        device: String,
        /// Detected filesystem type.
        fs_type: String,
    },

    /// An image file cannot grow to the requested size because it is already
    /// at least that large.
    #[error("image {path} is already {current} bytes, requested {requested}")]
    AlreadyAtSize {
        /// Image file path.
        path: String,
        /// Current size in bytes.
        current: u64,
        /// Requested size in bytes.
        requested: u64,
    },

    /// The volume's image file does not exist at the probed location.
    #[error("image file {0} not found")]
    ImageNotFound(String),

    /// A volume path that must be a mount point is not mounted.
    #[error("{0} is not a mount point")]
    NotMounted(String),

    /// A volume path handed in by the caller does not exist.
    #[error("path {0} does not exist")]
    PathNotFound(String),

    /// A node operation that requires a staged volume ran before staging.
    #[error("volume {0} is not staged")]
    VolumeNotStaged(String),

    /// A node operation would tear down a mount that is still in use.
    #[error("volume {volume_id} is still published at {target}")]
    VolumeInUse {
        /// Volume being unstaged.
        volume_id: String,
        /// A target path that still holds a bind mount.
        target: String,
    },

    /// A host command exited unsuccessfully.
    #[error("`{command}` failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        /// Program and arguments, space separated.
        command: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// No loop device reported a binding after the bounded retry loop.
    #[error("no loop device bound to {0}")]
    LoopAttach(String),

    /// The out-of-process expansion helper did not complete successfully.
    #[error("expansion helper for volume {0} did not complete")]
    ExpansionFailed(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Local filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::Metadata`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn metadata<E: std::fmt::Display>(e: E) -> Self {
        Self::Metadata(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// `true` when the error means "the Kubernetes object is already gone".
    ///
    /// Delete and unstage paths treat this as idempotent success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MetadataNotFound { .. })
    }

    /// gRPC status code for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NoMatchingDisk(_) | Self::ExpansionFailed(_) => Code::ResourceExhausted,
            Self::MetadataNotFound { .. }
            | Self::ImageNotFound(_)
            | Self::NotMounted(_)
            | Self::PathNotFound(_) => Code::NotFound,
            Self::AlreadyAtSize { .. }
            | Self::VolumeNotStaged(_)
            | Self::VolumeInUse { .. }
            | Self::UnsupportedFilesystem { .. } => Code::FailedPrecondition,
            Self::Metadata(_)
            | Self::CommandFailed { .. }
            | Self::LoopAttach(_)
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Io(_)
            | Self::Internal(_) => Code::Internal,
        }
    }
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}
