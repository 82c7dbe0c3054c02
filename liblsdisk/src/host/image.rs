//! Image File Manager: the sparse, ext4-formatted file backing a volume.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::CsiError;
use crate::exec::HostSystem;

/// Filesystem every image file is formatted with.
pub const IMAGE_FS_TYPE: &str = "ext4";

pub struct ImageManager {
    host: Arc<dyn HostSystem>,
}

/// Sibling path an image is allocated and formatted under before it is
/// renamed into place, so a present image is always a formatted one.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

impl ImageManager {
    pub fn new(host: Arc<dyn HostSystem>) -> Self {
        Self { host }
    }

    /// Allocate and format the image at `path` unless it already exists.
    ///
    /// Returns `true` when a new image was created.  An existing image is
    /// never overwritten or resized.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create(&self, path: &Path, size_bytes: u64) -> Result<bool, CsiError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(path).await? {
            info!("image already exists");
            return Ok(false);
        }

        let partial = partial_path(path);
        let file = tokio::fs::File::create(&partial).await?;
        file.set_len(size_bytes).await?;
        drop(file);

        let partial_str = partial.to_string_lossy();
        if let Err(e) = self
            .host
            .run(&format!("mkfs.{IMAGE_FS_TYPE}"), &["-F", "-q", &partial_str])
            .await
        {
            if let Err(rm) = tokio::fs::remove_file(&partial).await {
                warn!(error = %rm, "failed to remove unformatted image");
            }
            return Err(e);
        }
        tokio::fs::rename(&partial, path).await?;

        info!(size_bytes, "image created");
        Ok(true)
    }

    /// Grow the image file at `path` to `new_size_bytes`.
    ///
    /// Fails with [`CsiError::ImageNotFound`] when there is no image at
    /// `path`, and with [`CsiError::AlreadyAtSize`] when the image is already
    /// at least that large; the file is untouched in both cases.  The
    /// filesystem inside the image is not grown here.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn expand(&self, path: &Path, new_size_bytes: u64) -> Result<bool, CsiError> {
        let current = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CsiError::ImageNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if new_size_bytes <= current {
            return Err(CsiError::AlreadyAtSize {
                path: path.display().to_string(),
                current,
                requested: new_size_bytes,
            });
        }

        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(new_size_bytes).await?;
        info!(from = current, to = new_size_bytes, "image expanded");
        Ok(true)
    }
}
