//! Volume store: the host-side half of every volume operation.
//!
//! A volume's image lives on one of the disks matching its storage model, at
//! `{scratch_root}/{storage_model}-{volume_id}/{volume_id}/{image_name}` while
//! that disk is mounted at the volume's scratch path.  Every public method
//! here holds the volume's scratch lock, mounts candidate disks at the
//! scratch path one at a time and unmounts each before moving on, so the
//! scratch path is never left mounted when a call returns.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::exec::HostSystem;
use crate::host::{BlockDevice, DiskSelector, ImageManager, LoopManager, MountManager};
use crate::lock::KeyedLocks;
use crate::types::{StorageParams, VolumeId};

/// What [`VolumeStore::provision`] left on disk.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub device: BlockDevice,
    /// Size of the image file in bytes.
    pub capacity_bytes: u64,
    /// `false` when an earlier call had already created the image.
    pub created: bool,
}

pub struct VolumeStore {
    config: DriverConfig,
    host: Arc<dyn HostSystem>,
    disks: DiskSelector,
    images: ImageManager,
    loops: LoopManager,
    mounts: MountManager,
    locks: KeyedLocks,
}

impl VolumeStore {
    pub fn new(config: DriverConfig, host: Arc<dyn HostSystem>, locks: KeyedLocks) -> Self {
        Self {
            disks: DiskSelector::new(host.clone(), config.scratch_root.clone(), locks.clone()),
            images: ImageManager::new(host.clone()),
            loops: LoopManager::new(
                host.clone(),
                config.loop_attach_attempts,
                config.loop_attach_backoff,
            ),
            mounts: MountManager::new(host.clone(), locks.clone()),
            config,
            host,
            locks,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn mounts(&self) -> &MountManager {
        &self.mounts
    }

    pub fn loops(&self) -> &LoopManager {
        &self.loops
    }

    // -----------------------------------------------------------------------
    // Scratch mount plumbing
    // -----------------------------------------------------------------------

    /// Tear down a scratch mount an interrupted earlier call left behind.
    async fn clear_scratch(&self, scratch: &Path) -> Result<(), CsiError> {
        if self.mounts.unmount(scratch).await? {
            warn!(path = %scratch.display(), "removed stale scratch mount");
        }
        Ok(())
    }

    /// Mount `device` at `scratch`.  Failure is logged and reported as
    /// `false` so callers can move on to the next candidate.
    async fn open_scratch(&self, device: &BlockDevice, scratch: &Path) -> bool {
        match self.mounts.mount(&device.path(), scratch).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device = %device.name, error = %e, "skipping disk that could not be mounted");
                false
            }
        }
    }

    /// Unmount `scratch` after an operation ran on it.  The operation's own
    /// error wins over an unmount error.
    async fn close_scratch<T>(&self, scratch: &Path, outcome: Result<T, CsiError>) -> Result<T, CsiError> {
        let unmounted = self.mounts.unmount(scratch).await;
        match (outcome, unmounted) {
            (Ok(value), Ok(_)) => {
                if let Err(e) = tokio::fs::remove_dir(scratch).await {
                    debug!(path = %scratch.display(), error = %e, "scratch directory left in place");
                }
                Ok(value)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(unmount)) => {
                warn!(path = %scratch.display(), error = %unmount, "scratch unmount failed after error");
                Err(e)
            }
        }
    }

    /// Size of the image at `image`, `None` when there is none.
    async fn image_size(&self, image: &Path) -> Result<Option<u64>, CsiError> {
        match tokio::fs::metadata(image).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Place the volume's image on a disk chosen by the selection policy.
    ///
    /// An image already present on any candidate disk is reported as is, so
    /// a retried create never leaves a second copy on another disk.  For
    /// full-disk volumes the image takes all free space on the disk.
    #[instrument(skip(self), fields(model = %params.storage_model))]
    pub async fn provision(
        &self,
        params: &StorageParams,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<Provisioned, CsiError> {
        let _guard = self.locks.lock(&params.scratch_name(volume_id)).await;
        let scratch = self.config.scratch_path(params, volume_id);
        let image = self.config.image_path(params, volume_id);
        self.clear_scratch(&scratch).await?;

        for device in self.disks.candidates(params).await? {
            if !self.open_scratch(&device, &scratch).await {
                continue;
            }
            let found = self.image_size(&image).await;
            if let Some(size) = self.close_scratch(&scratch, found).await? {
                info!(device = %device.name, size, "image already provisioned");
                return Ok(Provisioned {
                    device,
                    capacity_bytes: size,
                    created: false,
                });
            }
        }

        let device = self.disks.select(params).await?;
        self.mounts.mount(&device.path(), &scratch).await?;
        let outcome = async {
            let size = if params.full_disk {
                self.host.fs_usage(&scratch).await?.free_bytes
            } else {
                capacity_bytes
            };
            let created = self.images.create(&image, size).await?;
            Ok::<_, CsiError>((size, created))
        }
        .await;
        let (capacity_bytes, created) = self.close_scratch(&scratch, outcome).await?;

        info!(device = %device.name, capacity_bytes, "image provisioned");
        Ok(Provisioned {
            device,
            capacity_bytes,
            created,
        })
    }

    /// Remove the volume's directory from the first candidate disk holding
    /// it.  Returns whether anything was removed.
    #[instrument(skip(self), fields(model = %params.storage_model))]
    pub async fn remove(&self, params: &StorageParams, volume_id: &VolumeId) -> Result<bool, CsiError> {
        let _guard = self.locks.lock(&params.scratch_name(volume_id)).await;
        let scratch = self.config.scratch_path(params, volume_id);
        let volume_dir = scratch.join(volume_id.as_str());
        self.clear_scratch(&scratch).await?;

        for device in self.disks.candidates(params).await? {
            if !self.open_scratch(&device, &scratch).await {
                continue;
            }
            let outcome = async {
                if !tokio::fs::try_exists(&volume_dir).await? {
                    return Ok(false);
                }
                tokio::fs::remove_dir_all(&volume_dir).await?;
                Ok::<_, CsiError>(true)
            }
            .await;
            if self.close_scratch(&scratch, outcome).await? {
                info!(device = %device.name, "volume directory removed");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Grow the volume's image to `capacity_bytes` on whichever candidate
    /// disk holds it and return that disk.
    ///
    /// An image already exactly `capacity_bytes` long counts as grown.
    #[instrument(skip(self), fields(model = %params.storage_model))]
    pub async fn expand_image(
        &self,
        params: &StorageParams,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<BlockDevice, CsiError> {
        let _guard = self.locks.lock(&params.scratch_name(volume_id)).await;
        let scratch = self.config.scratch_path(params, volume_id);
        let image = self.config.image_path(params, volume_id);
        self.clear_scratch(&scratch).await?;

        for device in self.disks.candidates(params).await? {
            if !self.open_scratch(&device, &scratch).await {
                continue;
            }
            let outcome = match self.images.expand(&image, capacity_bytes).await {
                Ok(_) => Ok(true),
                Err(CsiError::AlreadyAtSize { current, requested, .. }) if current == requested => {
                    info!(device = %device.name, "image already at requested size");
                    Ok(true)
                }
                Err(CsiError::ImageNotFound(_)) => Ok(false),
                Err(e) => Err(e),
            };
            if self.close_scratch(&scratch, outcome).await? {
                return Ok(device);
            }
            debug!(device = %device.name, "image not on this disk");
        }
        Err(CsiError::ImageNotFound(image.display().to_string()))
    }

    /// Bind the volume's image to a loop device.  `None` when no candidate
    /// disk holds the image.
    #[instrument(skip(self), fields(model = %params.storage_model))]
    pub async fn attach(&self, params: &StorageParams, volume_id: &VolumeId) -> Result<Option<String>, CsiError> {
        let _guard = self.locks.lock(&params.scratch_name(volume_id)).await;
        let scratch = self.config.scratch_path(params, volume_id);
        let image = self.config.image_path(params, volume_id);
        self.clear_scratch(&scratch).await?;

        for device in self.disks.candidates(params).await? {
            if !self.open_scratch(&device, &scratch).await {
                continue;
            }
            let outcome = if self.host.exists(&image).await {
                self.loops.attach(&image).await.map(Some)
            } else {
                Ok(None)
            };
            if let Some(loop_device) = self.close_scratch(&scratch, outcome).await? {
                info!(device = %device.name, loop_device, "image attached");
                return Ok(Some(loop_device));
            }
        }
        Ok(None)
    }

    /// Release every loop binding of the volume's image.  Returns how many
    /// were detached.
    #[instrument(skip(self), fields(model = %params.storage_model))]
    pub async fn detach(&self, params: &StorageParams, volume_id: &VolumeId) -> Result<usize, CsiError> {
        let _guard = self.locks.lock(&params.scratch_name(volume_id)).await;
        let scratch = self.config.scratch_path(params, volume_id);
        let image = self.config.image_path(params, volume_id);
        self.clear_scratch(&scratch).await?;

        for device in self.disks.candidates(params).await? {
            if !self.open_scratch(&device, &scratch).await {
                continue;
            }
            let outcome = if self.host.exists(&image).await {
                self.loops.detach(&image).await.map(Some)
            } else {
                Ok(None)
            };
            if let Some(detached) = self.close_scratch(&scratch, outcome).await? {
                return Ok(detached);
            }
        }
        Ok(0)
    }

    /// Free bytes on the disk a new volume with `params` would go on, 0 when
    /// no disk qualifies.
    pub async fn capacity(&self, params: &StorageParams) -> Result<u64, CsiError> {
        let device = match self.disks.select(params).await {
            Ok(device) => device,
            Err(CsiError::NoMatchingDisk(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        Ok(self.disks.measure(&device).await?.free_bytes)
    }
}
