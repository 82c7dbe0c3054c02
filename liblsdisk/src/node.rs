//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local mount
//! work required to make a volume available to Pod containers:
//!
//! 1. **Stage**: attach the image file to a loop device and mount it at the
//!    staging path.
//! 2. **Publish**: bind-mount the staging path into the Pod's container.
//! 3. **Unpublish**: remove the bind-mount.
//! 4. **Unstage**: unmount the staging path and detach the loop device.
//!
//! Transitions are checked against the volume's state on this node: publish
//! needs a staged volume and unstage needs an unpublished one.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: loop-attach its image and mount it at the staging path.
    ///
    /// This is idempotent: calling it again for an already-staged volume
    /// succeeds without mounting anything twice.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the staging path and release the loop device.
    ///
    /// This is idempotent.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path into the container.
    ///
    /// This is idempotent: calling it again for the same `target_path`
    /// succeeds without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the container path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Grow the live filesystem of a mounted volume.  Returns the capacity
    /// now available.
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError>;

    /// Byte and inode usage of the filesystem mounted at `volume_path`.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Optional node RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
