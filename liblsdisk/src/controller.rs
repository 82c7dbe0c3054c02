//! CSI Controller service trait.
//!
//! The Controller service manages the cluster-level volume lifecycle:
//! creation, deletion, capability validation, capacity queries and
//! expansion.  Every operation that touches a disk mounts it at a scratch
//! path and unmounts it again before returning.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerExpansion, CreateVolumeRequest, StorageParams, Volume,
    VolumeCapability, VolumeId,
};

/// Controller service: cluster-level volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume on a disk matching the request's storage
    /// parameters.
    ///
    /// Re-running with the same name converges on the same image file.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  A volume whose metadata is
    /// already gone counts as deleted.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// Free bytes on the disk a volume with `params` would be placed on.
    async fn get_capacity(&self, params: &StorageParams) -> Result<u64, CsiError>;

    /// Grow the volume's image file to `capacity_bytes` on its node.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<ControllerExpansion, CsiError>;

    /// Optional controller RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
