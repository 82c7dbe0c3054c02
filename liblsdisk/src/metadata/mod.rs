//! Cluster-side collaborators.
//!
//! The driver never owns Kubernetes objects; it reads PersistentVolume and
//! StorageClass metadata and schedules the privileged expansion helper.  Both
//! concerns sit behind traits so the backend is testable without a cluster.
//! [`kube::KubeClient`] implements both against the in-cluster API server.

pub mod kube;

use async_trait::async_trait;

use crate::config::ExpansionEnv;
use crate::error::CsiError;
use crate::types::{StorageParams, VolumeId};

/// Read-only access to volume placement metadata.
///
/// Implementations return [`CsiError::MetadataNotFound`] when the object
/// is absent so delete-style callers can treat it as already done.
#[async_trait]
pub trait VolumeMetadata: Send + Sync {
    /// StorageClass name of the PersistentVolume named `volume_id`.
    async fn storage_class_of(&self, volume_id: &VolumeId) -> Result<String, CsiError>;

    /// Typed parameters of the StorageClass named `storage_class`.
    async fn storage_params(&self, storage_class: &str) -> Result<StorageParams, CsiError>;

    /// Node the volume is pinned to.
    async fn node_of(&self, volume_id: &VolumeId) -> Result<String, CsiError>;

    /// Storage parameters of the class `volume_id` was provisioned from.
    async fn volume_params(&self, volume_id: &VolumeId) -> Result<StorageParams, CsiError> {
        let class = self.storage_class_of(volume_id).await?;
        self.storage_params(&class).await
    }
}

/// Runs the out-of-process image expansion on a given node.
#[async_trait]
pub trait ExpansionHelper: Send + Sync {
    /// Start the helper on `node` with `env`, wait for it to terminate and
    /// clean it up.  `Ok(false)` means the helper ran but did not succeed.
    async fn expand(&self, node: &str, env: &ExpansionEnv) -> Result<bool, CsiError>;
}
