//! Local-disk storage backend for CSI.
//!
//! [`LsdiskBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`].  Volumes are sparse ext4 image files on physical disks that
//! match a StorageClass's storage model; on the node an image is bound to a
//! loop device, mounted at the staging path and bind-mounted into pods.
//!
//! # On-disk layout
//!
//! ```text
//! <scratch_root>/
//!   <device>/                          # probe mount while measuring free space
//!   <storage_model>-<volume_id>/       # scratch mount of the volume's disk
//!     <volume_id>/<image_name>         # the volume's image file
//! ```
//!
//! # Locking
//!
//! Controller work holds the `<storage_model>-<volume_id>` key for its whole
//! duration.  Node work holds the `<volume_id>` key and, while it has a disk
//! mounted at the scratch path, the scratch key as well.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::backend::store::VolumeStore;
use crate::config::{DriverConfig, ExpansionEnv};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::exec::HostSystem;
use crate::identity::CsiIdentity;
use crate::lock::KeyedLocks;
use crate::metadata::{ExpansionHelper, VolumeMetadata};
use crate::node::CsiNode;
use crate::types::*;

/// Node-side view of one volume.
#[derive(Debug, Clone, Default)]
struct NodeVolume {
    staging_path: Option<PathBuf>,
    targets: BTreeSet<PathBuf>,
}

impl NodeVolume {
    fn state(&self) -> VolumeState {
        match (&self.staging_path, self.targets.is_empty()) {
            (None, _) => VolumeState::Unattached,
            (Some(_), true) => VolumeState::Staged,
            (Some(_), false) => VolumeState::Published,
        }
    }
}

/// Concrete CSI backend for local raw disks.
///
/// # Thread safety
///
/// Per-volume node state lives in a [`DashMap`]; every operation on a
/// volume runs under that volume's key in [`KeyedLocks`], so concurrent RPCs
/// for different volumes proceed in parallel while RPCs for the same volume
/// are serialised.
pub struct LsdiskBackend {
    store: VolumeStore,
    host: Arc<dyn HostSystem>,
    metadata: Arc<dyn VolumeMetadata>,
    expander: Arc<dyn ExpansionHelper>,
    locks: KeyedLocks,
    node_volumes: DashMap<VolumeId, NodeVolume>,
}

impl LsdiskBackend {
    pub fn new(
        config: DriverConfig,
        host: Arc<dyn HostSystem>,
        metadata: Arc<dyn VolumeMetadata>,
        expander: Arc<dyn ExpansionHelper>,
    ) -> Self {
        let locks = KeyedLocks::new();
        Self {
            store: VolumeStore::new(config, host.clone(), locks.clone()),
            host,
            metadata,
            expander,
            locks,
            node_volumes: DashMap::new(),
        }
    }

    fn config(&self) -> &DriverConfig {
        self.store.config()
    }

    pub fn store(&self) -> &VolumeStore {
        &self.store
    }

    /// Lifecycle state of `volume_id` on this node as last observed.
    pub fn volume_state(&self, volume_id: &VolumeId) -> VolumeState {
        self.node_volumes
            .get(volume_id)
            .map(|v| v.state())
            .unwrap_or(VolumeState::Unattached)
    }

    /// Node named by the request's topology, preferred before requisite,
    /// falling back to this node.
    fn requested_node(&self, req: &CreateVolumeRequest) -> String {
        let key = &self.config().topology_key;
        req.preferred_topology
            .iter()
            .chain(&req.requisite_topology)
            .find_map(|t| t.segments.get(key).cloned())
            .unwrap_or_else(|| self.config().node_name.clone())
    }

    /// Publish targets of `volume_id` that are still mounted.  Targets that
    /// disappeared behind our back are forgotten.
    async fn live_targets(&self, volume_id: &VolumeId) -> Result<Vec<PathBuf>, CsiError> {
        let known: Vec<PathBuf> = self
            .node_volumes
            .get(volume_id)
            .map(|v| v.targets.iter().cloned().collect())
            .unwrap_or_default();

        let mut live = Vec::with_capacity(known.len());
        for target in known {
            if self.store.mounts().is_mounted(&target).await? {
                live.push(target);
            }
        }
        if let Some(mut entry) = self.node_volumes.get_mut(volume_id) {
            entry.targets.retain(|t| live.contains(t));
        }
        Ok(live)
    }
}

/// Remove a directory left behind by an unmount; absence is fine.
async fn remove_mount_dir(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CsiError::UnmountFailed {
            path: path.display().to_string(),
            reason: format!("remove directory: {e}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for LsdiskBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config().driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Ready once the scratch root is usable.
        let ready = tokio::fs::create_dir_all(&self.config().scratch_root)
            .await
            .is_ok();
        Ok(ready)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
            PluginCapability::OnlineVolumeExpansion,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for LsdiskBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        match req.volume_capabilities.first() {
            Some(cap) if cap.block => {
                return Err(CsiError::InvalidArgument("raw block access is not supported".into()));
            }
            Some(cap) if cap.access_mode == AccessMode::SingleNodeWriter => {}
            Some(cap) => {
                return Err(CsiError::InvalidArgument(format!(
                    "access mode {:?} is not supported, only single-node writer",
                    cap.access_mode
                )));
            }
            None => {
                return Err(CsiError::InvalidArgument("volume capabilities are required".into()));
            }
        }

        let params = StorageParams::from_parameters(&req.parameters)?;
        let volume_id = VolumeId::from(req.name.as_str());
        let requested = req.capacity_bytes.max(self.config().min_volume_bytes);
        let node = self.requested_node(&req);

        let provisioned = self.store.provision(&params, &volume_id, requested).await?;

        info!(
            device = %provisioned.device.name,
            capacity_bytes = provisioned.capacity_bytes,
            created = provisioned.created,
            %node,
            "volume created",
        );
        Ok(Volume {
            volume_id,
            capacity_bytes: provisioned.capacity_bytes,
            volume_context: HashMap::from([
                (PARAM_STORAGE_MODEL.to_owned(), params.storage_model),
                ("device".to_owned(), provisioned.device.name),
            ]),
            accessible_topology: vec![Topology::single(&self.config().topology_key, &node)],
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let params = match self.metadata.volume_params(volume_id).await {
            Ok(params) => params,
            Err(e) if e.is_not_found() => {
                info!(error = %e, "volume metadata gone, assuming already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.store.remove(&params, volume_id).await? {
            info!("volume deleted");
        } else {
            debug!("no disk held the volume, nothing to delete");
        }
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        self.metadata.storage_class_of(volume_id).await?;
        Ok(!capabilities.is_empty()
            && capabilities
                .iter()
                .all(|c| c.access_mode == AccessMode::SingleNodeWriter))
    }

    #[instrument(skip(self), fields(model = %params.storage_model))]
    async fn get_capacity(&self, params: &StorageParams) -> Result<u64, CsiError> {
        self.store.capacity(params).await
    }

    #[instrument(skip(self))]
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<ControllerExpansion, CsiError> {
        let params = self.metadata.volume_params(volume_id).await?;
        let node = self.metadata.node_of(volume_id).await?;
        let _guard = self.locks.lock(&params.scratch_name(volume_id)).await;

        let env = ExpansionEnv {
            params,
            volume_id: volume_id.clone(),
            capacity_bytes,
            mount_dest: self.config().scratch_root.clone(),
            image_name: self.config().image_name.clone(),
        };
        if !self.expander.expand(&node, &env).await? {
            return Err(CsiError::ExpansionFailed(volume_id.to_string()));
        }

        info!(%node, capacity_bytes, "image expanded, node expansion pending");
        Ok(ControllerExpansion {
            capacity_bytes,
            node_expansion_required: true,
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::ExpandVolume,
            ControllerCapability::GetCapacity,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for LsdiskBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.volume_capability.block {
            return Err(CsiError::InvalidArgument("raw block access is not supported".into()));
        }
        let _guard = self.locks.lock(req.volume_id.as_str()).await;
        let staging = PathBuf::from(&req.staging_target_path);

        if self.store.mounts().is_mounted(&staging).await? {
            debug!(path = %staging.display(), "already staged");
        } else {
            let params = self.metadata.volume_params(&req.volume_id).await?;
            let Some(loop_device) = self.store.attach(&params, &req.volume_id).await? else {
                let image = self.config().image_path(&params, &req.volume_id);
                warn!(image = %image.display(), "no candidate disk holds the image");
                return Err(CsiError::ImageNotFound(image.display().to_string()));
            };
            self.store.mounts().mount(&loop_device, &staging).await?;
            info!(%loop_device, path = %staging.display(), "volume staged");
        }

        self.node_volumes
            .entry(req.volume_id)
            .or_default()
            .staging_path = Some(staging);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        let _guard = self.locks.lock(volume_id.as_str()).await;

        if let Some(target) = self.live_targets(volume_id).await?.into_iter().next() {
            return Err(CsiError::VolumeInUse {
                volume_id: volume_id.to_string(),
                target: target.display().to_string(),
            });
        }

        let staging = Path::new(staging_target_path);
        self.store.mounts().unmount(staging).await?;
        remove_mount_dir(staging).await?;

        match self.metadata.volume_params(volume_id).await {
            Ok(params) => {
                let detached = self.store.detach(&params, volume_id).await?;
                info!(detached, "volume unstaged");
            }
            Err(e) if e.is_not_found() => {
                info!(error = %e, "volume metadata gone, assuming already unstaged");
            }
            Err(e) => return Err(e),
        }

        self.node_volumes.remove(volume_id);
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let _guard = self.locks.lock(req.volume_id.as_str()).await;
        let staging = PathBuf::from(&req.staging_target_path);
        let target = PathBuf::from(&req.target_path);

        if !self.store.mounts().is_mounted(&staging).await? {
            return Err(CsiError::VolumeNotStaged(req.volume_id.to_string()));
        }
        self.store
            .mounts()
            .mount_bind(&staging, &target, req.read_only)
            .await?;

        let mut entry = self.node_volumes.entry(req.volume_id).or_default();
        entry.staging_path = Some(staging);
        entry.targets.insert(target);
        info!(target_path = %req.target_path, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        let _guard = self.locks.lock(volume_id.as_str()).await;
        let target = Path::new(target_path);

        if self.store.mounts().unmount(target).await? {
            info!(%target_path, "volume unpublished");
        } else {
            debug!(%target_path, "target not mounted, nothing to unpublish");
        }
        remove_mount_dir(target).await?;

        if let Some(mut entry) = self.node_volumes.get_mut(volume_id) {
            entry.targets.remove(target);
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError> {
        let _guard = self.locks.lock(req.volume_id.as_str()).await;
        let volume_path = PathBuf::from(&req.volume_path);

        let device = self
            .store
            .mounts()
            .mount_source(&volume_path)
            .await?
            .ok_or_else(|| CsiError::NotMounted(req.volume_path.clone()))?;

        if device.starts_with("/dev/loop") {
            self.store.loops().rescan(&device).await?;
        }
        self.store.mounts().extend_fs(&device, &volume_path).await?;

        info!(%device, capacity_bytes = req.capacity_bytes, "filesystem expanded");
        Ok(req.capacity_bytes)
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        let path = Path::new(volume_path);
        if !self.host.exists(path).await {
            return Err(CsiError::PathNotFound(volume_path.to_owned()));
        }
        let usage = self.host.fs_usage(path).await?;
        debug!(%volume_id, ?usage, "volume stats");
        Ok(VolumeStats {
            bytes: VolumeUsage {
                available: usage.free_bytes,
                total: usage.total_bytes,
                used: usage.total_bytes.saturating_sub(usage.free_bytes),
            },
            inodes: VolumeUsage {
                available: usage.free_inodes,
                total: usage.total_inodes,
                used: usage.total_inodes.saturating_sub(usage.free_inodes),
            },
        })
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        let config = self.config();
        Ok(NodeInfo {
            node_id: config.node_name.clone(),
            max_volumes: config.max_volumes_per_node,
            accessible_topology: Some(Topology::single(&config.topology_key, &config.node_name)),
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::ExpandVolume,
            NodeCapability::GetVolumeStats,
        ])
    }
}
