//! Core CSI types: volumes, storage parameters, capabilities, requests, and
//! topology.
//!
//! These types form the data model shared by the CSI traits, the gRPC
//! transport adapter and the backend.  They deliberately carry only what the
//! driver acts on; the transport layer translates to and from the wire
//! protobufs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::CsiError;

/// StorageClass parameter naming the disk model to provision on.
pub const PARAM_STORAGE_MODEL: &str = "storagemodel";
/// StorageClass parameter restricting logical disks to HDD or SSD.
pub const PARAM_DISK_TYPE: &str = "disk_type";
/// StorageClass parameter asking for a whole untouched disk.
pub const PARAM_FULL_DISK: &str = "full_disk";

/// Storage models starting with this marker name RAID-backed logical disks,
/// which are additionally filtered by rotational flag.
pub const LOGICAL_MODEL_PREFIX: &str = "LOGICAL";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume (the PersistentVolume name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Storage class parameters
// ---------------------------------------------------------------------------

/// Rotational class of a disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiskType {
    /// Spinning disk, `ROTA=1`.
    Hdd,
    /// Solid state disk, `ROTA=0`.
    Ssd,
}

impl DiskType {
    /// Parse the `disk_type` parameter.  Empty or unknown values mean
    /// "unspecified".
    pub fn from_param(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HDD" => Some(Self::Hdd),
            "SSD" => Some(Self::Ssd),
            _ => None,
        }
    }

    pub fn as_param(&self) -> &'static str {
        match self {
            Self::Hdd => "HDD",
            Self::Ssd => "SSD",
        }
    }
}

/// Typed form of the StorageClass parameters the driver consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageParams {
    /// Disk model string devices are matched against (required).
    pub storage_model: String,
    /// Rotational filter, only honoured for logical models.
    #[serde(default)]
    pub disk_type: Option<DiskType>,
    /// Consume an entire untouched disk instead of a slice of free space.
    #[serde(default)]
    pub full_disk: bool,
}

impl StorageParams {
    pub fn new(storage_model: impl Into<String>) -> Self {
        Self {
            storage_model: storage_model.into(),
            disk_type: None,
            full_disk: false,
        }
    }

    /// Build from a StorageClass / CreateVolume parameter map.
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Result<Self, CsiError> {
        let storage_model = parameters
            .get(PARAM_STORAGE_MODEL)
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CsiError::InvalidArgument(format!("parameter {PARAM_STORAGE_MODEL} is required"))
            })?;
        let disk_type = parameters
            .get(PARAM_DISK_TYPE)
            .and_then(|v| DiskType::from_param(v));
        let full_disk = parameters
            .get(PARAM_FULL_DISK)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        Ok(Self {
            storage_model,
            disk_type,
            full_disk,
        })
    }

    /// `true` for RAID-backed logical volume models.
    pub fn is_logical(&self) -> bool {
        self.storage_model.starts_with(LOGICAL_MODEL_PREFIX)
    }

    /// Rotational flag a logical disk must report: HDD ⇒ `true`, anything
    /// else ⇒ `false`.
    pub fn wants_rotational(&self) -> bool {
        self.disk_type == Some(DiskType::Hdd)
    }

    /// Name of the scratch directory a volume's disk is mounted on, also the
    /// key controller operations serialise on.
    pub fn scratch_name(&self, volume_id: &VolumeId) -> String {
        format!("{}-{}", self.storage_model, volume_id)
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    Unknown,
    /// Single-node read-write, the only mode this driver provisions.
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// `true` when a raw block device was requested instead of a mount.
    /// Volumes are always ext4 images, so a mount capability's filesystem
    /// type and flags are not carried.
    #[serde(default)]
    pub block: bool,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            block: false,
        }
    }
}

impl VolumeCapability {
    pub fn with_mode(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// A provisioned volume as reported back to the CO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints (node affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"hostname": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl Topology {
    pub fn single(key: &str, value: &str) -> Self {
        Self {
            segments: HashMap::from([(key.to_owned(), value.to_owned())]),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume lifecycle state
// ---------------------------------------------------------------------------

/// Lifecycle state of a volume on this node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    /// No staging mount exists.
    Unattached,
    /// The loop device is mounted at the staging path.
    Staged,
    /// The staging path is bind-mounted into at least one target path.
    Published,
}

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Name of the volume, becomes its `volume_id`.
    pub name: String,
    /// Requested capacity in bytes (before the size floor is applied).
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// StorageClass parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Preferred topologies from the accessibility requirements.
    #[serde(default)]
    pub preferred_topology: Vec<Topology>,
    /// Requisite topologies from the accessibility requirements.
    #[serde(default)]
    pub requisite_topology: Vec<Topology>,
}

/// Result of a controller-side expansion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerExpansion {
    /// Capacity after expansion.
    pub capacity_bytes: u64,
    /// Whether `NodeExpandVolume` must still run to grow the live filesystem.
    pub node_expansion_required: bool,
}

/// Request to stage (globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Node-global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: VolumeCapability,
}

/// Request to publish (bind-mount) a staged volume into a Pod container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Target path inside the pod's volume directory.
    pub target_path: String,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Request to grow the live filesystem of a published volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    /// Any path the volume is mounted on (staging or target).
    pub volume_path: String,
    /// Requested capacity in bytes.
    pub capacity_bytes: u64,
}

/// One usage figure of a filesystem.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available: u64,
    pub total: u64,
    pub used: u64,
}

/// Byte and inode usage of a mounted volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub bytes: VolumeUsage,
    pub inodes: VolumeUsage,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"lsdisk.driver"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
    /// Volumes may be expanded while published.
    OnlineVolumeExpansion,
}

/// RPCs the Controller service implements beyond the mandatory ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    ExpandVolume,
    GetCapacity,
}

/// RPCs the Node service implements beyond the mandatory ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
    GetVolumeStats,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host, 0 for unlimited.
    pub max_volumes: u64,
    /// Topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
