//! Driver configuration.
//!
//! [`DriverConfig`] collects every tunable of the plugin with documented
//! defaults; the `lsdisk` binary overrides them from CLI flags and
//! environment variables.  [`ExpansionEnv`] is the environment contract
//! between `ControllerExpandVolume` and the helper process it schedules on
//! the volume's node.
//!
//! Environment variables read by [`DriverConfig::from_env`]:
//! - `NODE_NAME`: node id and topology value. Defaults to `localhost`.
//! - `LSDISK_SCRATCH_ROOT`: root of scratch mounts. Defaults to `/mnt/lsdisk`.
//! - `LSDISK_IMAGE_NAME`: image file name. Defaults to `disk.img`.
//! - `LSDISK_HELPER_IMAGE`: container image of the expansion helper pod.
//! - `POD_NAMESPACE`: namespace helper pods run in. Defaults to `default`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::{DiskType, StorageParams, VolumeId};

/// 16 MiB, the smallest volume CreateVolume hands out.
pub const MIN_VOLUME_BYTES: u64 = 16 * 1024 * 1024;

pub const DEFAULT_DRIVER_NAME: &str = "lsdisk.driver";
pub const DEFAULT_TOPOLOGY_KEY: &str = "hostname";
pub const DEFAULT_SCRATCH_ROOT: &str = "/mnt/lsdisk";
pub const DEFAULT_IMAGE_NAME: &str = "disk.img";
pub const DEFAULT_HELPER_IMAGE: &str = "lsdisk:latest";

/// Global driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Plugin name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// Name of the node this process runs on.
    pub node_name: String,
    /// Topology segment key carrying the node name.
    pub topology_key: String,
    /// Directory under which physical disks are temporarily mounted.
    pub scratch_root: PathBuf,
    /// File name of the image inside a volume's directory.
    pub image_name: String,
    /// Size floor applied to every CreateVolume request.
    pub min_volume_bytes: u64,
    /// Reported by `NodeGetInfo`; 0 means unlimited.
    pub max_volumes_per_node: u64,
    /// Container image of the expansion helper pod.
    pub helper_image: String,
    /// Namespace the expansion helper pod is created in.
    pub helper_namespace: String,
    /// How often the helper pod's phase is polled.
    #[serde(with = "millis")]
    pub helper_poll_interval: Duration,
    /// Give up waiting for the helper pod after this long.
    #[serde(with = "millis")]
    pub helper_timeout: Duration,
    /// Upper bound on loop-device association queries during attach.
    pub loop_attach_attempts: u32,
    /// Delay between loop-device association queries.
    #[serde(with = "millis")]
    pub loop_attach_backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_name: "localhost".to_owned(),
            topology_key: DEFAULT_TOPOLOGY_KEY.to_owned(),
            scratch_root: PathBuf::from(DEFAULT_SCRATCH_ROOT),
            image_name: DEFAULT_IMAGE_NAME.to_owned(),
            min_volume_bytes: MIN_VOLUME_BYTES,
            max_volumes_per_node: 0,
            helper_image: DEFAULT_HELPER_IMAGE.to_owned(),
            helper_namespace: "default".to_owned(),
            helper_poll_interval: Duration::from_secs(2),
            helper_timeout: Duration::from_secs(600),
            loop_attach_attempts: 10,
            loop_attach_backoff: Duration::from_millis(200),
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by the environment variables listed in the module
    /// documentation.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("NODE_NAME") {
            config.node_name = v;
        }
        if let Ok(v) = std::env::var("LSDISK_SCRATCH_ROOT") {
            config.scratch_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LSDISK_IMAGE_NAME") {
            config.image_name = v;
        }
        if let Ok(v) = std::env::var("LSDISK_HELPER_IMAGE") {
            config.helper_image = v;
        }
        if let Ok(v) = std::env::var("POD_NAMESPACE") {
            config.helper_namespace = v;
        }
        config
    }

    /// `{scratch_root}/{storage_model}-{volume_id}`: where a volume's disk
    /// is mounted while an RPC works on it.
    pub fn scratch_path(&self, params: &StorageParams, volume_id: &VolumeId) -> PathBuf {
        self.scratch_root.join(params.scratch_name(volume_id))
    }

    /// Deterministic image path:
    /// `{scratch_root}/{storage_model}-{volume_id}/{volume_id}/{image_name}`.
    pub fn image_path(&self, params: &StorageParams, volume_id: &VolumeId) -> PathBuf {
        self.scratch_path(params, volume_id)
            .join(volume_id.as_str())
            .join(&self.image_name)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Expansion helper environment
// ---------------------------------------------------------------------------

pub const ENV_STORAGE_MODEL: &str = "STORAGE_MODEL";
pub const ENV_DISK_TYPE: &str = "DISK_TYPE";
pub const ENV_FULL_DISK: &str = "FULL_DISK";
pub const ENV_VOLUME_ID: &str = "VOLUME_ID";
pub const ENV_CAPACITY_RANGE: &str = "CAPACITY_RANGE";
pub const ENV_MOUNT_DEST: &str = "MOUNT_DEST";
pub const ENV_IMAGE_NAME: &str = "IMAGE_NAME";

/// Everything the out-of-process expansion helper needs to find and grow a
/// volume's image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionEnv {
    pub params: StorageParams,
    pub volume_id: VolumeId,
    /// Requested size of the image file in bytes.
    pub capacity_bytes: u64,
    /// Scratch root on the helper's node.
    pub mount_dest: PathBuf,
    pub image_name: String,
}

impl ExpansionEnv {
    /// Render as `(name, value)` environment pairs.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_STORAGE_MODEL, self.params.storage_model.clone()),
            (
                ENV_DISK_TYPE,
                self.params
                    .disk_type
                    .map(|t| t.as_param().to_owned())
                    .unwrap_or_default(),
            ),
            (ENV_FULL_DISK, self.params.full_disk.to_string()),
            (ENV_VOLUME_ID, self.volume_id.to_string()),
            (ENV_CAPACITY_RANGE, self.capacity_bytes.to_string()),
            (ENV_MOUNT_DEST, self.mount_dest.to_string_lossy().into_owned()),
            (ENV_IMAGE_NAME, self.image_name.clone()),
        ]
    }

    /// Parse from the process environment.
    pub fn from_env() -> Result<Self, CsiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from any key lookup.  `STORAGE_MODEL`, `VOLUME_ID` and
    /// `CAPACITY_RANGE` are required; the rest fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CsiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CsiError::InvalidArgument(format!("{key} is not set")))
        };

        let storage_model = required(ENV_STORAGE_MODEL)?;
        let volume_id = VolumeId(required(ENV_VOLUME_ID)?);
        let capacity_bytes = required(ENV_CAPACITY_RANGE)?
            .parse::<u64>()
            .map_err(|e| CsiError::InvalidArgument(format!("{ENV_CAPACITY_RANGE}: {e}")))?;

        Ok(Self {
            params: StorageParams {
                storage_model,
                disk_type: lookup(ENV_DISK_TYPE).and_then(|v| DiskType::from_param(&v)),
                full_disk: lookup(ENV_FULL_DISK).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            },
            volume_id,
            capacity_bytes,
            mount_dest: lookup(ENV_MOUNT_DEST)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRATCH_ROOT)),
            image_name: lookup(ENV_IMAGE_NAME).unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_owned()),
        })
    }
}
