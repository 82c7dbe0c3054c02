//! Disk Selector: discovers block devices matching a storage model and picks
//! one by free space.
//!
//! Free space is only observable through a mounted filesystem, so every
//! measured candidate is mounted at `{scratch_root}/{device}`, queried with
//! statvfs and unmounted again.  A candidate that cannot be measured is
//! logged and skipped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::error::CsiError;
use crate::exec::{FsUsage, HostSystem};
use crate::host::mount::MountManager;
use crate::lock::KeyedLocks;
use crate::types::StorageParams;

/// A whole block device as reported by `lsblk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// Kernel name, e.g. `sdb`.
    pub name: String,
    pub model: String,
    pub rotational: bool,
}

impl BlockDevice {
    /// Device node path, e.g. `/dev/sdb`.
    pub fn path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

/// Parse one line of `lsblk -P` output (`KEY="value" KEY="value" ...`).
fn parse_pairs(line: &str) -> HashMap<&str, &str> {
    let mut pairs = HashMap::new();
    let mut rest = line.trim();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim();
        let value_start = eq + 2;
        let Some(len) = rest[value_start..].find('"') else {
            break;
        };
        pairs.insert(key, &rest[value_start..value_start + len]);
        rest = &rest[value_start + len + 1..];
    }
    pairs
}

fn parse_lsblk(output: &str) -> Vec<BlockDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let pairs = parse_pairs(line);
            let name = pairs.get("NAME").filter(|n| !n.is_empty())?;
            Some(BlockDevice {
                name: (*name).to_owned(),
                model: pairs.get("MODEL").map(|m| m.trim()).unwrap_or_default().to_owned(),
                rotational: pairs.get("ROTA").is_some_and(|r| r.trim() == "1"),
            })
        })
        .collect()
}

pub struct DiskSelector {
    host: Arc<dyn HostSystem>,
    mounts: MountManager,
    scratch_root: PathBuf,
    locks: KeyedLocks,
}

impl DiskSelector {
    pub fn new(host: Arc<dyn HostSystem>, scratch_root: PathBuf, locks: KeyedLocks) -> Self {
        Self {
            mounts: MountManager::new(host.clone(), locks.clone()),
            host,
            scratch_root,
            locks,
        }
    }

    /// All whole disks on this host, in discovery order.
    pub async fn list(&self) -> Result<Vec<BlockDevice>, CsiError> {
        let out = self
            .host
            .run("lsblk", &["-d", "-n", "-P", "-o", "NAME,MODEL,ROTA"])
            .await?;
        Ok(parse_lsblk(&out.stdout))
    }

    /// Disks whose model equals the requested storage model.  Logical
    /// (RAID-backed) models additionally have to match the rotational flag
    /// implied by the disk type.
    pub async fn candidates(&self, params: &StorageParams) -> Result<Vec<BlockDevice>, CsiError> {
        let wants_rotational = params.wants_rotational();
        let logical = params.is_logical();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|dev| dev.model == params.storage_model)
            .filter(|dev| !logical || dev.rotational == wants_rotational)
            .collect())
    }

    /// Mount `device` at its probe path, read its usage and unmount it.
    pub async fn measure(&self, device: &BlockDevice) -> Result<FsUsage, CsiError> {
        let _guard = self.locks.lock(&format!("probe:{}", device.name)).await;
        let probe = self.scratch_root.join(&device.name);

        self.mounts.mount(&device.path(), &probe).await?;
        let usage = self.host.fs_usage(&probe).await;
        let unmounted = self.mounts.unmount(&probe).await;

        let usage = usage?;
        unmounted?;
        debug!(
            device = %device.name,
            free = usage.free_bytes,
            total = usage.total_bytes,
            "measured disk"
        );
        Ok(usage)
    }

    /// Pick the disk a new volume of `params` goes on.
    ///
    /// With `full_disk` only untouched disks qualify and the largest one
    /// wins.  Otherwise the disk with the most free space wins, the earlier
    /// one on ties, and a lone candidate is taken without being measured.
    #[instrument(skip(self), fields(model = %params.storage_model, full_disk = params.full_disk))]
    pub async fn select(&self, params: &StorageParams) -> Result<BlockDevice, CsiError> {
        let mut candidates = self.candidates(params).await?;
        if candidates.is_empty() {
            return Err(CsiError::NoMatchingDisk(params.storage_model.clone()));
        }
        if !params.full_disk && candidates.len() == 1 {
            return Ok(candidates.remove(0));
        }

        let mut best: Option<(BlockDevice, u64)> = None;
        for device in candidates {
            let usage = match self.measure(&device).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(device = %device.name, error = %e, "skipping disk that could not be probed");
                    continue;
                }
            };
            if params.full_disk && !usage.is_untouched() {
                debug!(device = %device.name, "disk already in use, not eligible for a full-disk volume");
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|(_, free)| usage.free_bytes > *free)
            {
                best = Some((device, usage.free_bytes));
            }
        }

        best.map(|(device, _)| device)
            .ok_or_else(|| CsiError::NoMatchingDisk(params.storage_model.clone()))
    }
}
