//! Loop Device Manager.
//!
//! An image file has at most one loop device bound to it.  `attach` reuses an
//! existing binding; only when none exists does it bind the next free loop
//! device, creating the device node first on hosts that lack it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::CsiError;
use crate::exec::HostSystem;

/// Block major number of loop devices.
const LOOP_MAJOR: &str = "7";

pub struct LoopManager {
    host: Arc<dyn HostSystem>,
    attempts: u32,
    backoff: Duration,
}

/// Device paths from `losetup -j` output (`/dev/loop0: [2049]:131 (/path)`).
fn parse_associations(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(dev, _)| dev.trim().to_owned())
        .filter(|dev| !dev.is_empty())
        .collect()
}

impl LoopManager {
    pub fn new(host: Arc<dyn HostSystem>, attempts: u32, backoff: Duration) -> Self {
        Self {
            host,
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Loop devices currently bound to `image`.
    pub async fn devices_for(&self, image: &Path) -> Result<Vec<String>, CsiError> {
        let image = image.to_string_lossy();
        let out = self.host.run("losetup", &["-j", &image]).await?;
        Ok(parse_associations(&out.stdout))
    }

    /// Next unused loop device, with its node created if the host has none.
    async fn next_free(&self) -> Result<String, CsiError> {
        let out = self.host.run("losetup", &["-f"]).await?;
        let device = out.stdout.trim().to_owned();
        let minor = device
            .strip_prefix("/dev/loop")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| CsiError::Internal(format!("unexpected losetup -f output {device:?}")))?;

        if !self.host.exists(Path::new(&device)).await {
            debug!(device, "creating missing loop device node");
            self.host
                .run("mknod", &[&device, "b", LOOP_MAJOR, &minor.to_string()])
                .await?;
        }
        Ok(device)
    }

    /// Bind `image` to a loop device and return the device path.
    #[instrument(skip(self), fields(image = %image.display()))]
    pub async fn attach(&self, image: &Path) -> Result<String, CsiError> {
        if let Some(device) = self.devices_for(image).await?.into_iter().next() {
            debug!(device, "reusing existing loop binding");
            return Ok(device);
        }

        let next = self.next_free().await?;
        let image_str = image.to_string_lossy();
        self.host
            .run("losetup", &["--direct-io=on", "-f", &image_str])
            .await?;

        // The association can lag behind the bind on some hosts.
        for attempt in 1..=self.attempts {
            if let Some(device) = self.devices_for(image).await?.into_iter().next() {
                info!(device, "loop device attached");
                return Ok(device);
            }
            warn!(attempt, expected = %next, "loop binding not visible yet");
            tokio::time::sleep(self.backoff).await;
        }
        Err(CsiError::LoopAttach(image_str.into_owned()))
    }

    /// Unbind every loop device bound to `image`.  Returns how many were
    /// detached.
    #[instrument(skip(self), fields(image = %image.display()))]
    pub async fn detach(&self, image: &Path) -> Result<usize, CsiError> {
        let devices = self.devices_for(image).await?;
        for device in &devices {
            self.host.run("losetup", &["-d", device]).await?;
            info!(device, "loop device detached");
        }
        Ok(devices.len())
    }

    /// Make the kernel re-read the size of the file behind `device`.
    pub async fn rescan(&self, device: &str) -> Result<(), CsiError> {
        self.host.run("losetup", &["-c", device]).await?;
        Ok(())
    }
}
