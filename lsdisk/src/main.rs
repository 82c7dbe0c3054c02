//! # lsdisk
//!
//! Command-line entry point of the local-disk CSI plugin.
//!
//! - `lsdisk serve` runs the Identity, Controller and Node services on the
//!   CSI endpoint socket.
//! - `lsdisk extend-image` is the expansion helper the controller schedules
//!   as a pod on a volume's node; it reads its work from the environment.
//! - `lsdisk find-disk` prints which disks on this node match a storage
//!   model.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use liblsdisk::backend::store::VolumeStore;
use liblsdisk::host::DiskSelector;
use liblsdisk::lock::KeyedLocks;
use liblsdisk::metadata::kube::KubeClient;
use liblsdisk::transport::server;
use liblsdisk::{DiskType, DriverConfig, ExpansionEnv, LinuxHost, LsdiskBackend, StorageParams};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Local raw-disk CSI plugin
#[derive(Debug, Parser)]
#[command(name = "lsdisk")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Name of the node this process runs on
    #[arg(long, global = true, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Directory under which disks are temporarily mounted
    #[arg(long, global = true, env = "LSDISK_SCRATCH_ROOT", value_name = "DIR")]
    scratch_root: Option<PathBuf>,

    /// File name of a volume's image
    #[arg(long, global = true, env = "LSDISK_IMAGE_NAME")]
    image_name: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the CSI plugin
    Serve {
        /// CSI endpoint, `unix:///path/to/csi.sock`
        #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
        endpoint: String,

        /// Container image of the expansion helper pod
        #[arg(long, env = "LSDISK_HELPER_IMAGE")]
        helper_image: Option<String>,

        /// Namespace expansion helper pods are created in
        #[arg(long, env = "POD_NAMESPACE")]
        helper_namespace: Option<String>,
    },

    /// Grow a volume's image file (runs inside the expansion helper pod)
    #[command(name = "extend-image")]
    ExtendImage,

    /// Print the disks on this node matching a storage model as JSON
    #[command(name = "find-disk")]
    FindDisk {
        #[arg(long, env = "storagemodel")]
        storage_model: String,

        /// HDD or SSD, only consulted for logical models
        #[arg(long)]
        disk_type: Option<String>,
    },
}

impl Cli {
    fn driver_config(&self) -> DriverConfig {
        let mut config = DriverConfig::from_env();
        if let Some(node_name) = &self.node_name {
            config.node_name = node_name.clone();
        }
        if let Some(scratch_root) = &self.scratch_root {
            config.scratch_root = scratch_root.clone();
        }
        if let Some(image_name) = &self.image_name {
            config.image_name = image_name.clone();
        }
        if let Command::Serve {
            helper_image,
            helper_namespace,
            ..
        } = &self.command
        {
            if let Some(image) = helper_image {
                config.helper_image = image.clone();
            }
            if let Some(namespace) = helper_namespace {
                config.helper_namespace = namespace.clone();
            }
        }
        config
    }
}

fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create log filter")?;

    // stdout is reserved for command output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    let config = cli.driver_config();

    match cli.command {
        Command::Serve { endpoint, .. } => serve(config, &endpoint).await,
        Command::ExtendImage => extend_image(config).await,
        Command::FindDisk {
            storage_model,
            disk_type,
        } => {
            let params = StorageParams {
                storage_model,
                disk_type: disk_type.as_deref().and_then(DiskType::from_param),
                full_disk: false,
            };
            find_disk(config, &params).await
        }
    }
}

async fn serve(config: DriverConfig, endpoint: &str) -> Result<()> {
    info!(
        driver = %config.driver_name,
        node = %config.node_name,
        version = env!("CARGO_PKG_VERSION"),
        "starting CSI plugin",
    );
    let kube = Arc::new(KubeClient::in_cluster(&config).context("Failed to set up Kubernetes client")?);
    let backend = LsdiskBackend::new(config, Arc::new(LinuxHost), kube.clone(), kube);

    server::serve(endpoint, Arc::new(backend), shutdown_signal())
        .await
        .with_context(|| format!("CSI server on {endpoint} failed"))
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

async fn extend_image(mut config: DriverConfig) -> Result<()> {
    let env = ExpansionEnv::from_env().context("Invalid expansion helper environment")?;
    config.scratch_root = env.mount_dest.clone();
    config.image_name = env.image_name.clone();
    info!(
        volume_id = %env.volume_id,
        model = %env.params.storage_model,
        capacity_bytes = env.capacity_bytes,
        "extending image",
    );

    let store = VolumeStore::new(config, Arc::new(LinuxHost), KeyedLocks::new());
    let device = store
        .expand_image(&env.params, &env.volume_id, env.capacity_bytes)
        .await
        .with_context(|| format!("Failed to extend image of volume {}", env.volume_id))?;

    info!(device = %device.name, "image extended");
    Ok(())
}

async fn find_disk(config: DriverConfig, params: &StorageParams) -> Result<()> {
    let selector = DiskSelector::new(Arc::new(LinuxHost), config.scratch_root.clone(), KeyedLocks::new());
    let disks: Vec<String> = selector
        .candidates(params)
        .await
        .context("Failed to list block devices")?
        .into_iter()
        .map(|d| d.name)
        .collect();

    let node = if disks.is_empty() {
        String::new()
    } else {
        config.node_name
    };
    println!("{}", serde_json::json!({ "node": node, "disks": disks }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "lsdisk",
            "--node-name",
            "node-07",
            "--scratch-root",
            "/var/lib/lsdisk",
            "serve",
            "--endpoint",
            "unix:///plugin/csi.sock",
            "--helper-namespace",
            "storage",
        ])
        .unwrap();
        let config = cli.driver_config();

        assert_eq!(config.node_name, "node-07");
        assert_eq!(config.scratch_root, PathBuf::from("/var/lib/lsdisk"));
        assert_eq!(config.helper_namespace, "storage");
        match cli.command {
            Command::Serve { endpoint, .. } => assert_eq!(endpoint, "unix:///plugin/csi.sock"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn find_disk_takes_storage_model() {
        let cli = Cli::try_parse_from([
            "lsdisk",
            "--log-format",
            "json",
            "find-disk",
            "--storage-model",
            "LOGICAL_R1",
            "--disk-type",
            "HDD",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::FindDisk {
                storage_model,
                disk_type,
            } => {
                assert_eq!(storage_model, "LOGICAL_R1");
                assert_eq!(disk_type.as_deref(), Some("HDD"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn extend_image_takes_no_flags() {
        let cli = Cli::try_parse_from(["lsdisk", "extend-image"]).unwrap();
        assert!(matches!(cli.command, Command::ExtendImage));
    }
}
