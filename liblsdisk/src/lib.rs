//! # liblsdisk: local-disk CSI plugin for Kubernetes
//!
//! `liblsdisk` provisions volumes backed by raw local block devices.  A volume
//! is a sparse image file carved out of a physical disk that matches the
//! requested *storage model*; on the node it is exposed through a loop device
//! and wired into the pod through a staging mount and a bind mount.  The
//! plugin speaks the standard [Container Storage Interface][csi] over gRPC on
//! a Unix domain socket, built on `tonic`, the Tokio runtime, `tracing` for
//! observability and `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, `StorageParams`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`config`] | [`DriverConfig`] and the expansion-helper environment contract. |
//! | [`exec`] | [`HostSystem`]: the narrow OS interface every host operation goes through. |
//! | [`host`] | Disk selection, image files, loop devices, mounts. |
//! | [`lock`] | Keyed admission locks serialising work on one volume. |
//! | [`metadata`] | Kubernetes collaborators: PV/StorageClass lookups, expansion helper pods. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume create/delete/expand/capacity. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage, expand, stats. |
//! | [`backend`] | [`LsdiskBackend`], the concrete implementation of the three traits. |
//! | [`transport`] | gRPC server over a Unix socket. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod exec;
pub mod host;
pub mod identity;
pub mod lock;
pub mod metadata;
pub mod node;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

/// Generated CSI v1 protobuf types and service stubs.
pub mod csi {
    #![allow(clippy::all)]
    tonic::include_proto!("csi.v1");
}

// Re-export the most commonly used items at crate root for convenience.
pub use backend::lsdisk::LsdiskBackend;
pub use config::{DriverConfig, ExpansionEnv};
pub use controller::CsiController;
pub use error::CsiError;
pub use exec::{HostSystem, LinuxHost};
pub use identity::CsiIdentity;
pub use node::CsiNode;
pub use types::*;
