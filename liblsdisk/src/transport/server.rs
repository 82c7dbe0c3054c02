//! gRPC server that exposes the CSI Identity, Controller and Node services
//! on a Unix domain socket and dispatches each RPC to the trait
//! implementations.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::csi;
use crate::csi::controller_server::{Controller, ControllerServer};
use crate::csi::identity_server::{Identity, IdentityServer};
use crate::csi::node_server::{Node, NodeServer};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::transport::convert::{
    bytes_to_wire, capabilities_from_wire, require, required_bytes,
};
use crate::types::{
    AccessMode, CreateVolumeRequest, NodeExpandVolumeRequest, NodePublishVolumeRequest,
    NodeStageVolumeRequest, StorageParams, VolumeCapability, VolumeId,
};

/// Log a failed RPC and turn it into the status the caller sees.
fn reject(rpc: &'static str, err: CsiError) -> Status {
    match err.code() {
        tonic::Code::Internal => error!(rpc, error = %err, "CSI request failed"),
        _ => warn!(rpc, error = %err, "CSI request rejected"),
    }
    Status::from(err)
}

/// Resolve a CSI endpoint (`unix:///csi/csi.sock` or a bare absolute path)
/// to the socket path it names.
pub fn socket_path(endpoint: &str) -> Result<PathBuf, CsiError> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if path.starts_with('/') {
        Ok(PathBuf::from(path))
    } else {
        Err(CsiError::InvalidArgument(format!(
            "endpoint {endpoint} is not a unix socket path"
        )))
    }
}

/// Adapts a CSI implementation to the three tonic services.
pub struct CsiService<T> {
    handler: Arc<T>,
}

impl<T> Clone for CsiService<T> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T> CsiService<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

/// Serve the CSI services on `endpoint` until `shutdown` resolves.
///
/// A socket file left behind by a previous run is removed before binding.
pub async fn serve<T, F>(endpoint: &str, handler: Arc<T>, shutdown: F) -> Result<(), CsiError>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
    F: Future<Output = ()>,
{
    let path = socket_path(endpoint)?;
    remove_stale_socket(&path).await?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(&path)?;
    info!(socket = %path.display(), "CSI gRPC server listening");

    let service = CsiService::new(handler);
    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(service.clone()))
        .add_service(ControllerServer::new(service.clone()))
        .add_service(NodeServer::new(service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
        .map_err(CsiError::internal)?;

    info!("CSI gRPC server stopped");
    Ok(())
}

async fn remove_stale_socket(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(socket = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[tonic::async_trait]
impl<T> Identity for CsiService<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let info = self
            .handler
            .get_plugin_info()
            .await
            .map_err(|e| reject("GetPluginInfo", e))?;
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: info.name,
            vendor_version: info.vendor_version,
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let caps = self
            .handler
            .get_plugin_capabilities()
            .await
            .map_err(|e| reject("GetPluginCapabilities", e))?;
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: caps.into_iter().map(Into::into).collect(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = self.handler.probe().await.map_err(|e| reject("Probe", e))?;
        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[tonic::async_trait]
impl<T> Controller for CsiService<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    #[instrument(skip_all, fields(name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        let (preferred, requisite) = req
            .accessibility_requirements
            .map(|t| (t.preferred, t.requisite))
            .unwrap_or_default();
        let create = CreateVolumeRequest {
            name: req.name,
            capacity_bytes: required_bytes(req.capacity_range.as_ref()),
            volume_capabilities: capabilities_from_wire(&req.volume_capabilities),
            parameters: req.parameters,
            preferred_topology: preferred.into_iter().map(Into::into).collect(),
            requisite_topology: requisite.into_iter().map(Into::into).collect(),
        };

        let volume = self
            .handler
            .create_volume(create)
            .await
            .map_err(|e| reject("CreateVolume", e))?;
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(volume.into()),
        }))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require(&req.volume_id, "volume_id").map_err(|e| reject("DeleteVolume", e))?;
        self.handler
            .delete_volume(&VolumeId::from(volume_id))
            .await
            .map_err(|e| reject("DeleteVolume", e))?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require(&req.volume_id, "volume_id")
            .map_err(|e| reject("ValidateVolumeCapabilities", e))?;
        if req.volume_capabilities.is_empty() {
            return Err(reject(
                "ValidateVolumeCapabilities",
                CsiError::InvalidArgument("volume_capabilities is required".into()),
            ));
        }

        let caps = capabilities_from_wire(&req.volume_capabilities);
        let valid = self
            .handler
            .validate_volume_capabilities(&VolumeId::from(volume_id), &caps)
            .await
            .map_err(|e| reject("ValidateVolumeCapabilities", e))?;

        let response = if valid {
            csi::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                }),
                message: String::new(),
            }
        } else {
            csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "only single-node writer access is supported".to_owned(),
            }
        };
        Ok(Response::new(response))
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let req = request.into_inner();
        let params = StorageParams::from_parameters(&req.parameters)
            .map_err(|e| reject("GetCapacity", e))?;
        let available = self
            .handler
            .get_capacity(&params)
            .await
            .map_err(|e| reject("GetCapacity", e))?;
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: bytes_to_wire(available),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let caps = CsiController::get_capabilities(&*self.handler)
            .await
            .map_err(|e| reject("ControllerGetCapabilities", e))?;
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: caps.into_iter().map(Into::into).collect(),
        }))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require(&req.volume_id, "volume_id")
            .map_err(|e| reject("ControllerExpandVolume", e))?;
        let capacity = required_bytes(req.capacity_range.as_ref());

        let expansion = CsiController::expand_volume(&*self.handler, &VolumeId::from(volume_id), capacity)
            .await
            .map_err(|e| reject("ControllerExpandVolume", e))?;
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: bytes_to_wire(expansion.capacity_bytes),
            node_expansion_required: expansion.node_expansion_required,
        }))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[tonic::async_trait]
impl<T> Node for CsiService<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        let checked = require(&req.volume_id, "volume_id")
            .and_then(|_| require(&req.staging_target_path, "staging_target_path"))
            .and_then(|_| {
                req.volume_capability
                    .as_ref()
                    .map(VolumeCapability::from)
                    .ok_or_else(|| CsiError::InvalidArgument("volume_capability is required".into()))
            });
        let capability = checked.map_err(|e| reject("NodeStageVolume", e))?;

        self.handler
            .stage_volume(NodeStageVolumeRequest {
                volume_id: VolumeId(req.volume_id),
                staging_target_path: req.staging_target_path,
                volume_capability: capability,
            })
            .await
            .map_err(|e| reject("NodeStageVolume", e))?;
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume_id")
            .and_then(|_| require(&req.staging_target_path, "staging_target_path"))
            .map_err(|e| reject("NodeUnstageVolume", e))?;

        self.handler
            .unstage_volume(&VolumeId(req.volume_id), &req.staging_target_path)
            .await
            .map_err(|e| reject("NodeUnstageVolume", e))?;
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume_id")
            .and_then(|_| require(&req.staging_target_path, "staging_target_path"))
            .and_then(|_| require(&req.target_path, "target_path"))
            .map_err(|e| reject("NodePublishVolume", e))?;

        let read_only = req.readonly
            || req
                .volume_capability
                .as_ref()
                .map(VolumeCapability::from)
                .is_some_and(|c| c.access_mode == AccessMode::SingleNodeReaderOnly);
        self.handler
            .publish_volume(NodePublishVolumeRequest {
                volume_id: VolumeId(req.volume_id),
                staging_target_path: req.staging_target_path,
                target_path: req.target_path,
                read_only,
            })
            .await
            .map_err(|e| reject("NodePublishVolume", e))?;
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume_id")
            .and_then(|_| require(&req.target_path, "target_path"))
            .map_err(|e| reject("NodeUnpublishVolume", e))?;

        self.handler
            .unpublish_volume(&VolumeId(req.volume_id), &req.target_path)
            .await
            .map_err(|e| reject("NodeUnpublishVolume", e))?;
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume_id")
            .and_then(|_| require(&req.volume_path, "volume_path"))
            .map_err(|e| reject("NodeGetVolumeStats", e))?;

        let stats = self
            .handler
            .get_volume_stats(&VolumeId(req.volume_id), &req.volume_path)
            .await
            .map_err(|e| reject("NodeGetVolumeStats", e))?;
        Ok(Response::new(stats.into()))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume_id")
            .and_then(|_| require(&req.volume_path, "volume_path"))
            .map_err(|e| reject("NodeExpandVolume", e))?;

        let capacity = CsiNode::expand_volume(
            &*self.handler,
            NodeExpandVolumeRequest {
                volume_id: VolumeId(req.volume_id),
                volume_path: req.volume_path,
                capacity_bytes: required_bytes(req.capacity_range.as_ref()),
            },
        )
        .await
        .map_err(|e| reject("NodeExpandVolume", e))?;
        Ok(Response::new(csi::NodeExpandVolumeResponse {
            capacity_bytes: bytes_to_wire(capacity),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let caps = CsiNode::get_capabilities(&*self.handler)
            .await
            .map_err(|e| reject("NodeGetCapabilities", e))?;
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: caps.into_iter().map(Into::into).collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let info = self
            .handler
            .get_info()
            .await
            .map_err(|e| reject("NodeGetInfo", e))?;
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: info.node_id,
            max_volumes_per_node: bytes_to_wire(info.max_volumes),
            accessible_topology: info.accessible_topology.map(Into::into),
        }))
    }
}
