//! Conversions between the wire protobufs and the crate's data model.

use crate::csi;
use crate::error::CsiError;
use crate::types::{
    AccessMode, ControllerCapability, NodeCapability, PluginCapability, Topology, Volume,
    VolumeCapability, VolumeStats, VolumeUsage,
};

/// Wire sizes are signed; negative values are treated as "unspecified".
pub fn bytes_from_wire(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub fn bytes_to_wire(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Requested size of a capacity range, 0 when absent.
pub fn required_bytes(range: Option<&csi::CapacityRange>) -> u64 {
    range.map(|r| bytes_from_wire(r.required_bytes)).unwrap_or(0)
}

/// Reject an empty required string field.
pub fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, CsiError> {
    if value.is_empty() {
        Err(CsiError::InvalidArgument(format!("{field} is required")))
    } else {
        Ok(value)
    }
}

impl From<csi::volume_capability::access_mode::Mode> for AccessMode {
    fn from(mode: csi::volume_capability::access_mode::Mode) -> Self {
        use csi::volume_capability::access_mode::Mode;
        match mode {
            Mode::Unknown => AccessMode::Unknown,
            Mode::SingleNodeWriter => AccessMode::SingleNodeWriter,
            Mode::SingleNodeReaderOnly => AccessMode::SingleNodeReaderOnly,
            Mode::MultiNodeReaderOnly => AccessMode::MultiNodeReaderOnly,
            Mode::MultiNodeSingleWriter => AccessMode::MultiNodeSingleWriter,
            Mode::MultiNodeMultiWriter => AccessMode::MultiNodeMultiWriter,
        }
    }
}

impl From<&csi::VolumeCapability> for VolumeCapability {
    fn from(cap: &csi::VolumeCapability) -> Self {
        use csi::volume_capability::AccessType;

        let access_mode = cap
            .access_mode
            .as_ref()
            .map(|m| AccessMode::from(m.mode()))
            .unwrap_or(AccessMode::Unknown);
        VolumeCapability {
            access_mode,
            block: matches!(cap.access_type, Some(AccessType::Block(_))),
        }
    }
}

pub fn capabilities_from_wire(caps: &[csi::VolumeCapability]) -> Vec<VolumeCapability> {
    caps.iter().map(VolumeCapability::from).collect()
}

impl From<csi::Topology> for Topology {
    fn from(t: csi::Topology) -> Self {
        Topology {
            segments: t.segments.into_iter().collect(),
        }
    }
}

impl From<Topology> for csi::Topology {
    fn from(t: Topology) -> Self {
        csi::Topology {
            segments: t.segments.into_iter().collect(),
        }
    }
}

impl From<Volume> for csi::Volume {
    fn from(v: Volume) -> Self {
        csi::Volume {
            capacity_bytes: bytes_to_wire(v.capacity_bytes),
            volume_id: v.volume_id.0,
            volume_context: v.volume_context.into_iter().collect(),
            accessible_topology: v.accessible_topology.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<PluginCapability> for csi::PluginCapability {
    fn from(cap: PluginCapability) -> Self {
        use csi::plugin_capability::{Service, Type, VolumeExpansion, service, volume_expansion};

        let service = |t: service::Type| Type::Service(Service { r#type: t.into() });
        let r#type = match cap {
            PluginCapability::ControllerService => service(service::Type::ControllerService),
            PluginCapability::VolumeAccessibilityConstraints => {
                service(service::Type::VolumeAccessibilityConstraints)
            }
            PluginCapability::OnlineVolumeExpansion => Type::VolumeExpansion(VolumeExpansion {
                r#type: volume_expansion::Type::Online.into(),
            }),
        };
        csi::PluginCapability {
            r#type: Some(r#type),
        }
    }
}

impl From<ControllerCapability> for csi::ControllerServiceCapability {
    fn from(cap: ControllerCapability) -> Self {
        use csi::controller_service_capability::{Rpc, Type, rpc};

        let rpc_type = match cap {
            ControllerCapability::CreateDeleteVolume => rpc::Type::CreateDeleteVolume,
            ControllerCapability::ExpandVolume => rpc::Type::ExpandVolume,
            ControllerCapability::GetCapacity => rpc::Type::GetCapacity,
        };
        csi::ControllerServiceCapability {
            r#type: Some(Type::Rpc(Rpc {
                r#type: rpc_type.into(),
            })),
        }
    }
}

impl From<NodeCapability> for csi::NodeServiceCapability {
    fn from(cap: NodeCapability) -> Self {
        use csi::node_service_capability::{Rpc, Type, rpc};

        let rpc_type = match cap {
            NodeCapability::StageUnstageVolume => rpc::Type::StageUnstageVolume,
            NodeCapability::ExpandVolume => rpc::Type::ExpandVolume,
            NodeCapability::GetVolumeStats => rpc::Type::GetVolumeStats,
        };
        csi::NodeServiceCapability {
            r#type: Some(Type::Rpc(Rpc {
                r#type: rpc_type.into(),
            })),
        }
    }
}

fn usage(u: VolumeUsage, unit: csi::volume_usage::Unit) -> csi::VolumeUsage {
    csi::VolumeUsage {
        available: bytes_to_wire(u.available),
        total: bytes_to_wire(u.total),
        used: bytes_to_wire(u.used),
        unit: unit.into(),
    }
}

impl From<VolumeStats> for csi::NodeGetVolumeStatsResponse {
    fn from(stats: VolumeStats) -> Self {
        csi::NodeGetVolumeStatsResponse {
            usage: vec![
                usage(stats.bytes, csi::volume_usage::Unit::Bytes),
                usage(stats.inodes, csi::volume_usage::Unit::Inodes),
            ],
        }
    }
}
