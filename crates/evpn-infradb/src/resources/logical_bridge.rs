use super::{NoMetadata, Resource, ResourceKind, ResourceSpec};
use evpn_types::{VlanId, Vni};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// An L2 segment: a VLAN on the tenant bridge, optionally stretched over VXLAN.
pub type LogicalBridge = Resource<LogicalBridgeSpec>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalBridgeSpec {
    pub vlan_id: VlanId,
    #[serde(default)]
    pub vni: Option<Vni>,
    #[serde(default)]
    pub vtep_ip: Option<IpNet>,
}

impl ResourceSpec for LogicalBridgeSpec {
    const KIND: ResourceKind = ResourceKind::LogicalBridge;
    type Metadata = NoMetadata;
}
