use super::{NoMetadata, ObjectRef, Resource, ResourceKind, ResourceSpec};
use evpn_types::MacAddress;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Routed gateway interface of a logical bridge inside a VRF.
pub type Svi = Resource<SviSpec>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SviSpec {
    pub vrf: String,
    pub logical_bridge: String,
    pub mac_address: MacAddress,
    #[serde(default)]
    pub gw_ips: Vec<IpNet>,
    #[serde(default)]
    pub enable_bgp: bool,
    #[serde(default)]
    pub remote_as: Option<u32>,
}

impl ResourceSpec for SviSpec {
    const KIND: ResourceKind = ResourceKind::Svi;
    type Metadata = NoMetadata;

    fn dependencies(&self) -> Vec<ObjectRef> {
        vec![
            ObjectRef::new(ResourceKind::Vrf, self.vrf.clone()),
            ObjectRef::new(ResourceKind::LogicalBridge, self.logical_bridge.clone()),
        ]
    }
}
