use super::{Metadata, Resource, ResourceKind, ResourceSpec};
use evpn_types::{MacAddress, Vni};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// A tenant routing domain.
pub type Vrf = Resource<VrfSpec>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VrfSpec {
    /// L3 VNI; a VRF without one is not stretched over the fabric.
    #[serde(default)]
    pub vni: Option<Vni>,
    #[serde(default)]
    pub loopback_ip: Option<IpNet>,
    #[serde(default)]
    pub vtep_ip: Option<IpNet>,
}

impl ResourceSpec for VrfSpec {
    const KIND: ResourceKind = ResourceKind::Vrf;
    type Metadata = VrfMetadata;
}

/// Facts the Linux and routing backends learn while programming a VRF.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VrfMetadata {
    /// Router MAC of the VRF bridge, used as inner source MAC of EVPN traffic.
    #[serde(default)]
    pub rmac: Option<MacAddress>,
    /// Kernel routing tables allocated to the VRF.
    #[serde(default)]
    pub routing_tables: Vec<u32>,
}

impl Metadata for VrfMetadata {
    fn merge(&mut self, update: Self) {
        if update.rmac.is_some() {
            self.rmac = update.rmac;
        }
        if !update.routing_tables.is_empty() {
            self.routing_tables = update.routing_tables;
        }
    }
}
