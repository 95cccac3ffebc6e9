use super::{Metadata, ObjectRef, Resource, ResourceKind, ResourceSpec};
use evpn_types::MacAddress;
use serde::{Deserialize, Serialize};

/// A host-facing port attached to one or more logical bridges.
pub type BridgePort = Resource<BridgePortSpec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgePortType {
    /// Untagged member of exactly one logical bridge.
    #[default]
    Access,
    /// Tagged member of any number of logical bridges.
    Trunk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePortSpec {
    pub mac_address: MacAddress,
    #[serde(default)]
    pub port_type: BridgePortType,
    /// Names of the logical bridges the port is a member of.
    #[serde(default)]
    pub logical_bridges: Vec<String>,
}

impl ResourceSpec for BridgePortSpec {
    const KIND: ResourceKind = ResourceKind::BridgePort;
    type Metadata = BridgePortMetadata;

    fn dependencies(&self) -> Vec<ObjectRef> {
        self.logical_bridges
            .iter()
            .map(|lb| ObjectRef::new(ResourceKind::LogicalBridge, lb.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BridgePortMetadata {
    /// Dataplane virtual port assigned by the P4 backend.
    #[serde(default)]
    pub vport: Option<String>,
}

impl Metadata for BridgePortMetadata {
    fn merge(&mut self, update: Self) {
        if update.vport.is_some() {
            self.vport = update.vport;
        }
    }
}
