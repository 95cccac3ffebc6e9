use super::{Metadata, ObjectRef, Resource, ResourceKind, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// An IPsec security association terminating tunnel traffic.
pub type IpsecSa = Resource<IpsecSaSpec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecProtocol {
    #[default]
    Esp,
    Ah,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpsecSaSpec {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub spi: u32,
    /// XFRM interface ID the SA is bound to.
    pub if_id: u32,
    #[serde(default)]
    pub protocol: IpsecProtocol,
    #[serde(default)]
    pub vrf: Option<String>,
}

impl ResourceSpec for IpsecSaSpec {
    const KIND: ResourceKind = ResourceKind::IpsecSa;
    type Metadata = IpsecSaMetadata;

    fn dependencies(&self) -> Vec<ObjectRef> {
        self.vrf
            .iter()
            .map(|vrf| ObjectRef::new(ResourceKind::Vrf, vrf.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpsecSaMetadata {
    /// Index of the SA in the dataplane crypto table.
    #[serde(default)]
    pub sa_index: Option<u32>,
}

impl Metadata for IpsecSaMetadata {
    fn merge(&mut self, update: Self) {
        if update.sa_index.is_some() {
            self.sa_index = update.sa_index;
        }
    }
}
