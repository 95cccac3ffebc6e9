use super::{NoMetadata, ObjectRef, Resource, ResourceKind, ResourceSpec};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Tunnel representor: the kernel device carrying traffic of one SA.
pub type TunRep = Resource<TunRepSpec>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunRepSpec {
    /// Name of the IPsec SA the tunnel uses.
    pub sa: String,
    #[serde(default)]
    pub vrf: Option<String>,
    #[serde(default)]
    pub ip: Option<IpNet>,
}

impl ResourceSpec for TunRepSpec {
    const KIND: ResourceKind = ResourceKind::TunRep;
    type Metadata = NoMetadata;

    fn dependencies(&self) -> Vec<ObjectRef> {
        let mut deps = vec![ObjectRef::new(ResourceKind::IpsecSa, self.sa.clone())];
        if let Some(vrf) = &self.vrf {
            deps.push(ObjectRef::new(ResourceKind::Vrf, vrf.clone()));
        }
        deps
    }
}
