//! Network resources managed by the store.
//!
//! Every resource is a [`Resource<S>`]: a name, an immutable-until-replaced
//! spec `S`, a status block, backend-contributed metadata and a version.
//! The spec type decides the resource kind, its metadata type and which
//! other resources it depends on.

mod bridge_port;
mod ipsec_sa;
mod logical_bridge;
mod svi;
mod tun_rep;
mod vrf;

pub use bridge_port::{BridgePort, BridgePortMetadata, BridgePortSpec, BridgePortType};
pub use ipsec_sa::{IpsecProtocol, IpsecSa, IpsecSaMetadata, IpsecSaSpec};
pub use logical_bridge::{LogicalBridge, LogicalBridgeSpec};
pub use svi::{Svi, SviSpec};
pub use tun_rep::{TunRep, TunRepSpec};
pub use vrf::{Vrf, VrfMetadata, VrfSpec};

use crate::status::{OperStatus, ResourceStatus};
use crate::version::ResourceVersion;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resource kinds. The string form doubles as the event type on the
/// desired-state event bus and as the key prefix in persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Vrf,
    LogicalBridge,
    BridgePort,
    Svi,
    IpsecSa,
    TunRep,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Vrf,
        ResourceKind::LogicalBridge,
        ResourceKind::BridgePort,
        ResourceKind::Svi,
        ResourceKind::IpsecSa,
        ResourceKind::TunRep,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vrf => "vrf",
            ResourceKind::LogicalBridge => "logical-bridge",
            ResourceKind::BridgePort => "bridge-port",
            ResourceKind::Svi => "svi",
            ResourceKind::IpsecSa => "ipsec-sa",
            ResourceKind::TunRep => "tun-rep",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// Reference to another resource by kind and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for ObjectRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| format!("malformed object reference: {}", s))?;
        Ok(ObjectRef::new(kind.parse()?, name))
    }
}

/// Backend-contributed facts merged into a resource on status callbacks.
pub trait Metadata:
    Clone + fmt::Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Merges fields set in `update` into `self`; unset fields are kept.
    fn merge(&mut self, update: Self);
}

/// Metadata of resources no backend contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NoMetadata {}

impl Metadata for NoMetadata {
    fn merge(&mut self, _update: Self) {}
}

/// Desired configuration of one resource kind.
pub trait ResourceSpec:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ResourceKind;

    type Metadata: Metadata;

    /// Resources that must exist while this one does.
    fn dependencies(&self) -> Vec<ObjectRef> {
        Vec::new()
    }
}

/// A named, versioned network resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Resource<S: ResourceSpec> {
    pub name: String,
    pub spec: S,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub metadata: S::Metadata,
    #[serde(default)]
    pub resource_version: ResourceVersion,
}

impl<S: ResourceSpec> Resource<S> {
    /// A resource as submitted by a client; status, metadata and version
    /// are assigned by the store.
    pub fn new(name: impl Into<String>, spec: S) -> Self {
        Self {
            name: name.into(),
            spec,
            status: ResourceStatus::default(),
            metadata: S::Metadata::default(),
            resource_version: ResourceVersion::default(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        S::KIND
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(S::KIND, self.name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.status.oper_status == OperStatus::ToBeDeleted
    }
}
