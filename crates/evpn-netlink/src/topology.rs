//! Configured topology the synchronizer interprets kernel state against.
//!
//! A [`Topology`] is a flat copy of the resources read from the store at
//! the start of a cycle. Reading it is the only time a cycle touches the
//! store; kernel queries and computation run without holding its lock.

use crate::error::Result;
use async_trait::async_trait;
use evpn_infradb::{
    BridgePortSpec, BridgePortType, InfraDb, IpsecSaSpec, LogicalBridgeSpec, SviSpec, TunRepSpec,
    VrfSpec,
};
use evpn_types::{MacAddress, VlanId, Vni};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfInfo {
    pub name: String,
    pub vni: Option<Vni>,
    pub vtep_ip: Option<IpAddr>,
    pub rmac: Option<MacAddress>,
    pub routing_tables: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalBridgeInfo {
    pub name: String,
    pub vlan_id: VlanId,
    pub vni: Option<Vni>,
    pub vtep_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePortInfo {
    pub name: String,
    pub mac: MacAddress,
    pub port_type: BridgePortType,
    pub vport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SviInfo {
    pub name: String,
    pub vrf: String,
    pub vlan_id: VlanId,
    pub mac: MacAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunRepInfo {
    pub name: String,
    pub sa: String,
    pub vrf: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaInfo {
    pub name: String,
    pub spi: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub sa_index: Option<u32>,
}

/// Resources relevant to forwarding-state derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub vrfs: Vec<VrfInfo>,
    pub logical_bridges: Vec<LogicalBridgeInfo>,
    pub bridge_ports: Vec<BridgePortInfo>,
    pub svis: Vec<SviInfo>,
    pub tun_reps: Vec<TunRepInfo>,
    pub sas: Vec<SaInfo>,
}

impl Topology {
    pub fn vrf(&self, name: &str) -> Option<&VrfInfo> {
        self.vrfs.iter().find(|v| v.name == name)
    }

    pub fn sa(&self, name: &str) -> Option<&SaInfo> {
        self.sas.iter().find(|s| s.name == name)
    }

    pub fn logical_bridge_by_vlan(&self, vlan_id: VlanId) -> Option<&LogicalBridgeInfo> {
        self.logical_bridges.iter().find(|lb| lb.vlan_id == vlan_id)
    }
}

/// Supplies the topology at the start of each cycle.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn topology(&self) -> Result<Topology>;
}

/// A fixed topology, for tools and tests.
#[async_trait]
impl TopologyProvider for Topology {
    async fn topology(&self) -> Result<Topology> {
        Ok(self.clone())
    }
}

#[async_trait]
impl TopologyProvider for InfraDb {
    async fn topology(&self) -> Result<Topology> {
        let vrfs = self
            .list::<VrfSpec>()
            .await?
            .into_iter()
            .map(|vrf| VrfInfo {
                vni: vrf.spec.vni,
                vtep_ip: vrf.spec.vtep_ip.map(|net| net.addr()),
                rmac: vrf.metadata.rmac,
                routing_tables: vrf.metadata.routing_tables,
                name: vrf.name,
            })
            .collect();

        let logical_bridges: Vec<LogicalBridgeInfo> = self
            .list::<LogicalBridgeSpec>()
            .await?
            .into_iter()
            .map(|lb| LogicalBridgeInfo {
                vlan_id: lb.spec.vlan_id,
                vni: lb.spec.vni,
                vtep_ip: lb.spec.vtep_ip.map(|net| net.addr()),
                name: lb.name,
            })
            .collect();
        let vlans: HashMap<&str, VlanId> = logical_bridges
            .iter()
            .map(|lb| (lb.name.as_str(), lb.vlan_id))
            .collect();

        let bridge_ports = self
            .list::<BridgePortSpec>()
            .await?
            .into_iter()
            .map(|bp| BridgePortInfo {
                mac: bp.spec.mac_address,
                port_type: bp.spec.port_type,
                vport: bp.metadata.vport,
                name: bp.name,
            })
            .collect();

        let svis = self
            .list::<SviSpec>()
            .await?
            .into_iter()
            .filter_map(|svi| {
                let Some(vlan_id) = vlans.get(svi.spec.logical_bridge.as_str()).copied() else {
                    debug!(svi = %svi.name, "SVI without logical bridge skipped");
                    return None;
                };
                Some(SviInfo {
                    vrf: svi.spec.vrf,
                    vlan_id,
                    mac: svi.spec.mac_address,
                    name: svi.name,
                })
            })
            .collect();

        let tun_reps = self
            .list::<TunRepSpec>()
            .await?
            .into_iter()
            .map(|tr| TunRepInfo {
                sa: tr.spec.sa,
                vrf: tr.spec.vrf,
                name: tr.name,
            })
            .collect();

        let sas = self
            .list::<IpsecSaSpec>()
            .await?
            .into_iter()
            .map(|sa| SaInfo {
                spi: sa.spec.spi,
                src_ip: sa.spec.src_ip,
                dst_ip: sa.spec.dst_ip,
                sa_index: sa.metadata.sa_index,
                name: sa.name,
            })
            .collect();

        Ok(Topology {
            vrfs,
            logical_bridges,
            bridge_ports,
            svis,
            tun_reps,
            sas,
        })
    }
}
