//! Snapshot entities derived from kernel state.
//!
//! Every table is keyed by a small ordered key type so that two snapshots
//! can be compared key by key. Entities are rebuilt from scratch on every
//! cycle and never mutated once published.

use evpn_types::{MacAddress, VlanId, Vni};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// VRF name of the global routing domain.
pub const GRD: &str = "GRD";

/// Classification of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    Connected,
    EvpnVxlan,
    Static,
    Bgp,
    Local,
    Neighbor,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub table: u32,
    pub dst: IpNet,
}

impl RouteKey {
    pub fn new(table: u32, dst: IpNet) -> Self {
        Self { table, dst }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} table {}", self.dst, self.table)
    }
}

/// A route and the nexthops it forwards through.
///
/// Nexthops embedded here carry no route references; the nexthop table
/// holds the shared entries with their full reference sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub key: RouteKey,
    pub vrf: String,
    pub route_type: RouteType,
    pub protocol: String,
    pub metric: u32,
    pub prefsrc: Option<IpAddr>,
    pub nexthops: Vec<NexthopEntry>,
}

/// Kind of a nexthop, derived from its outgoing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NexthopType {
    /// Configured physical port.
    Phy,
    /// VRF bridge or VXLAN device; resolved through the GRD.
    Vxlan,
    /// SVI of a logical bridge.
    Svi,
    /// Access bridge port.
    Acc,
    /// Tunnel representor bound to an IPsec SA; resolved through the GRD.
    Tun,
    Other,
}

impl NexthopType {
    /// Types whose forwarding depends on an underlay route.
    pub fn is_overlay(&self) -> bool {
        matches!(self, Self::Vxlan | Self::Tun)
    }

    /// Types an overlay nexthop may egress through.
    pub fn is_underlay(&self) -> bool {
        matches!(self, Self::Phy | Self::Tun)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NexthopKey {
    pub vrf: String,
    pub gateway: Option<IpAddr>,
    pub dev: Option<String>,
    /// Nexthop of a local route: delivers to the host.
    pub local: bool,
    /// Underlay the overlay nexthop was resolved through.
    pub underlay: Option<Box<NexthopKey>>,
}

impl NexthopKey {
    pub fn new(vrf: impl Into<String>, gateway: Option<IpAddr>, dev: Option<String>) -> Self {
        Self {
            vrf: vrf.into(),
            gateway,
            dev,
            local: false,
            underlay: None,
        }
    }
}

impl fmt::Display for NexthopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vrf)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {}", dev)?;
        }
        if let Some(underlay) = &self.underlay {
            write!(f, " over [{}]", underlay)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NexthopEntry {
    pub key: NexthopKey,
    pub nh_type: NexthopType,
    pub resolved: bool,
    pub onlink: bool,
    pub weight: u32,
    /// Neighbor the gateway resolved to; a lookup key, not an owned entry.
    pub neighbor: Option<NeighborKey>,
    pub metadata: NexthopMetadata,
    /// Routes forwarding through this nexthop.
    pub route_refs: BTreeSet<RouteKey>,
}

impl NexthopEntry {
    pub fn new(key: NexthopKey, nh_type: NexthopType) -> Self {
        Self {
            key,
            nh_type,
            resolved: false,
            onlink: false,
            weight: 1,
            neighbor: None,
            metadata: NexthopMetadata::None,
            route_refs: BTreeSet::new(),
        }
    }
}

/// Forwarding facts of a nexthop, one shape per nexthop kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NexthopMetadata {
    #[default]
    None,
    Phy(PhyMetadata),
    Svi(SviMetadata),
    Acc(AccMetadata),
    Vxlan(VxlanMetadata),
    Tun(TunMetadata),
}

impl NexthopMetadata {
    /// Records the MAC the gateway resolved to.
    pub fn set_neighbor_mac(&mut self, mac: Option<MacAddress>) {
        match self {
            Self::Phy(m) => m.dst_mac = mac,
            Self::Svi(m) => m.dst_mac = mac,
            Self::Acc(m) => m.dst_mac = mac,
            Self::Vxlan(m) => m.inner_dst_mac = mac,
            Self::Tun(_) | Self::None => {}
        }
    }

    /// Egress facts usable as the underlay of an overlay nexthop.
    pub fn as_underlay(&self) -> Option<Underlay> {
        match self {
            Self::Phy(m) => Some(Underlay::Phy(m.clone())),
            Self::Tun(m) => Some(Underlay::Tun(m.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyMetadata {
    pub src_mac: Option<MacAddress>,
    pub dst_mac: Option<MacAddress>,
    pub egress_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SviMetadata {
    pub src_mac: Option<MacAddress>,
    pub dst_mac: Option<MacAddress>,
    pub vlan_id: VlanId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccMetadata {
    pub src_mac: Option<MacAddress>,
    pub dst_mac: Option<MacAddress>,
    pub vport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanMetadata {
    /// Router MAC of the local VRF.
    pub inner_src_mac: Option<MacAddress>,
    /// Router MAC of the remote VTEP.
    pub inner_dst_mac: Option<MacAddress>,
    pub vni: Option<Vni>,
    pub local_vtep: Option<IpAddr>,
    pub remote_vtep: Option<IpAddr>,
    pub underlay: Option<Underlay>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunMetadata {
    pub spi: u32,
    pub sa_index: Option<u32>,
    pub local_ip: IpAddr,
    pub peer_ip: IpAddr,
    pub underlay: Option<Box<Underlay>>,
}

/// Egress an overlay nexthop was resolved through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Underlay {
    Phy(PhyMetadata),
    Tun(TunMetadata),
}

/// NUD state of a kernel neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    NoArp,
    Permanent,
    Unknown,
}

impl NeighborState {
    /// Picks the most specific state from the names `ip -j neigh` prints.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut state = Self::Unknown;
        for name in names {
            let parsed = match name.as_ref() {
                "INCOMPLETE" => Self::Incomplete,
                "REACHABLE" => Self::Reachable,
                "STALE" => Self::Stale,
                "DELAY" => Self::Delay,
                "PROBE" => Self::Probe,
                "FAILED" => Self::Failed,
                "NOARP" => Self::NoArp,
                "PERMANENT" => Self::Permanent,
                _ => continue,
            };
            if state == Self::Unknown || parsed.is_resolved() {
                state = parsed;
            }
        }
        state
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Self::Reachable | Self::Stale | Self::Delay | Self::Probe | Self::Permanent | Self::NoArp
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NeighborKey {
    pub dst: IpAddr,
    pub vrf: String,
    pub dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub key: NeighborKey,
    pub lladdr: Option<MacAddress>,
    pub state: NeighborState,
}

impl NeighborEntry {
    /// Usable for forwarding: a resolved state and a unicast MAC.
    pub fn is_resolved(&self) -> bool {
        self.state.is_resolved() && self.lladdr.is_some_and(|mac| mac.is_forwardable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FdbKey {
    pub vlan_id: VlanId,
    pub mac: MacAddress,
}

impl fmt::Display for FdbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vlan {}", self.mac, self.vlan_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdbType {
    Vxlan,
    BridgePort,
    Phy,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbEntry {
    pub key: FdbKey,
    pub dev: String,
    pub fdb_type: FdbType,
    pub l2_nexthop: L2NexthopKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct L2NexthopKey {
    pub dev: String,
    pub vlan_id: VlanId,
    /// Remote VTEP of VXLAN nexthops.
    pub dst: Option<IpAddr>,
}

impl fmt::Display for L2NexthopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vlan {}", self.dev, self.vlan_id)?;
        if let Some(dst) = self.dst {
            write!(f, " dst {}", dst)?;
        }
        Ok(())
    }
}

/// L2 egress shared by every FDB entry in `fdb_refs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2NexthopEntry {
    pub key: L2NexthopKey,
    pub fdb_type: FdbType,
    pub fdb_refs: BTreeSet<FdbKey>,
    pub metadata: L2NexthopMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum L2NexthopMetadata {
    Vxlan {
        vni: Option<Vni>,
        local_vtep: Option<IpAddr>,
        remote_vtep: IpAddr,
        underlay: Option<Underlay>,
    },
    BridgePort {
        vport: Option<String>,
    },
    Phy {
        egress_port: u32,
    },
}
