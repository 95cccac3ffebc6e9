//! Recursive nexthop resolution.
//!
//! A nexthop with a gateway resolves through the kernel neighbor of that
//! gateway. Overlay nexthops (VXLAN, IPsec tunnel) additionally resolve
//! their remote endpoint through the GRD routing table, recursively, and
//! fan out into one synthesized nexthop per usable underlay path.

use crate::config::NetlinkConfig;
use crate::types::{
    NeighborEntry, NeighborKey, NexthopEntry, NexthopMetadata, NexthopType, RouteEntry, RouteKey,
    RouteType, TunMetadata, Underlay,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::{debug, trace, warn};

pub struct Resolver<'a> {
    /// GRD routes, longest prefix first.
    grd: Vec<&'a RouteEntry>,
    /// Usable neighbors by (vrf, address).
    neighbors: HashMap<(&'a str, IpAddr), Vec<&'a NeighborEntry>>,
    enable_ecmp: bool,
    max_depth: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(
        routes: &'a BTreeMap<RouteKey, RouteEntry>,
        neighbors: &'a BTreeMap<NeighborKey, NeighborEntry>,
        config: &NetlinkConfig,
    ) -> Self {
        let mut grd: Vec<&RouteEntry> = routes
            .values()
            .filter(|r| r.key.table == config.grd_table && r.route_type != RouteType::Local)
            .collect();
        grd.sort_by(|a, b| b.key.dst.prefix_len().cmp(&a.key.dst.prefix_len()));

        let mut index: HashMap<(&str, IpAddr), Vec<&NeighborEntry>> = HashMap::new();
        for neigh in neighbors.values().filter(|n| n.is_resolved()) {
            index
                .entry((neigh.key.vrf.as_str(), neigh.key.dst))
                .or_default()
                .push(neigh);
        }

        Self {
            grd,
            neighbors: index,
            enable_ecmp: config.enable_ecmp,
            max_depth: config.max_resolve_depth,
        }
    }

    /// Resolves `nexthop`.
    ///
    /// Returns the nexthop itself, marked resolved or not, or the nexthops
    /// synthesized from each underlay path of an overlay nexthop. An
    /// already resolved nexthop is returned unchanged.
    pub fn resolve(&self, nexthop: &NexthopEntry) -> Vec<NexthopEntry> {
        let mut visited = BTreeSet::new();
        self.resolve_at(nexthop, 0, &mut visited)
    }

    /// Resolved physical or tunnel paths towards `target` through the GRD.
    pub fn resolve_underlay(&self, target: IpAddr) -> Vec<NexthopEntry> {
        let mut visited = BTreeSet::new();
        self.underlay_paths(target, 1, &mut visited)
    }

    /// Longest-prefix match in the GRD.
    pub fn lookup_grd(&self, target: IpAddr) -> Option<&'a RouteEntry> {
        self.grd.iter().copied().find(|r| r.key.dst.contains(&target))
    }

    fn neighbor(&self, vrf: &str, gateway: IpAddr, dev: Option<&str>) -> Option<&'a NeighborEntry> {
        let candidates = self.neighbors.get(&(vrf, gateway))?;
        match dev {
            Some(dev) => candidates.iter().copied().find(|n| n.key.dev == dev),
            None => candidates.first().copied(),
        }
    }

    fn resolve_at(
        &self,
        nexthop: &NexthopEntry,
        depth: usize,
        visited: &mut BTreeSet<RouteKey>,
    ) -> Vec<NexthopEntry> {
        if nexthop.resolved {
            return vec![nexthop.clone()];
        }
        let mut nh = nexthop.clone();

        if let Some(gateway) = nh.key.gateway {
            match self.neighbor(&nh.key.vrf, gateway, nh.key.dev.as_deref()) {
                Some(neigh) => {
                    nh.neighbor = Some(neigh.key.clone());
                    nh.metadata.set_neighbor_mac(neigh.lladdr);
                }
                None if !nh.onlink => {
                    trace!(nexthop = %nh.key, "No neighbor for gateway");
                    return vec![nh];
                }
                None => {}
            }
        }

        let target = match (&nh.nh_type, &nh.metadata) {
            (NexthopType::Vxlan, NexthopMetadata::Vxlan(m)) => m.remote_vtep,
            (NexthopType::Tun, NexthopMetadata::Tun(m)) => Some(m.peer_ip),
            (NexthopType::Vxlan | NexthopType::Tun, _) => {
                debug!(nexthop = %nh.key, "Overlay nexthop without endpoint");
                return vec![nh];
            }
            _ => {
                nh.resolved = nh.key.gateway.is_none() || nh.neighbor.is_some();
                return vec![nh];
            }
        };
        let Some(target) = target else {
            return vec![nh];
        };

        let underlays = self.underlay_paths(target, depth + 1, visited);
        if underlays.is_empty() {
            trace!(nexthop = %nh.key, target = %target, "Underlay unresolved");
            return vec![nh];
        }

        underlays
            .into_iter()
            .filter_map(|underlay| {
                let egress = underlay.metadata.as_underlay()?;
                let mut synth = nh.clone();
                synth.key.underlay = Some(Box::new(underlay.key));
                attach_underlay(&mut synth.metadata, egress);
                synth.resolved = true;
                Some(synth)
            })
            .collect()
    }

    fn underlay_paths(
        &self,
        target: IpAddr,
        depth: usize,
        visited: &mut BTreeSet<RouteKey>,
    ) -> Vec<NexthopEntry> {
        if depth > self.max_depth {
            warn!(target = %target, depth, "Underlay resolution too deep, giving up");
            return Vec::new();
        }
        let Some(route) = self.lookup_grd(target) else {
            trace!(target = %target, "No GRD route");
            return Vec::new();
        };
        if !visited.insert(route.key.clone()) {
            warn!(target = %target, route = %route.key, "Underlay resolution loop");
            return Vec::new();
        }

        let mut paths = Vec::new();
        for hop in &route.nexthops {
            let mut hop = hop.clone();
            hop.route_refs.clear();
            // Directly connected underlay: the target itself is the neighbor.
            if hop.key.gateway.is_none() && !hop.key.local {
                hop.key.gateway = Some(target);
                hop.resolved = false;
            }
            for resolved in self.resolve_at(&hop, depth, visited) {
                if resolved.resolved && resolved.nh_type.is_underlay() {
                    paths.push(resolved);
                }
            }
            if !self.enable_ecmp && !paths.is_empty() {
                paths.truncate(1);
                break;
            }
        }
        visited.remove(&route.key);
        paths
    }
}

fn attach_underlay(metadata: &mut NexthopMetadata, underlay: Underlay) {
    match metadata {
        NexthopMetadata::Vxlan(m) => m.underlay = Some(underlay),
        NexthopMetadata::Tun(m) => m.underlay = Some(Box::new(underlay)),
        _ => {}
    }
}

/// Static metadata of a tunnel nexthop bound to an SA.
pub fn tun_metadata(spi: u32, sa_index: Option<u32>, local_ip: IpAddr, peer_ip: IpAddr) -> TunMetadata {
    TunMetadata {
        spi,
        sa_index,
        local_ip,
        peer_ip,
        underlay: None,
    }
}
