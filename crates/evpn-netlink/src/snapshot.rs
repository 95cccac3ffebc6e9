//! One cycle's view of kernel forwarding state.
//!
//! [`build_snapshot`] is a pure function from raw kernel rows and the
//! configured topology to the filtered tables the synchronizer publishes:
//!
//! 1. collect: classify routes and neighbors per VRF, synthesize neighbor
//!    host routes;
//! 2. annotate: attach the static per-kind metadata of every nexthop;
//! 3. resolve: run every nexthop through the [`Resolver`];
//! 4. filter: drop unresolved nexthops and routes left without one;
//! 5. FDB: pair bridge entries with their L2 nexthops.

use crate::config::NetlinkConfig;
use crate::devices::{vrf_bridge, DeviceRole, Devices};
use crate::diff::{diff, TableDiff};
use crate::events::{Change, NetlinkEvent};
use crate::fdb::{collect_fdb, FdbTable, L2NexthopTable};
use crate::kernel::{KernelFdb, KernelLink, KernelNeighbor, KernelRoute};
use crate::resolve::{tun_metadata, Resolver};
use crate::topology::Topology;
use crate::types::{
    AccMetadata, NeighborEntry, NeighborKey, NeighborState, NexthopEntry, NexthopKey,
    NexthopMetadata, NexthopType, PhyMetadata, RouteEntry, RouteKey, RouteType, SviMetadata,
    VxlanMetadata, GRD,
};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::trace;

pub type RouteTable = BTreeMap<RouteKey, RouteEntry>;
pub type NexthopTable = BTreeMap<NexthopKey, NexthopEntry>;
pub type NeighborTable = BTreeMap<NeighborKey, NeighborEntry>;

/// Route types the kernel prints that never carry forwarding state.
const IGNORED_ROUTE_KINDS: &[&str] = &["broadcast", "multicast", "unreachable", "prohibit", "blackhole", "throw"];

/// A VRF and the routing tables queried for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfContext {
    pub name: String,
    pub tables: Vec<u32>,
}

impl VrfContext {
    pub fn is_grd(&self) -> bool {
        self.name == GRD
    }
}

/// The GRD followed by every VRF that has a routing table.
pub fn vrf_contexts(topology: &Topology, config: &NetlinkConfig) -> Vec<VrfContext> {
    let mut contexts = vec![VrfContext {
        name: GRD.to_string(),
        tables: vec![config.grd_table],
    }];
    contexts.extend(
        topology
            .vrfs
            .iter()
            .filter(|vrf| !vrf.routing_tables.is_empty())
            .map(|vrf| VrfContext {
                name: vrf.name.clone(),
                tables: vrf.routing_tables.clone(),
            }),
    );
    contexts
}

/// Raw kernel rows gathered in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    pub links: Vec<KernelLink>,
    /// Routes by routing table.
    pub routes: BTreeMap<u32, Vec<KernelRoute>>,
    /// Neighbors by VRF name.
    pub neighbors: BTreeMap<String, Vec<KernelNeighbor>>,
    pub fdb: Vec<KernelFdb>,
}

/// Published tables of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub routes: RouteTable,
    pub nexthops: NexthopTable,
    /// Lookup only; neighbors are not published.
    pub neighbors: NeighborTable,
    pub fdb: FdbTable,
    pub l2_nexthops: L2NexthopTable,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
            && self.nexthops.is_empty()
            && self.fdb.is_empty()
            && self.l2_nexthops.is_empty()
    }

    /// Events turning `self` into `next`.
    ///
    /// Additions and updates go out dependencies first (L2 nexthops, FDB,
    /// nexthops, routes); deletions go out in the reverse order.
    pub fn changes(&self, next: &Snapshot) -> Vec<NetlinkEvent> {
        let mut l2 = diff(&self.l2_nexthops, &next.l2_nexthops);
        let mut fdb = diff(&self.fdb, &next.fdb);
        let mut nexthops = diff(&self.nexthops, &next.nexthops);
        let mut routes = diff(&self.routes, &next.routes);

        let mut events = Vec::with_capacity(l2.len() + fdb.len() + nexthops.len() + routes.len());
        push_upserts(&mut events, &mut l2, NetlinkEvent::l2_nexthop);
        push_upserts(&mut events, &mut fdb, NetlinkEvent::fdb_entry);
        push_upserts(&mut events, &mut nexthops, NetlinkEvent::nexthop);
        push_upserts(&mut events, &mut routes, NetlinkEvent::route);
        push_deletes(&mut events, routes, NetlinkEvent::route);
        push_deletes(&mut events, nexthops, NetlinkEvent::nexthop);
        push_deletes(&mut events, fdb, NetlinkEvent::fdb_entry);
        push_deletes(&mut events, l2, NetlinkEvent::l2_nexthop);
        events
    }

    /// Delete events for everything in the snapshot.
    pub fn teardown(&self) -> Vec<NetlinkEvent> {
        self.changes(&Snapshot::default())
    }
}

fn push_upserts<K, V>(
    events: &mut Vec<NetlinkEvent>,
    table_diff: &mut TableDiff<K, V>,
    event: fn(Change, V) -> NetlinkEvent,
) {
    for (_, v) in std::mem::take(&mut table_diff.added) {
        events.push(event(Change::Added, v));
    }
    for (_, v) in std::mem::take(&mut table_diff.updated) {
        events.push(event(Change::Updated, v));
    }
}

fn push_deletes<K, V>(
    events: &mut Vec<NetlinkEvent>,
    table_diff: TableDiff<K, V>,
    event: fn(Change, V) -> NetlinkEvent,
) {
    for (_, v) in table_diff.deleted {
        events.push(event(Change::Deleted, v));
    }
}

/// Builds the filtered snapshot of one cycle.
pub fn build_snapshot(state: &KernelState, topology: &Topology, config: &NetlinkConfig) -> Snapshot {
    let devices = Devices::new(topology, config, &state.links);
    let contexts = vrf_contexts(topology, config);

    let neighbors = collect_neighbors(state, &contexts);
    let mut raw_routes = collect_routes(state, &contexts, &devices, topology);
    add_neighbor_routes(&mut raw_routes, &neighbors, &contexts, &devices, topology);

    let resolver = Resolver::new(&raw_routes, &neighbors, config);
    let (routes, nexthops) = resolve_routes(&raw_routes, &resolver);
    let (fdb, l2_nexthops) = collect_fdb(&state.fdb, &devices, topology, &resolver);

    Snapshot {
        routes,
        nexthops,
        neighbors,
        fdb,
        l2_nexthops,
    }
}

fn collect_neighbors(state: &KernelState, contexts: &[VrfContext]) -> NeighborTable {
    let mut table = NeighborTable::new();
    for ctx in contexts {
        let Some(rows) = state.neighbors.get(&ctx.name) else {
            continue;
        };
        for row in rows {
            let Some(dev) = &row.dev else {
                continue;
            };
            let key = NeighborKey {
                dst: row.dst,
                vrf: ctx.name.clone(),
                dev: dev.clone(),
            };
            let entry = NeighborEntry {
                key: key.clone(),
                lladdr: row.lladdr.as_deref().and_then(|mac| mac.parse().ok()),
                state: NeighborState::from_names(&row.state),
            };
            table.insert(key, entry);
        }
    }
    table
}

fn classify(route: &KernelRoute, devices: &Devices) -> Option<RouteType> {
    let kind = route.kind();
    if kind == "local" {
        return Some(RouteType::Local);
    }
    if IGNORED_ROUTE_KINDS.contains(&kind) {
        return None;
    }
    Some(match route.protocol() {
        "bgp" => {
            let mut devs = route
                .dev
                .iter()
                .chain(route.nexthops.iter().filter_map(|nh| nh.dev.as_ref()));
            if devs.any(|dev| devices.is_evpn_device(dev)) {
                RouteType::EvpnVxlan
            } else {
                RouteType::Bgp
            }
        }
        "kernel" => RouteType::Connected,
        _ => RouteType::Static,
    })
}

fn collect_routes(
    state: &KernelState,
    contexts: &[VrfContext],
    devices: &Devices,
    topology: &Topology,
) -> RouteTable {
    let mut table = RouteTable::new();
    for ctx in contexts {
        for table_id in &ctx.tables {
            let Some(rows) = state.routes.get(table_id) else {
                continue;
            };
            for row in rows {
                let Some(route_type) = classify(row, devices) else {
                    continue;
                };
                let Some(dst) = parse_dst(&row.dst) else {
                    trace!(dst = %row.dst, "Unparsable route destination");
                    continue;
                };
                let key = RouteKey::new(*table_id, dst);
                let metric = row.metric.unwrap_or(0);
                if table.get(&key).is_some_and(|existing| existing.metric <= metric) {
                    continue;
                }

                let local = route_type == RouteType::Local;
                let nexthops = route_nexthops(row)
                    .into_iter()
                    .map(|(gateway, dev, weight, onlink)| {
                        let nh_type = devices.nexthop_type(dev.as_deref());
                        let mut nh_key = NexthopKey::new(ctx.name.clone(), gateway, dev);
                        nh_key.local = local;
                        let mut nh = NexthopEntry::new(nh_key, nh_type);
                        nh.weight = weight;
                        nh.onlink = onlink;
                        annotate(&mut nh, devices, topology);
                        nh
                    })
                    .collect();

                table.insert(
                    key.clone(),
                    RouteEntry {
                        key,
                        vrf: ctx.name.clone(),
                        route_type,
                        protocol: row.protocol().to_string(),
                        metric,
                        prefsrc: row.prefsrc,
                        nexthops,
                    },
                );
            }
        }
    }
    table
}

/// (gateway, dev, weight, onlink) of each path of a kernel route.
fn route_nexthops(row: &KernelRoute) -> Vec<(Option<IpAddr>, Option<String>, u32, bool)> {
    let onlink = |flags: &[String]| flags.iter().any(|f| f == "onlink");
    if row.nexthops.is_empty() {
        vec![(row.gateway, row.dev.clone(), 1, onlink(&row.flags))]
    } else {
        row.nexthops
            .iter()
            .map(|nh| {
                (
                    nh.gateway,
                    nh.dev.clone(),
                    nh.weight.unwrap_or(1),
                    onlink(&nh.flags) || onlink(&row.flags),
                )
            })
            .collect()
    }
}

/// Prefix of a route; the kernel prints host routes without a length.
fn parse_dst(dst: &str) -> Option<IpNet> {
    match dst.parse::<IpNet>() {
        Ok(net) => Some(net),
        Err(_) => dst.parse::<IpAddr>().ok().and_then(host_net),
    }
}

fn host_net(addr: IpAddr) -> Option<IpNet> {
    let len = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, len).ok()
}

/// Static metadata of a nexthop from its device role and VRF.
fn annotate(nh: &mut NexthopEntry, devices: &Devices, topology: &Topology) {
    let dev = nh.key.dev.as_deref().unwrap_or_default();
    let src_mac = devices.mac(dev);
    nh.metadata = match (nh.nh_type, devices.role(dev)) {
        (NexthopType::Phy, Some(DeviceRole::Phy { egress_port })) => NexthopMetadata::Phy(PhyMetadata {
            src_mac,
            dst_mac: None,
            egress_port: *egress_port,
        }),
        (NexthopType::Svi, Some(DeviceRole::Svi { vlan_id, .. })) => NexthopMetadata::Svi(SviMetadata {
            src_mac,
            dst_mac: None,
            vlan_id: *vlan_id,
        }),
        (NexthopType::Acc, Some(DeviceRole::BridgePort { vport })) => NexthopMetadata::Acc(AccMetadata {
            src_mac,
            dst_mac: None,
            vport: vport.clone(),
        }),
        (NexthopType::Vxlan, Some(DeviceRole::VrfBridge { vrf } | DeviceRole::VrfVxlan { vrf })) => {
            let info = topology.vrf(vrf);
            NexthopMetadata::Vxlan(VxlanMetadata {
                inner_src_mac: devices.mac(&vrf_bridge(vrf)),
                inner_dst_mac: None,
                vni: info.and_then(|v| v.vni),
                local_vtep: info.and_then(|v| v.vtep_ip),
                remote_vtep: nh.key.gateway,
                underlay: None,
            })
        }
        (NexthopType::Tun, Some(DeviceRole::TunRep { sa })) => match topology.sa(sa) {
            Some(sa) => NexthopMetadata::Tun(tun_metadata(sa.spi, sa.sa_index, sa.src_ip, sa.dst_ip)),
            None => NexthopMetadata::None,
        },
        _ => NexthopMetadata::None,
    };
}

/// Host routes for neighbors learned on the SVIs of tenant VRFs.
fn add_neighbor_routes(
    routes: &mut RouteTable,
    neighbors: &NeighborTable,
    contexts: &[VrfContext],
    devices: &Devices,
    topology: &Topology,
) {
    for ctx in contexts.iter().filter(|ctx| !ctx.is_grd()) {
        let Some(table_id) = ctx.tables.first().copied() else {
            continue;
        };
        let learned = neighbors
            .values()
            .filter(|n| n.key.vrf == ctx.name && n.is_resolved())
            .filter(|n| matches!(devices.role(&n.key.dev), Some(DeviceRole::Svi { .. })));
        for neigh in learned {
            let Some(dst) = host_net(neigh.key.dst) else {
                continue;
            };
            let key = RouteKey::new(table_id, dst);
            if routes.contains_key(&key) {
                continue;
            }
            let mut nh = NexthopEntry::new(
                NexthopKey::new(ctx.name.clone(), Some(neigh.key.dst), Some(neigh.key.dev.clone())),
                NexthopType::Svi,
            );
            annotate(&mut nh, devices, topology);
            routes.insert(
                key.clone(),
                RouteEntry {
                    key,
                    vrf: ctx.name.clone(),
                    route_type: RouteType::Neighbor,
                    protocol: "neighbor".to_string(),
                    metric: 0,
                    prefsrc: None,
                    nexthops: vec![nh],
                },
            );
        }
    }
}

/// Resolves every route's nexthops, keeping only resolved ones.
///
/// The nexthop table merges identical nexthops across routes and records
/// which routes reference them; synthesized overlay nexthops reference the
/// overlay route, never the underlay route used to resolve them.
fn resolve_routes(raw: &RouteTable, resolver: &Resolver<'_>) -> (RouteTable, NexthopTable) {
    let mut routes = RouteTable::new();
    let mut nexthops = NexthopTable::new();

    for route in raw.values() {
        let resolved: Vec<NexthopEntry> = route
            .nexthops
            .iter()
            .flat_map(|nh| resolver.resolve(nh))
            .filter(|nh| nh.resolved)
            .collect();
        if resolved.is_empty() {
            trace!(route = %route.key, "Route without resolved nexthop dropped");
            continue;
        }

        for nh in &resolved {
            nexthops
                .entry(nh.key.clone())
                .or_insert_with(|| NexthopEntry {
                    route_refs: BTreeSet::new(),
                    ..nh.clone()
                })
                .route_refs
                .insert(route.key.clone());
        }
        let mut route = route.clone();
        route.nexthops = resolved
            .into_iter()
            .map(|mut nh| {
                nh.route_refs.clear();
                nh
            })
            .collect();
        routes.insert(route.key.clone(), route);
    }
    (routes, nexthops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhyPort;
    use crate::topology::{SviInfo, VrfInfo};
    use evpn_types::VlanId;
    use pretty_assertions::assert_eq;

    fn route(json: &str) -> KernelRoute {
        serde_json::from_str(json).unwrap()
    }

    fn fixture() -> (Topology, NetlinkConfig) {
        let topology = Topology {
            vrfs: vec![VrfInfo {
                name: "blue".into(),
                vni: None,
                vtep_ip: None,
                rmac: None,
                routing_tables: vec![1000],
            }],
            svis: vec![SviInfo {
                name: "blue-10".into(),
                vrf: "blue".into(),
                vlan_id: VlanId::new(10).unwrap(),
                mac: "02:00:00:00:00:10".parse().unwrap(),
            }],
            ..Default::default()
        };
        let config = NetlinkConfig {
            phy_ports: vec![PhyPort {
                name: "eth0".into(),
                vsi: 1,
            }],
            ..Default::default()
        };
        (topology, config)
    }

    #[test]
    fn test_classify_routes() {
        let (topology, config) = fixture();
        let devices = Devices::new(&topology, &config, &[]);

        let cases = [
            (r#"{"dst":"10.2.0.0/24","gateway":"192.0.2.2","dev":"br-blue","protocol":"bgp"}"#, Some(RouteType::EvpnVxlan)),
            (r#"{"dst":"10.3.0.0/24","gateway":"10.0.0.1","dev":"eth0","protocol":"bgp"}"#, Some(RouteType::Bgp)),
            (r#"{"dst":"10.0.0.0/24","dev":"eth0","protocol":"kernel","scope":"link"}"#, Some(RouteType::Connected)),
            (r#"{"dst":"0.0.0.0/0","gateway":"10.0.0.1","dev":"eth0"}"#, Some(RouteType::Static)),
            (r#"{"type":"local","dst":"10.0.0.2","dev":"eth0","protocol":"kernel"}"#, Some(RouteType::Local)),
            (r#"{"type":"blackhole","dst":"10.9.0.0/16","protocol":"static"}"#, None),
            (r#"{"type":"broadcast","dst":"10.0.0.255","dev":"eth0","protocol":"kernel"}"#, None),
        ];
        for (json, expected) in cases {
            assert_eq!(classify(&route(json), &devices), expected, "{}", json);
        }
    }

    #[test]
    fn test_duplicate_prefix_keeps_lowest_metric() {
        let (topology, config) = fixture();
        let mut state = KernelState::default();
        state.routes.insert(
            254,
            vec![
                route(r#"{"dst":"0.0.0.0/0","gateway":"10.0.0.1","dev":"eth0","metric":200}"#),
                route(r#"{"dst":"0.0.0.0/0","gateway":"10.0.0.9","dev":"eth0","metric":100}"#),
            ],
        );
        let devices = Devices::new(&topology, &config, &[]);
        let routes = collect_routes(&state, &vrf_contexts(&topology, &config), &devices, &topology);

        assert_eq!(routes.len(), 1);
        let default = routes.values().next().unwrap();
        assert_eq!(default.metric, 100);
        assert_eq!(default.nexthops[0].key.gateway, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(default.nexthops[0].nh_type, NexthopType::Phy);
    }

    #[test]
    fn test_svi_neighbors_become_host_routes() {
        let (topology, config) = fixture();
        let mut state = KernelState::default();
        state.neighbors.insert(
            "blue".into(),
            vec![
                serde_json::from_str(r#"{"dst":"10.10.0.5","dev":"vlan10","lladdr":"00:aa:00:00:00:05","state":["REACHABLE"]}"#).unwrap(),
                serde_json::from_str(r#"{"dst":"10.10.0.6","dev":"vlan10","state":["FAILED"]}"#).unwrap(),
            ],
        );
        let snapshot = build_snapshot(&state, &topology, &config);

        assert_eq!(snapshot.routes.len(), 1);
        let host = snapshot.routes.values().next().unwrap();
        assert_eq!(host.key, RouteKey::new(1000, "10.10.0.5/32".parse().unwrap()));
        assert_eq!(host.route_type, RouteType::Neighbor);
        match &host.nexthops[0].metadata {
            NexthopMetadata::Svi(m) => {
                assert_eq!(m.vlan_id.as_u16(), 10);
                assert_eq!(m.src_mac, Some("02:00:00:00:00:10".parse().unwrap()));
                assert_eq!(m.dst_mac, Some("00:aa:00:00:00:05".parse().unwrap()));
            }
            other => panic!("unexpected metadata {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_routes_are_filtered() {
        let (topology, config) = fixture();
        let mut state = KernelState::default();
        state.routes.insert(
            254,
            vec![
                route(r#"{"dst":"10.0.0.0/24","dev":"eth0","protocol":"kernel","scope":"link"}"#),
                route(r#"{"dst":"0.0.0.0/0","gateway":"10.0.0.1","dev":"eth0"}"#),
            ],
        );
        let snapshot = build_snapshot(&state, &topology, &config);

        let dsts: Vec<String> = snapshot.routes.keys().map(|k| k.dst.to_string()).collect();
        assert_eq!(dsts, vec!["10.0.0.0/24".to_string()]);
        assert_eq!(snapshot.nexthops.len(), 1);
    }
}
