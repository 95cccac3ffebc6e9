//! Bridge FDB entries and the L2 nexthops they share.

use crate::devices::{DeviceRole, Devices};
use crate::kernel::KernelFdb;
use crate::resolve::Resolver;
use crate::topology::Topology;
use crate::types::{FdbEntry, FdbKey, FdbType, L2NexthopEntry, L2NexthopKey, L2NexthopMetadata};
use evpn_types::{MacAddress, VlanId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::trace;

pub type FdbTable = BTreeMap<FdbKey, FdbEntry>;
pub type L2NexthopTable = BTreeMap<L2NexthopKey, L2NexthopEntry>;

/// Builds the FDB and L2 nexthop tables from `bridge fdb show` rows.
///
/// VXLAN ports print the remote VTEP on their device-level entry, not on
/// the VLAN-scoped bridge entry, so the two are paired by (port, MAC).
pub fn collect_fdb(
    rows: &[KernelFdb],
    devices: &Devices,
    topology: &Topology,
    resolver: &Resolver<'_>,
) -> (FdbTable, L2NexthopTable) {
    let remotes: HashMap<(&str, &str), IpAddr> = rows
        .iter()
        .filter(|row| row.is_self())
        .filter_map(|row| Some(((row.ifname.as_str(), row.mac.as_str()), row.dst?)))
        .collect();

    let mut fdb = FdbTable::new();
    let mut l2_nexthops = L2NexthopTable::new();

    for row in rows.iter().filter(|row| !row.is_self() && row.master.is_some()) {
        if row.state.as_deref() == Some("permanent") {
            continue;
        }
        let Some(vlan_id) = row.vlan.and_then(|v| VlanId::new(v).ok()) else {
            continue;
        };
        let Ok(mac) = row.mac.parse::<MacAddress>() else {
            trace!(mac = %row.mac, "Unparsable FDB MAC");
            continue;
        };
        if !mac.is_forwardable() {
            continue;
        }

        let fdb_type = devices.fdb_type(&row.ifname);
        let dst = match fdb_type {
            FdbType::Other => continue,
            FdbType::Vxlan => match remotes.get(&(row.ifname.as_str(), row.mac.as_str())) {
                Some(dst) => Some(*dst),
                None => {
                    trace!(mac = %mac, dev = %row.ifname, "VXLAN FDB entry without remote");
                    continue;
                }
            },
            FdbType::BridgePort | FdbType::Phy => None,
        };

        let nh_key = L2NexthopKey {
            dev: row.ifname.clone(),
            vlan_id,
            dst,
        };
        if !l2_nexthops.contains_key(&nh_key) {
            let Some(metadata) = l2_metadata(&nh_key, fdb_type, devices, topology, resolver) else {
                trace!(l2_nexthop = %nh_key, "L2 nexthop unresolved");
                continue;
            };
            l2_nexthops.insert(
                nh_key.clone(),
                L2NexthopEntry {
                    key: nh_key.clone(),
                    fdb_type,
                    fdb_refs: BTreeSet::new(),
                    metadata,
                },
            );
        }

        let key = FdbKey { vlan_id, mac };
        if let Some(nh) = l2_nexthops.get_mut(&nh_key) {
            nh.fdb_refs.insert(key);
        }
        if let Some(previous) = fdb.insert(
            key,
            FdbEntry {
                key,
                dev: row.ifname.clone(),
                fdb_type,
                l2_nexthop: nh_key,
            },
        ) {
            // MAC moved between ports within one dump; the later row wins.
            if let Some(nh) = l2_nexthops.get_mut(&previous.l2_nexthop) {
                nh.fdb_refs.remove(&key);
            }
        }
    }

    l2_nexthops.retain(|_, nh| !nh.fdb_refs.is_empty());
    (fdb, l2_nexthops)
}

fn l2_metadata(
    key: &L2NexthopKey,
    fdb_type: FdbType,
    devices: &Devices,
    topology: &Topology,
    resolver: &Resolver<'_>,
) -> Option<L2NexthopMetadata> {
    match fdb_type {
        FdbType::Vxlan => {
            let remote_vtep = key.dst?;
            let lb = topology.logical_bridge_by_vlan(key.vlan_id);
            let underlay = resolver
                .resolve_underlay(remote_vtep)
                .into_iter()
                .find_map(|nh| nh.metadata.as_underlay())?;
            Some(L2NexthopMetadata::Vxlan {
                vni: lb.and_then(|lb| lb.vni),
                local_vtep: lb.and_then(|lb| lb.vtep_ip),
                remote_vtep,
                underlay: Some(underlay),
            })
        }
        FdbType::BridgePort => match devices.role(&key.dev) {
            Some(DeviceRole::BridgePort { vport }) => Some(L2NexthopMetadata::BridgePort {
                vport: vport.clone(),
            }),
            _ => None,
        },
        FdbType::Phy => match devices.role(&key.dev) {
            Some(DeviceRole::Phy { egress_port }) => Some(L2NexthopMetadata::Phy {
                egress_port: *egress_port,
            }),
            _ => None,
        },
        FdbType::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetlinkConfig, PhyPort};
    use crate::topology::{BridgePortInfo, LogicalBridgeInfo};
    use crate::types::{
        NeighborEntry, NeighborKey, NeighborState, NexthopEntry, NexthopKey, NexthopMetadata,
        NexthopType, PhyMetadata, RouteEntry, RouteKey, RouteType, Underlay, GRD,
    };
    use evpn_infradb::BridgePortType;
    use pretty_assertions::assert_eq;

    fn row(mac: &str, ifname: &str, vlan: Option<u16>, self_entry: bool, dst: Option<&str>) -> KernelFdb {
        KernelFdb {
            mac: mac.into(),
            ifname: ifname.into(),
            vlan,
            master: if self_entry { None } else { Some("br-tenant".into()) },
            dst: dst.map(|d| d.parse().unwrap()),
            flags: if self_entry { vec!["self".into()] } else { vec![] },
            state: None,
        }
    }

    fn fixture() -> (Topology, NetlinkConfig) {
        let vlan = VlanId::new(10).unwrap();
        let topology = Topology {
            logical_bridges: vec![LogicalBridgeInfo {
                name: "lb10".into(),
                vlan_id: vlan,
                vni: Some(evpn_types::Vni::new(10010).unwrap()),
                vtep_ip: Some("198.51.100.1".parse().unwrap()),
            }],
            bridge_ports: vec![BridgePortInfo {
                name: "bp1".into(),
                mac: "02:00:00:00:01:01".parse().unwrap(),
                port_type: BridgePortType::Access,
                vport: Some("vport-1".into()),
            }],
            ..Default::default()
        };
        let config = NetlinkConfig {
            phy_ports: vec![PhyPort {
                name: "eth0".into(),
                vsi: 3,
            }],
            ..Default::default()
        };
        (topology, config)
    }

    fn underlay_tables() -> (BTreeMap<RouteKey, RouteEntry>, BTreeMap<NeighborKey, NeighborEntry>) {
        let mut hop = NexthopEntry::new(
            NexthopKey::new(GRD, Some("10.0.0.1".parse().unwrap()), Some("eth0".into())),
            NexthopType::Phy,
        );
        hop.metadata = NexthopMetadata::Phy(PhyMetadata {
            src_mac: None,
            dst_mac: None,
            egress_port: 3,
        });
        let route = RouteEntry {
            key: RouteKey::new(254, "192.0.2.0/24".parse().unwrap()),
            vrf: GRD.into(),
            route_type: RouteType::Static,
            protocol: "static".into(),
            metric: 0,
            prefsrc: None,
            nexthops: vec![hop],
        };
        let neigh = NeighborEntry {
            key: NeighborKey {
                dst: "10.0.0.1".parse().unwrap(),
                vrf: GRD.into(),
                dev: "eth0".into(),
            },
            lladdr: Some("00:00:5e:00:53:01".parse().unwrap()),
            state: NeighborState::Reachable,
        };
        (
            BTreeMap::from([(route.key.clone(), route)]),
            BTreeMap::from([(neigh.key.clone(), neigh)]),
        )
    }

    #[test]
    fn test_vxlan_entries_share_l2_nexthop() {
        let (topology, config) = fixture();
        let devices = Devices::new(&topology, &config, &[]);
        let (routes, neighbors) = underlay_tables();
        let resolver = Resolver::new(&routes, &neighbors, &config);

        let rows = vec![
            row("00:aa:00:00:00:01", "vxlan-10", Some(10), false, None),
            row("00:aa:00:00:00:01", "vxlan-10", None, true, Some("192.0.2.2")),
            row("00:aa:00:00:00:02", "vxlan-10", Some(10), false, None),
            row("00:aa:00:00:00:02", "vxlan-10", None, true, Some("192.0.2.2")),
            // No remote known.
            row("00:aa:00:00:00:03", "vxlan-10", Some(10), false, None),
        ];
        let (fdb, l2) = collect_fdb(&rows, &devices, &topology, &resolver);

        assert_eq!(fdb.len(), 2);
        assert_eq!(l2.len(), 1);
        let nh = l2.values().next().unwrap();
        assert_eq!(nh.fdb_refs.len(), 2);
        match &nh.metadata {
            L2NexthopMetadata::Vxlan { vni, remote_vtep, underlay, .. } => {
                assert_eq!(vni.map(|v| v.as_u32()), Some(10010));
                assert_eq!(*remote_vtep, "192.0.2.2".parse::<IpAddr>().unwrap());
                assert!(matches!(underlay, Some(Underlay::Phy(p)) if p.egress_port == 3));
            }
            other => panic!("unexpected metadata {:?}", other),
        }
    }

    #[test]
    fn test_uninteresting_entries_are_skipped() {
        let (topology, config) = fixture();
        let devices = Devices::new(&topology, &config, &[]);
        let (routes, neighbors) = (BTreeMap::new(), BTreeMap::new());
        let resolver = Resolver::new(&routes, &neighbors, &config);

        let mut permanent = row("00:aa:00:00:00:04", "bp1", Some(10), false, None);
        permanent.state = Some("permanent".into());
        let rows = vec![
            row("00:aa:00:00:00:01", "bp1", Some(10), false, None),
            row("00:aa:00:00:00:02", "eth0", Some(10), false, None),
            row("00:aa:00:00:00:03", "veth9", Some(10), false, None),
            row("00:aa:00:00:00:05", "bp1", None, false, None),
            row("33:33:00:00:00:01", "bp1", Some(10), false, None),
            permanent,
            // Underlay cannot be resolved without routes.
            row("00:aa:00:00:00:06", "vxlan-10", Some(10), false, None),
            row("00:aa:00:00:00:06", "vxlan-10", None, true, Some("192.0.2.2")),
        ];
        let (fdb, l2) = collect_fdb(&rows, &devices, &topology, &resolver);

        let types: Vec<FdbType> = fdb.values().map(|e| e.fdb_type).collect();
        assert_eq!(types, vec![FdbType::BridgePort, FdbType::Phy]);
        assert_eq!(l2.len(), 2);
        let bp = l2.values().find(|nh| nh.fdb_type == FdbType::BridgePort).unwrap();
        assert_eq!(
            bp.metadata,
            L2NexthopMetadata::BridgePort {
                vport: Some("vport-1".into())
            }
        );
    }
}
