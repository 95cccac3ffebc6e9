//! Device naming and the role each kernel device plays.

use crate::config::NetlinkConfig;
use crate::kernel::KernelLink;
use crate::topology::Topology;
use crate::types::{FdbType, NexthopType};
use evpn_types::{MacAddress, VlanId};
use std::collections::HashMap;

/// L3 bridge of a VRF.
pub fn vrf_bridge(vrf: &str) -> String {
    format!("br-{}", vrf)
}

/// L3 VXLAN device of a VRF.
pub fn vrf_vxlan(vrf: &str) -> String {
    format!("vxlan-{}", vrf)
}

/// VXLAN device of a logical bridge.
pub fn bridge_vxlan(vlan_id: VlanId) -> String {
    format!("vxlan-{}", vlan_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRole {
    VrfBridge { vrf: String },
    VrfVxlan { vrf: String },
    TenantBridge,
    BridgeVxlan { vlan_id: VlanId },
    Svi { vrf: String, vlan_id: VlanId, mac: MacAddress },
    Phy { egress_port: u32 },
    BridgePort { vport: Option<String> },
    TunRep { sa: String },
}

/// Roles and MAC addresses of the devices known in one cycle.
#[derive(Debug, Clone, Default)]
pub struct Devices {
    roles: HashMap<String, DeviceRole>,
    macs: HashMap<String, MacAddress>,
}

impl Devices {
    pub fn new(topology: &Topology, config: &NetlinkConfig, links: &[KernelLink]) -> Self {
        let mut roles = HashMap::new();

        roles.insert(config.br_tenant.clone(), DeviceRole::TenantBridge);
        for lb in &topology.logical_bridges {
            roles.insert(
                bridge_vxlan(lb.vlan_id),
                DeviceRole::BridgeVxlan { vlan_id: lb.vlan_id },
            );
        }
        for vrf in &topology.vrfs {
            roles.insert(vrf_bridge(&vrf.name), DeviceRole::VrfBridge { vrf: vrf.name.clone() });
            roles.insert(vrf_vxlan(&vrf.name), DeviceRole::VrfVxlan { vrf: vrf.name.clone() });
        }
        for svi in &topology.svis {
            roles.insert(
                svi.vlan_id.svi_device(),
                DeviceRole::Svi {
                    vrf: svi.vrf.clone(),
                    vlan_id: svi.vlan_id,
                    mac: svi.mac,
                },
            );
        }
        for bp in &topology.bridge_ports {
            roles.insert(
                bp.name.clone(),
                DeviceRole::BridgePort {
                    vport: bp.vport.clone(),
                },
            );
        }
        for tr in &topology.tun_reps {
            roles.insert(tr.name.clone(), DeviceRole::TunRep { sa: tr.sa.clone() });
        }
        for port in &config.phy_ports {
            roles.insert(port.name.clone(), DeviceRole::Phy { egress_port: port.vsi });
        }

        let mut macs: HashMap<String, MacAddress> = links
            .iter()
            .filter_map(|link| {
                let mac = link.address.as_deref()?.parse().ok()?;
                Some((link.ifname.clone(), mac))
            })
            .collect();
        for vrf in &topology.vrfs {
            if let Some(rmac) = vrf.rmac {
                macs.insert(vrf_bridge(&vrf.name), rmac);
            }
        }
        for bp in &topology.bridge_ports {
            macs.insert(bp.name.clone(), bp.mac);
        }

        Self { roles, macs }
    }

    pub fn role(&self, dev: &str) -> Option<&DeviceRole> {
        self.roles.get(dev)
    }

    /// Configured MAC of a device, or the one the kernel reports.
    pub fn mac(&self, dev: &str) -> Option<MacAddress> {
        match self.roles.get(dev) {
            Some(DeviceRole::Svi { mac, .. }) => Some(*mac),
            _ => self.macs.get(dev).copied(),
        }
    }

    pub fn nexthop_type(&self, dev: Option<&str>) -> NexthopType {
        match dev.and_then(|d| self.roles.get(d)) {
            Some(DeviceRole::VrfBridge { .. } | DeviceRole::VrfVxlan { .. }) => NexthopType::Vxlan,
            Some(DeviceRole::Phy { .. }) => NexthopType::Phy,
            Some(DeviceRole::Svi { .. }) => NexthopType::Svi,
            Some(DeviceRole::TunRep { .. }) => NexthopType::Tun,
            Some(DeviceRole::BridgePort { .. }) => NexthopType::Acc,
            _ => NexthopType::Other,
        }
    }

    pub fn fdb_type(&self, dev: &str) -> FdbType {
        match self.roles.get(dev) {
            Some(DeviceRole::BridgeVxlan { .. }) => FdbType::Vxlan,
            Some(DeviceRole::BridgePort { .. }) => FdbType::BridgePort,
            Some(DeviceRole::Phy { .. }) => FdbType::Phy,
            _ => FdbType::Other,
        }
    }

    /// Whether routes through `dev` were learned over EVPN.
    pub fn is_evpn_device(&self, dev: &str) -> bool {
        matches!(
            self.roles.get(dev),
            Some(DeviceRole::VrfBridge { .. } | DeviceRole::VrfVxlan { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhyPort;
    use crate::topology::{SviInfo, VrfInfo};
    use pretty_assertions::assert_eq;

    fn topology() -> Topology {
        Topology {
            vrfs: vec![VrfInfo {
                name: "blue".into(),
                vni: None,
                vtep_ip: None,
                rmac: Some("02:00:00:00:00:0b".parse().unwrap()),
                routing_tables: vec![1000],
            }],
            svis: vec![SviInfo {
                name: "blue-10".into(),
                vrf: "blue".into(),
                vlan_id: VlanId::new(10).unwrap(),
                mac: "02:00:00:00:00:10".parse().unwrap(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_roles_from_names() {
        let config = NetlinkConfig {
            phy_ports: vec![PhyPort {
                name: "eth0".into(),
                vsi: 7,
            }],
            ..Default::default()
        };
        let links = vec![
            KernelLink {
                ifname: "eth0".into(),
                address: Some("00:00:5e:00:53:01".into()),
                master: None,
            },
            KernelLink {
                ifname: "br-blue".into(),
                address: Some("00:00:5e:00:53:99".into()),
                master: Some("blue".into()),
            },
        ];
        let devices = Devices::new(&topology(), &config, &links);

        assert_eq!(devices.nexthop_type(Some("br-blue")), NexthopType::Vxlan);
        assert_eq!(devices.nexthop_type(Some("vxlan-blue")), NexthopType::Vxlan);
        assert_eq!(devices.nexthop_type(Some("vlan10")), NexthopType::Svi);
        assert_eq!(devices.nexthop_type(Some("eth0")), NexthopType::Phy);
        assert_eq!(devices.nexthop_type(Some("lo")), NexthopType::Other);
        assert_eq!(devices.nexthop_type(None), NexthopType::Other);
        assert_eq!(devices.role("eth0"), Some(&DeviceRole::Phy { egress_port: 7 }));

        // Router MAC overrides the kernel's bridge address.
        assert_eq!(devices.mac("br-blue"), Some("02:00:00:00:00:0b".parse().unwrap()));
        assert_eq!(devices.mac("vlan10"), Some("02:00:00:00:00:10".parse().unwrap()));
        assert_eq!(devices.mac("eth0"), Some("00:00:5e:00:53:01".parse().unwrap()));
        assert_eq!(devices.fdb_type("br-tenant"), FdbType::Other);
    }
}
