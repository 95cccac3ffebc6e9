//! Kernel networking state as reported by `ip -j` and `bridge -j`.
//!
//! The row types mirror the JSON printed by iproute2 and keep fields as
//! loosely typed as the tools print them; classification into snapshot
//! entities happens in [`crate::snapshot`].

use crate::error::{NetlinkError, Result};
use async_trait::async_trait;
use evpn_common::shell::{self, BRIDGE_CMD, IP_CMD};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{trace, warn};

/// One route of `ip -j -d route show table <n>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KernelRoute {
    /// Kernel route type; absent means `unicast`.
    #[serde(rename = "type", default)]
    pub route_type: Option<String>,
    /// Prefix, host address or `default`.
    pub dst: String,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub prefsrc: Option<IpAddr>,
    #[serde(default)]
    pub metric: Option<u32>,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Multipath nexthops; empty for single-path routes.
    #[serde(default)]
    pub nexthops: Vec<KernelNexthop>,
}

impl KernelRoute {
    pub fn kind(&self) -> &str {
        self.route_type.as_deref().unwrap_or("unicast")
    }

    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or("boot")
    }
}

/// One path of a multipath route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KernelNexthop {
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// One entry of `ip -j neigh show`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KernelNeighbor {
    pub dst: IpAddr,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub lladdr: Option<String>,
    /// NUD states, e.g. `["REACHABLE"]` or `["NOARP"]`.
    #[serde(default)]
    pub state: Vec<String>,
}

/// One entry of `ip -j link show`; only what the annotator needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KernelLink {
    pub ifname: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub master: Option<String>,
}

/// One entry of `bridge -j fdb show`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KernelFdb {
    pub mac: String,
    pub ifname: String,
    #[serde(default)]
    pub vlan: Option<u16>,
    #[serde(default)]
    pub master: Option<String>,
    /// Remote VTEP of device-level entries on VXLAN ports.
    #[serde(default)]
    pub dst: Option<IpAddr>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl KernelFdb {
    /// Device-level entry of the port itself rather than of the bridge.
    pub fn is_self(&self) -> bool {
        self.flags.iter().any(|f| f == "self")
    }
}

/// Source of raw kernel state.
#[async_trait]
pub trait KernelSource: Send + Sync {
    /// IPv4 and IPv6 routes of one routing table.
    async fn routes(&self, table: u32) -> Result<Vec<KernelRoute>>;

    /// Neighbors of a VRF, or of devices outside any VRF when `vrf` is `None`.
    async fn neighbors(&self, vrf: Option<&str>) -> Result<Vec<KernelNeighbor>>;

    async fn links(&self) -> Result<Vec<KernelLink>>;

    /// FDB entries of the ports of `bridge`, including device-level entries.
    async fn fdb(&self, bridge: &str) -> Result<Vec<KernelFdb>>;
}

/// [`KernelSource`] shelling out to iproute2.
#[derive(Debug, Clone, Default)]
pub struct IpCommandSource;

impl IpCommandSource {
    pub fn new() -> Self {
        Self
    }

    async fn query<T: DeserializeOwned>(program: &str, args: &[&str]) -> Result<Vec<T>> {
        let cmd = shell::command_line(program, args);
        let output = shell::exec_checked(&cmd).await?;
        parse_rows(&cmd, &output)
    }
}

/// Parses iproute2 JSON output; empty output means no rows.
pub fn parse_rows<T: DeserializeOwned>(what: &str, output: &str) -> Result<Vec<T>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(output).map_err(|source| NetlinkError::Parse {
        what: what.to_string(),
        source,
    })
}

/// Combines the per-address-family dumps of one routing table. A family
/// whose query failed is logged and contributes no rows; the table is an
/// error only when every family failed.
pub fn merge_route_families(
    table: u32,
    dumps: Vec<(&str, Result<Vec<KernelRoute>>)>,
) -> Result<Vec<KernelRoute>> {
    let mut routes = Vec::new();
    let mut last_error = None;
    let mut succeeded = false;
    for (family, dump) in dumps {
        match dump {
            Ok(rows) => {
                succeeded = true;
                routes.extend(rows);
            }
            Err(e) => {
                warn!(table, family, error = %e, "Route query failed");
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) if !succeeded => Err(e),
        _ => Ok(routes),
    }
}

#[async_trait]
impl KernelSource for IpCommandSource {
    async fn routes(&self, table: u32) -> Result<Vec<KernelRoute>> {
        let table_arg = table.to_string();
        let mut dumps = Vec::new();
        for (family, default) in [("-4", "0.0.0.0/0"), ("-6", "::/0")] {
            let rows = Self::query::<KernelRoute>(
                IP_CMD,
                &[family, "-j", "-d", "route", "show", "table", table_arg.as_str()],
            )
            .await
            .map(|rows| {
                rows.into_iter()
                    .map(|mut route| {
                        if route.dst == "default" {
                            route.dst = default.to_string();
                        }
                        route
                    })
                    .collect::<Vec<_>>()
            });
            dumps.push((family, rows));
        }
        let routes = merge_route_families(table, dumps)?;
        trace!(table, count = routes.len(), "Routes queried");
        Ok(routes)
    }

    async fn neighbors(&self, vrf: Option<&str>) -> Result<Vec<KernelNeighbor>> {
        match vrf {
            Some(vrf) => Self::query(IP_CMD, &["-j", "neigh", "show", "vrf", vrf]).await,
            None => Self::query(IP_CMD, &["-j", "neigh", "show", "nomaster"]).await,
        }
    }

    async fn links(&self) -> Result<Vec<KernelLink>> {
        Self::query(IP_CMD, &["-j", "link", "show"]).await
    }

    async fn fdb(&self, bridge: &str) -> Result<Vec<KernelFdb>> {
        Self::query(BRIDGE_CMD, &["-j", "fdb", "show", "br", bridge]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_evpn_route() {
        let json = r#"[{"dst":"10.2.0.0/24","gateway":"192.0.2.2","dev":"br-blue","protocol":"bgp","metric":20,"flags":["onlink"]}]"#;
        let routes: Vec<KernelRoute> = parse_rows("routes", json).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].kind(), "unicast");
        assert_eq!(routes[0].protocol(), "bgp");
        assert_eq!(routes[0].gateway, Some("192.0.2.2".parse().unwrap()));
        assert_eq!(routes[0].flags, vec!["onlink".to_string()]);
    }

    #[test]
    fn test_parse_multipath_route() {
        let json = r#"[{"dst":"198.51.100.0/24","protocol":"bgp","flags":[],
            "nexthops":[{"gateway":"10.0.0.1","dev":"eth0","weight":1,"flags":[]},
                        {"gateway":"10.0.1.1","dev":"eth1","weight":1,"flags":[]}]}]"#;
        let routes: Vec<KernelRoute> = parse_rows("routes", json).unwrap();
        assert_eq!(routes[0].nexthops.len(), 2);
        assert_eq!(routes[0].nexthops[1].dev.as_deref(), Some("eth1"));
    }

    #[test]
    fn test_parse_neighbors_and_fdb() {
        let neigh = r#"[{"dst":"10.0.10.5","dev":"vlan10","lladdr":"00:aa:bb:cc:dd:ee","state":["REACHABLE"]},
                        {"dst":"10.0.10.6","dev":"vlan10","state":["FAILED"]}]"#;
        let rows: Vec<KernelNeighbor> = parse_rows("neighbors", neigh).unwrap();
        assert_eq!(rows[1].lladdr, None);

        let fdb = r#"[{"mac":"00:aa:bb:cc:dd:ee","ifname":"vxlan-10","vlan":10,"master":"br-tenant","flags":["extern_learn"],"state":""},
                      {"mac":"00:aa:bb:cc:dd:ee","ifname":"vxlan-10","dst":"192.0.2.2","flags":["self","extern_learn"],"state":""}]"#;
        let rows: Vec<KernelFdb> = parse_rows("fdb", fdb).unwrap();
        assert!(!rows[0].is_self());
        assert!(rows[1].is_self());
        assert_eq!(rows[1].dst, Some("192.0.2.2".parse().unwrap()));
    }

    #[test]
    fn test_failed_family_keeps_other_family_routes() {
        let v6: Vec<KernelRoute> =
            parse_rows("routes", r#"[{"dst":"2001:db8::/64","dev":"eth0","protocol":"kernel"}]"#).unwrap();
        let v4_failure = parse_rows::<KernelRoute>("ip -4 route", "{truncated");
        assert!(v4_failure.is_err());

        let routes = merge_route_families(254, vec![("-4", v4_failure), ("-6", Ok(v6))]).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, "2001:db8::/64");
    }

    #[test]
    fn test_all_families_failed_is_error() {
        let dumps = vec![
            ("-4", parse_rows::<KernelRoute>("ip -4 route", "{")),
            ("-6", parse_rows::<KernelRoute>("ip -6 route", "[")),
        ];
        assert!(matches!(
            merge_route_families(254, dumps),
            Err(NetlinkError::Parse { .. })
        ));
        assert!(merge_route_families(254, vec![("-4", Ok(Vec::new()))]).unwrap().is_empty());
    }

    #[test]
    fn test_empty_output_is_no_rows() {
        let rows: Vec<KernelLink> = parse_rows("links", "  \n").unwrap();
        assert!(rows.is_empty());
        assert!(parse_rows::<KernelLink>("links", "{not json").is_err());
    }
}
