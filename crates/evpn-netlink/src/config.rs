//! Synchronizer settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kernel routing table of the GRD.
pub const DEFAULT_GRD_TABLE: u32 = 254;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_RESOLVE_DEPTH: usize = 8;

/// Physical port and the dataplane port it egresses through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyPort {
    pub name: String,
    pub vsi: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkConfig {
    pub poll_interval: Duration,
    pub grd_table: u32,
    /// Bridge carrying the logical bridges.
    pub br_tenant: String,
    pub phy_ports: Vec<PhyPort>,
    /// Keep every resolved underlay path instead of the first.
    pub enable_ecmp: bool,
    /// Bound on nested underlay lookups.
    pub max_resolve_depth: usize,
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            grd_table: DEFAULT_GRD_TABLE,
            br_tenant: "br-tenant".to_string(),
            phy_ports: Vec::new(),
            enable_ecmp: true,
            max_resolve_depth: DEFAULT_MAX_RESOLVE_DEPTH,
        }
    }
}

impl NetlinkConfig {
    pub fn phy_port(&self, name: &str) -> Option<&PhyPort> {
        self.phy_ports.iter().find(|p| p.name == name)
    }
}
