//! Netlink state synchronizer of the EVPN gateway.
//!
//! Every poll interval the [`NetlinkSynchronizer`] reads routes, neighbors,
//! links and the tenant bridge FDB from the kernel, interprets them against
//! the configured [`Topology`], resolves nexthops recursively and publishes
//! what changed since the previous cycle as [`NetlinkEvent`]s.

pub mod config;
pub mod devices;
pub mod diff;
pub mod error;
pub mod events;
pub mod fdb;
pub mod kernel;
pub mod resolve;
pub mod snapshot;
pub mod sync;
pub mod topology;
pub mod types;

pub use config::{NetlinkConfig, PhyPort};
pub use error::{NetlinkError, Result};
pub use events::{Change, Entity, NetlinkEvent, ALL_EVENTS};
pub use kernel::{IpCommandSource, KernelSource};
pub use resolve::Resolver;
pub use snapshot::{build_snapshot, KernelState, Snapshot};
pub use sync::{CycleStats, NetlinkSynchronizer};
pub use topology::{Topology, TopologyProvider};
pub use types::*;
