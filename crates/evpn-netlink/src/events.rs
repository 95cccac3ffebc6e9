//! Notifications published on the netlink event bus.

use crate::types::{FdbEntry, L2NexthopEntry, NexthopEntry, RouteEntry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Added,
    Updated,
    Deleted,
}

/// The snapshot entity an event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Route(RouteEntry),
    Nexthop(NexthopEntry),
    FdbEntry(FdbEntry),
    L2Nexthop(L2NexthopEntry),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetlinkEvent {
    pub change: Change,
    pub entity: Entity,
}

/// Every event name, for subscribers interested in all of them.
pub const ALL_EVENTS: [&str; 12] = [
    "route_added",
    "route_updated",
    "route_deleted",
    "nexthop_added",
    "nexthop_updated",
    "nexthop_deleted",
    "fdb_entry_added",
    "fdb_entry_updated",
    "fdb_entry_deleted",
    "l2_nexthop_added",
    "l2_nexthop_updated",
    "l2_nexthop_deleted",
];

impl NetlinkEvent {
    pub fn route(change: Change, route: RouteEntry) -> Self {
        Self {
            change,
            entity: Entity::Route(route),
        }
    }

    pub fn nexthop(change: Change, nexthop: NexthopEntry) -> Self {
        Self {
            change,
            entity: Entity::Nexthop(nexthop),
        }
    }

    pub fn fdb_entry(change: Change, entry: FdbEntry) -> Self {
        Self {
            change,
            entity: Entity::FdbEntry(entry),
        }
    }

    pub fn l2_nexthop(change: Change, nexthop: L2NexthopEntry) -> Self {
        Self {
            change,
            entity: Entity::L2Nexthop(nexthop),
        }
    }

    /// Event type the bus routes on, e.g. `route_added`.
    pub fn name(&self) -> &'static str {
        let entity = match self.entity {
            Entity::Route(_) => 0,
            Entity::Nexthop(_) => 1,
            Entity::FdbEntry(_) => 2,
            Entity::L2Nexthop(_) => 3,
        };
        let change = match self.change {
            Change::Added => 0,
            Change::Updated => 1,
            Change::Deleted => 2,
        };
        ALL_EVENTS[entity * 3 + change]
    }
}
