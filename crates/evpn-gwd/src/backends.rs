//! Backends linked into the daemon.
//!
//! Real backends (Linux networking, FRR, dataplane) run as their own
//! components; the daemon only carries an acknowledging logger that is
//! useful for bring-up and for exercising the reconciliation path.

use async_trait::async_trait;
use evpn_common::{ActionError, ActionHandler};
use evpn_infradb::{EventHandler, InfraDb, ObjectData};
use evpn_netlink::NetlinkEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Name under which the logger backend is configured.
pub const LOGGER: &str = "logger";

/// Whether a backend called `name` is linked into the daemon.
pub fn is_builtin(name: &str) -> bool {
    name == LOGGER
}

/// Acknowledges every notification after logging it.
pub struct LoggingBackend;

#[async_trait]
impl EventHandler for LoggingBackend {
    async fn handle(&self, _db: &InfraDb, object: &ObjectData) -> Result<(), String> {
        info!(
            kind = %object.kind,
            name = %object.name,
            version = %object.resource_version,
            "Resource notification"
        );
        Ok(())
    }
}

/// Pre-replay hook of a backend with nothing to reset.
pub struct ReplayReady;

#[async_trait]
impl ActionHandler for ReplayReady {
    async fn handle(&self, action: &str, component: &str) -> Result<(), ActionError> {
        info!(action, component, "Ready for replay");
        Ok(())
    }
}

/// Logs netlink events until the synchronizer drops the bus, so the
/// withdrawals sent at shutdown are still seen.
pub fn spawn_netlink_logger(mut events: mpsc::Receiver<NetlinkEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(event = event.name(), entity = ?event.entity, "Netlink event");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use evpn_netlink::{Change, NexthopEntry, NexthopKey, NexthopType, GRD};

    #[test]
    fn test_only_logger_is_builtin() {
        assert!(is_builtin(LOGGER));
        assert!(!is_builtin("frr"));
    }

    #[tokio::test]
    async fn test_netlink_logger_drains_until_closed() {
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_netlink_logger(rx);

        let key = NexthopKey::new(GRD, Some("10.0.0.1".parse().unwrap()), Some("eth0".into()));
        let nexthop = NexthopEntry::new(key, NexthopType::Phy);
        tx.send(NetlinkEvent::nexthop(Change::Added, nexthop.clone()))
            .await
            .unwrap();
        tx.send(NetlinkEvent::nexthop(Change::Deleted, nexthop))
            .await
            .unwrap();
        drop(tx);

        handle.await.unwrap();
    }
}
