//! Periodic kernel polling and change notification.

use crate::config::NetlinkConfig;
use crate::events::NetlinkEvent;
use crate::kernel::KernelSource;
use crate::snapshot::{build_snapshot, vrf_contexts, KernelState, Snapshot};
use crate::topology::{Topology, TopologyProvider};
use evpn_common::EventBus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Sizes of the published tables and the events one cycle produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub routes: usize,
    pub nexthops: usize,
    pub fdb_entries: usize,
    pub l2_nexthops: usize,
    pub events: usize,
}

pub struct NetlinkSynchronizer {
    config: NetlinkConfig,
    source: Arc<dyn KernelSource>,
    topology: Arc<dyn TopologyProvider>,
    bus: Arc<EventBus<NetlinkEvent>>,
    current: Snapshot,
}

impl NetlinkSynchronizer {
    pub fn new(
        config: NetlinkConfig,
        source: Arc<dyn KernelSource>,
        topology: Arc<dyn TopologyProvider>,
        bus: Arc<EventBus<NetlinkEvent>>,
    ) -> Self {
        Self {
            config,
            source,
            topology,
            bus,
            current: Snapshot::default(),
        }
    }

    /// Tables published by the last cycle.
    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    /// Polls the kernel once and publishes the differences to the previous
    /// cycle.
    ///
    /// A topology that cannot be read skips the cycle and keeps the
    /// current tables; a failed kernel query leaves its rows out.
    #[instrument(skip(self))]
    pub async fn cycle(&mut self) -> CycleStats {
        let topology = match self.topology.topology().await {
            Ok(topology) => topology,
            Err(e) => {
                warn!(error = %e, "Cannot read topology, skipping cycle");
                return self.stats(0);
            }
        };

        let state = self.collect(&topology).await;
        let latest = build_snapshot(&state, &topology, &self.config);
        let events = self.current.changes(&latest);
        self.current = latest;

        let count = events.len();
        self.publish(events).await;
        let stats = self.stats(count);
        debug!(?stats, "Cycle complete");
        stats
    }

    /// Polls until `cancel` fires, then runs a final cycle and withdraws
    /// everything still published.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval = ?self.config.poll_interval, "Netlink synchronizer started");
        loop {
            self.cycle().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.cycle().await;
        let events = self.current.teardown();
        info!(count = events.len(), "Withdrawing netlink state");
        self.publish(events).await;
        self.current = Snapshot::default();
        info!("Netlink synchronizer stopped");
    }

    async fn collect(&self, topology: &Topology) -> KernelState {
        let mut state = KernelState::default();

        state.links = self.source.links().await.unwrap_or_else(|e| {
            warn!(error = %e, "Link query failed");
            Vec::new()
        });

        for ctx in vrf_contexts(topology, &self.config) {
            let vrf = (!ctx.is_grd()).then_some(ctx.name.as_str());
            match self.source.neighbors(vrf).await {
                Ok(rows) => {
                    state.neighbors.insert(ctx.name.clone(), rows);
                }
                Err(e) => warn!(vrf = %ctx.name, error = %e, "Neighbor query failed"),
            }
            for table in &ctx.tables {
                match self.source.routes(*table).await {
                    Ok(rows) => {
                        state.routes.insert(*table, rows);
                    }
                    Err(e) => warn!(vrf = %ctx.name, table, error = %e, "Route query failed"),
                }
            }
        }

        state.fdb = self.source.fdb(&self.config.br_tenant).await.unwrap_or_else(|e| {
            warn!(bridge = %self.config.br_tenant, error = %e, "FDB query failed");
            Vec::new()
        });
        state
    }

    async fn publish(&self, events: Vec<NetlinkEvent>) {
        for event in events {
            let name = event.name();
            self.bus.publish(name, event).await;
        }
    }

    fn stats(&self, events: usize) -> CycleStats {
        CycleStats {
            routes: self.current.routes.len(),
            nexthops: self.current.nexthops.len(),
            fdb_entries: self.current.fdb.len(),
            l2_nexthops: self.current.l2_nexthops.len(),
            events,
        }
    }
}
