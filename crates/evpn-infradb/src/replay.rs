//! Re-synchronisation of a restarted backend component.

use crate::error::{InfraDbError, Result};
use crate::resources::{
    BridgePortSpec, IpsecSaSpec, LogicalBridgeSpec, ResourceKind, ResourceSpec, SviSpec,
    TunRepSpec, VrfSpec,
};
use crate::status::{Component, ComponentStatus, OperStatus};
use crate::store::{InfraDb, StoreTx};
use crate::task_manager::Task;
use crate::version::ResourceVersion;
use evpn_common::PRE_REPLAY;
use tracing::{info, instrument, warn};

impl InfraDb {
    /// Replays every resource `component` is subscribed to.
    ///
    /// Task dispatch is blocked for the duration of the database pass. The
    /// component's pre-replay hook runs first; then, for each resource of
    /// the component's kinds, the component and every component not already
    /// successful go back to `Pending` under a new version. The resulting
    /// tasks are queued once dispatch is unblocked, so backends that were
    /// already in sync are not notified again.
    ///
    /// Returns the number of tasks queued. A missing or failing pre-replay
    /// hook yields [`InfraDbError::ReplayAborted`].
    #[instrument(skip(self))]
    pub async fn replay(&self, component: &str) -> Result<usize> {
        info!("Replay started");
        self.tasks.block();
        let result = self.replay_pass(component).await;
        self.tasks.unblock();

        let tasks = result.inspect_err(|e| warn!(error = %e, "Replay aborted"))?;
        let count = tasks.len();
        for task in tasks {
            self.tasks.submit(task);
        }
        info!(tasks = count, "Replay finished");
        Ok(count)
    }

    async fn replay_pass(&self, component: &str) -> Result<Vec<Task>> {
        let aborted = |reason: String| InfraDbError::ReplayAborted {
            component: component.to_string(),
            reason,
        };

        self.actions
            .invoke(PRE_REPLAY, component)
            .await
            .map_err(|e| aborted(e.to_string()))?;

        let kinds: Vec<ResourceKind> = self
            .bus
            .event_types_for(component)
            .ok_or_else(|| aborted("component is not subscribed".to_string()))?
            .iter()
            .filter_map(|event| event.parse().ok())
            .collect();

        let mut kv = self.kv.lock().await;
        let mut tx = StoreTx::new(kv.as_mut());
        let mut tasks = Vec::new();
        for kind in kinds {
            match kind {
                ResourceKind::Vrf => self.replay_kind::<VrfSpec>(&mut tx, component, &mut tasks).await?,
                ResourceKind::LogicalBridge => {
                    self.replay_kind::<LogicalBridgeSpec>(&mut tx, component, &mut tasks)
                        .await?
                }
                ResourceKind::BridgePort => {
                    self.replay_kind::<BridgePortSpec>(&mut tx, component, &mut tasks)
                        .await?
                }
                ResourceKind::Svi => self.replay_kind::<SviSpec>(&mut tx, component, &mut tasks).await?,
                ResourceKind::IpsecSa => {
                    self.replay_kind::<IpsecSaSpec>(&mut tx, component, &mut tasks)
                        .await?
                }
                ResourceKind::TunRep => {
                    self.replay_kind::<TunRepSpec>(&mut tx, component, &mut tasks)
                        .await?
                }
            }
        }
        Ok(tasks)
    }

    async fn replay_kind<S: ResourceSpec>(
        &self,
        tx: &mut StoreTx<'_>,
        component: &str,
        tasks: &mut Vec<Task>,
    ) -> Result<()> {
        let subscribers: Vec<String> = self
            .bus
            .subscribers(S::KIND.as_str())
            .into_iter()
            .map(|s| s.name)
            .collect();

        for name in tx.index(S::KIND).await? {
            let Some(mut object) = tx.load::<S>(&name).await? else {
                continue;
            };

            let previous = std::mem::take(&mut object.status.components);
            object.status.components = subscribers
                .iter()
                .map(|subscriber| match previous.iter().find(|c| &c.name == subscriber) {
                    Some(c) if c.name != component && c.status == ComponentStatus::Success => c.clone(),
                    _ => Component::pending(subscriber.clone()),
                })
                .collect();

            let pending = object.status.pending_components();
            if pending.is_empty() {
                continue;
            }
            object.resource_version = ResourceVersion::next();
            if !object.is_deleting() {
                object.status.oper_status = OperStatus::Down;
            }
            tx.save(&object).await?;
            tasks.push(Task::new(S::KIND, name, object.resource_version, pending));
        }
        Ok(())
    }
}
