//! The resource store.
//!
//! All operations run inside one critical section guarded by a single
//! async mutex around the key/value backend. Version checks of status
//! callbacks happen inside that same section, so a callback can never
//! interleave with the mutation that made it stale.
//!
//! Persistence layout:
//!
//! | key | value |
//! |-----|-------|
//! | `<kind>/<name>` | JSON resource |
//! | `index/<kind>` | JSON array of resource names |
//! | `refs/<kind>/<name>` | JSON array of `<kind>/<name>` dependents |

use crate::error::{InfraDbError, Result};
use crate::resources::{
    BridgePortSpec, IpsecSaSpec, LogicalBridgeSpec, Metadata, ObjectRef, Resource, ResourceKind,
    ResourceSpec, SviSpec, TunRepSpec, VrfSpec,
};
use crate::status::{Component, ComponentStatus, OperStatus, ResourceStatus};
use crate::task_manager::{ObjectData, Task, TaskManager, TaskManagerHandle, TaskOutcome};
use crate::version::ResourceVersion;
use evpn_common::{ActionBus, Backoff, EventBus, KvStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Versioned resource store with per-backend status tracking.
pub struct InfraDb {
    pub(crate) kv: Mutex<Box<dyn KvStore>>,
    pub(crate) bus: Arc<EventBus<ObjectData>>,
    pub(crate) actions: Arc<ActionBus>,
    pub(crate) tasks: TaskManagerHandle,
    backoff: Backoff,
}

impl InfraDb {
    /// Creates the store over `kv` together with its task manager worker,
    /// which the caller drives with [`TaskManager::run`].
    pub fn new(kv: Box<dyn KvStore>, backoff: Backoff) -> (Arc<Self>, TaskManager) {
        let bus = Arc::new(EventBus::new());
        let (manager, tasks) = TaskManager::new(Arc::clone(&bus), backoff);
        let db = Arc::new(Self {
            kv: Mutex::new(kv),
            bus,
            actions: Arc::new(ActionBus::new()),
            tasks,
            backoff,
        });
        (db, manager)
    }

    /// Desired-state event bus; subscribers register here.
    pub fn bus(&self) -> &Arc<EventBus<ObjectData>> {
        &self.bus
    }

    /// Action hooks (pre-replay) of backend components.
    pub fn actions(&self) -> &Arc<ActionBus> {
        &self.actions
    }

    pub fn task_manager(&self) -> &TaskManagerHandle {
        &self.tasks
    }

    /// Stores a new resource.
    ///
    /// Every current subscriber of the kind starts `Pending` and a task is
    /// queued for them; a kind without subscribers is `Up` at once.
    #[instrument(skip_all, fields(kind = %S::KIND, name = %resource.name))]
    pub async fn create<S: ResourceSpec>(&self, resource: Resource<S>) -> Result<Resource<S>> {
        let mut kv = self.kv.lock().await;
        let mut tx = StoreTx::new(kv.as_mut());

        let me = resource.object_ref();
        if tx.exists(&me).await? {
            return Err(InfraDbError::AlreadyExists {
                kind: S::KIND,
                name: resource.name,
            });
        }
        let dependencies = resource.spec.dependencies();
        tx.check_dependencies(&me, &dependencies).await?;

        let object = Resource {
            status: self.initial_status(S::KIND, OperStatus::Down),
            metadata: S::Metadata::default(),
            resource_version: ResourceVersion::next(),
            ..resource
        };

        tx.save(&object).await?;
        tx.index_insert(S::KIND, &object.name).await?;
        for dependency in &dependencies {
            tx.refs_insert(dependency, &me).await?;
        }
        self.submit(&object);

        info!(version = %object.resource_version, "Resource created");
        Ok(object)
    }

    /// Replaces the spec of an existing resource.
    ///
    /// Backend metadata is kept; status is reset as for a create.
    #[instrument(skip_all, fields(kind = %S::KIND, name = %resource.name))]
    pub async fn update<S: ResourceSpec>(&self, resource: Resource<S>) -> Result<Resource<S>> {
        let mut kv = self.kv.lock().await;
        let mut tx = StoreTx::new(kv.as_mut());

        let current = tx.load_existing::<S>(&resource.name).await?;
        if current.is_deleting() {
            return Err(InfraDbError::PendingDeletion {
                kind: S::KIND,
                name: resource.name,
            });
        }

        let me = resource.object_ref();
        let old_deps: BTreeSet<ObjectRef> = current.spec.dependencies().into_iter().collect();
        let new_deps: BTreeSet<ObjectRef> = resource.spec.dependencies().into_iter().collect();
        let added: Vec<ObjectRef> = new_deps.difference(&old_deps).cloned().collect();
        tx.check_dependencies(&me, &added).await?;

        let object = Resource {
            status: self.initial_status(S::KIND, OperStatus::Down),
            metadata: current.metadata,
            resource_version: ResourceVersion::next(),
            ..resource
        };

        tx.save(&object).await?;
        for dependency in old_deps.difference(&new_deps) {
            tx.refs_remove(dependency, &me).await?;
        }
        for dependency in &added {
            tx.refs_insert(dependency, &me).await?;
        }
        self.submit(&object);

        info!(version = %object.resource_version, "Resource updated");
        Ok(object)
    }

    /// Requests deletion.
    ///
    /// The resource stays in the store as `ToBeDeleted` until every
    /// component reports success for the new version. Fails with
    /// [`InfraDbError::InUse`] while other resources depend on it.
    #[instrument(skip(self), fields(kind = %S::KIND))]
    pub async fn delete<S: ResourceSpec>(&self, name: &str) -> Result<()> {
        let mut kv = self.kv.lock().await;
        let mut tx = StoreTx::new(kv.as_mut());

        let mut object = tx.load_existing::<S>(name).await?;
        let me = object.object_ref();
        let dependents = tx.dependents(&me).await?;
        if !dependents.is_empty() {
            return Err(InfraDbError::InUse {
                kind: S::KIND,
                name: name.to_string(),
                dependents: dependents.into_iter().collect(),
            });
        }

        object.status = self.initial_status(S::KIND, OperStatus::ToBeDeleted);
        if object.status.components.is_empty() {
            tx.purge(&object).await?;
            info!("Resource removed, no subscribers");
            return Ok(());
        }

        object.resource_version = ResourceVersion::next();
        tx.save(&object).await?;
        self.submit(&object);

        info!(version = %object.resource_version, "Resource marked for deletion");
        Ok(())
    }

    pub async fn get<S: ResourceSpec>(&self, name: &str) -> Result<Resource<S>> {
        let mut kv = self.kv.lock().await;
        StoreTx::new(kv.as_mut()).load_existing::<S>(name).await
    }

    /// All resources of a kind, ordered by name.
    pub async fn list<S: ResourceSpec>(&self) -> Result<Vec<Resource<S>>> {
        let mut kv = self.kv.lock().await;
        let mut tx = StoreTx::new(kv.as_mut());

        let mut objects = Vec::new();
        for name in tx.index(S::KIND).await? {
            match tx.load::<S>(&name).await? {
                Some(object) => objects.push(object),
                None => warn!(kind = %S::KIND, name = %name, "Indexed resource missing"),
            }
        }
        Ok(objects)
    }

    /// Records a component's status for one resource version.
    ///
    /// Callbacks for a missing object or quoting a version other than the
    /// stored one change nothing: they are logged, the task manager is told
    /// to drop the dispatch, and `Ok(())` is returned. A `Pending` report
    /// parks the dispatch, so the component is invoked again after its retry
    /// delay (the backoff base unless it names one). When the last
    /// component reaches success the resource becomes `Up`, or is removed
    /// if it was being deleted.
    #[instrument(skip(self, metadata, component), fields(kind = %S::KIND, component = %component.name, status = %component.status))]
    pub async fn update_status<S: ResourceSpec>(
        &self,
        name: &str,
        resource_version: ResourceVersion,
        notification_id: Uuid,
        metadata: Option<S::Metadata>,
        component: Component,
    ) -> Result<()> {
        let mut kv = self.kv.lock().await;
        let mut tx = StoreTx::new(kv.as_mut());

        match self
            .apply_status::<S>(&mut tx, name, resource_version, metadata, component)
            .await
        {
            Ok(outcome) => {
                self.tasks.report(notification_id, outcome);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Status update failed");
                self.tasks.report(
                    notification_id,
                    TaskOutcome::Error {
                        retry_delay: self.backoff.base,
                    },
                );
                Err(e)
            }
        }
    }

    async fn apply_status<S: ResourceSpec>(
        &self,
        tx: &mut StoreTx<'_>,
        name: &str,
        resource_version: ResourceVersion,
        metadata: Option<S::Metadata>,
        mut component: Component,
    ) -> Result<TaskOutcome> {
        let Some(mut object) = tx.load::<S>(name).await? else {
            debug!("Status for missing resource dropped");
            return Ok(TaskOutcome::Drop);
        };
        if object.resource_version != resource_version {
            debug!(
                stored = %object.resource_version,
                reported = %resource_version,
                "Stale status dropped"
            );
            return Ok(TaskOutcome::Drop);
        }
        let Some(slot) = object
            .status
            .components
            .iter_mut()
            .find(|c| c.name == component.name)
        else {
            warn!("Status from a component not tracked on this resource");
            return Ok(TaskOutcome::Drop);
        };

        let outcome = match component.status {
            ComponentStatus::Success => {
                component.retry_delay = Duration::ZERO;
                TaskOutcome::Success
            }
            ComponentStatus::Error => {
                if component.retry_delay.is_zero() {
                    component.retry_delay = self.backoff.next(slot.retry_delay);
                }
                TaskOutcome::Error {
                    retry_delay: component.retry_delay,
                }
            }
            // Not done yet: invoke the component again once the delay passes.
            ComponentStatus::Pending | ComponentStatus::Unspecified => {
                if component.retry_delay.is_zero() {
                    component.retry_delay = self.backoff.base;
                }
                TaskOutcome::Error {
                    retry_delay: component.retry_delay,
                }
            }
        };
        *slot = component;
        if let Some(metadata) = metadata {
            object.metadata.merge(metadata);
        }

        if object.status.all_succeeded() {
            if object.is_deleting() {
                tx.purge(&object).await?;
                info!(version = %resource_version, "Resource removed");
                return Ok(outcome);
            }
            object.status.oper_status = OperStatus::Up;
            info!(version = %resource_version, "Resource up");
        } else if !object.is_deleting() {
            object.status.oper_status = OperStatus::Down;
        }
        tx.save(&object).await?;
        Ok(outcome)
    }

    /// [`Self::update_status`] without metadata, for callers that only hold
    /// the [`ObjectData`] of a dispatch.
    pub async fn report_component_status(
        &self,
        object: &ObjectData,
        component: Component,
    ) -> Result<()> {
        let (name, version, id) = (&object.name, object.resource_version, object.notification_id);
        match object.kind {
            ResourceKind::Vrf => self.update_status::<VrfSpec>(name, version, id, None, component).await,
            ResourceKind::LogicalBridge => {
                self.update_status::<LogicalBridgeSpec>(name, version, id, None, component)
                    .await
            }
            ResourceKind::BridgePort => {
                self.update_status::<BridgePortSpec>(name, version, id, None, component)
                    .await
            }
            ResourceKind::Svi => self.update_status::<SviSpec>(name, version, id, None, component).await,
            ResourceKind::IpsecSa => {
                self.update_status::<IpsecSaSpec>(name, version, id, None, component)
                    .await
            }
            ResourceKind::TunRep => {
                self.update_status::<TunRepSpec>(name, version, id, None, component)
                    .await
            }
        }
    }

    /// Tells the task manager a dispatch needs no further handling.
    pub fn drop_task(&self, notification_id: Uuid) {
        self.tasks.report(notification_id, TaskOutcome::Drop);
    }

    /// Stored version of any resource, without knowing its spec type.
    pub async fn current_version(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ResourceVersion>> {
        #[derive(Deserialize)]
        struct VersionProbe {
            resource_version: ResourceVersion,
        }

        let mut kv = self.kv.lock().await;
        let probe: Option<VersionProbe> = StoreTx::new(kv.as_mut())
            .read(&object_key(&ObjectRef::new(kind, name)))
            .await?;
        Ok(probe.map(|p| p.resource_version))
    }

    fn initial_status(&self, kind: ResourceKind, oper_status: OperStatus) -> ResourceStatus {
        let components: Vec<Component> = self
            .bus
            .subscribers(kind.as_str())
            .into_iter()
            .map(|s| Component::pending(s.name))
            .collect();
        let oper_status = if components.is_empty() && oper_status == OperStatus::Down {
            OperStatus::Up
        } else {
            oper_status
        };
        ResourceStatus {
            oper_status,
            components,
        }
    }

    fn submit<S: ResourceSpec>(&self, object: &Resource<S>) {
        let subscribers = object.status.pending_components();
        if subscribers.is_empty() {
            return;
        }
        self.tasks.submit(Task::new(
            S::KIND,
            object.name.clone(),
            object.resource_version,
            subscribers,
        ));
    }
}

fn object_key(object: &ObjectRef) -> String {
    object.to_string()
}

fn index_key(kind: ResourceKind) -> String {
    format!("index/{}", kind)
}

fn refs_key(object: &ObjectRef) -> String {
    format!("refs/{}", object)
}

/// Typed access to the key/value backend while the store lock is held.
pub(crate) struct StoreTx<'a> {
    kv: &'a mut dyn KvStore,
}

impl<'a> StoreTx<'a> {
    pub(crate) fn new(kv: &'a mut dyn KvStore) -> Self {
        Self { kv }
    }

    async fn read<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kv.set(key, bytes).await?;
        Ok(())
    }

    async fn read_set(&mut self, key: &str) -> Result<BTreeSet<String>> {
        Ok(self.read(key).await?.unwrap_or_default())
    }

    async fn write_set(&mut self, key: &str, set: &BTreeSet<String>) -> Result<()> {
        if set.is_empty() {
            self.kv.delete(key).await?;
            Ok(())
        } else {
            self.write(key, set).await
        }
    }

    pub(crate) async fn load<S: ResourceSpec>(&mut self, name: &str) -> Result<Option<Resource<S>>> {
        self.read(&object_key(&ObjectRef::new(S::KIND, name))).await
    }

    async fn load_existing<S: ResourceSpec>(&mut self, name: &str) -> Result<Resource<S>> {
        self.load::<S>(name)
            .await?
            .ok_or_else(|| InfraDbError::KeyNotFound {
                kind: S::KIND,
                name: name.to_string(),
            })
    }

    pub(crate) async fn save<S: ResourceSpec>(&mut self, object: &Resource<S>) -> Result<()> {
        self.write(&object_key(&object.object_ref()), object).await
    }

    async fn exists(&mut self, object: &ObjectRef) -> Result<bool> {
        Ok(self.kv.get(&object_key(object)).await?.is_some())
    }

    pub(crate) async fn index(&mut self, kind: ResourceKind) -> Result<BTreeSet<String>> {
        self.read_set(&index_key(kind)).await
    }

    async fn index_insert(&mut self, kind: ResourceKind, name: &str) -> Result<()> {
        let key = index_key(kind);
        let mut names = self.read_set(&key).await?;
        if names.insert(name.to_string()) {
            self.write_set(&key, &names).await?;
        }
        Ok(())
    }

    async fn index_remove(&mut self, kind: ResourceKind, name: &str) -> Result<()> {
        let key = index_key(kind);
        let mut names = self.read_set(&key).await?;
        if names.remove(name) {
            self.write_set(&key, &names).await?;
        }
        Ok(())
    }

    async fn dependents(&mut self, object: &ObjectRef) -> Result<BTreeSet<String>> {
        self.read_set(&refs_key(object)).await
    }

    async fn refs_insert(&mut self, dependency: &ObjectRef, dependent: &ObjectRef) -> Result<()> {
        let key = refs_key(dependency);
        let mut refs = self.read_set(&key).await?;
        if refs.insert(dependent.to_string()) {
            self.write_set(&key, &refs).await?;
        }
        Ok(())
    }

    async fn refs_remove(&mut self, dependency: &ObjectRef, dependent: &ObjectRef) -> Result<()> {
        let key = refs_key(dependency);
        let mut refs = self.read_set(&key).await?;
        if refs.remove(&dependent.to_string()) {
            self.write_set(&key, &refs).await?;
        }
        Ok(())
    }

    /// Every dependency must exist and must not be on its way out.
    async fn check_dependencies(&mut self, me: &ObjectRef, dependencies: &[ObjectRef]) -> Result<()> {
        #[derive(Deserialize)]
        struct StatusProbe {
            #[serde(default)]
            status: ResourceStatus,
        }

        for dependency in dependencies {
            let probe: Option<StatusProbe> = self.read(&object_key(dependency)).await?;
            match probe {
                None => {
                    return Err(InfraDbError::DependencyMissing {
                        kind: me.kind,
                        name: me.name.clone(),
                        dependency: dependency.to_string(),
                    })
                }
                Some(probe) if probe.status.oper_status == OperStatus::ToBeDeleted => {
                    return Err(InfraDbError::PendingDeletion {
                        kind: dependency.kind,
                        name: dependency.name.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Physically removes a resource and its index and reference entries.
    async fn purge<S: ResourceSpec>(&mut self, object: &Resource<S>) -> Result<()> {
        let me = object.object_ref();
        self.kv.delete(&object_key(&me)).await?;
        self.kv.delete(&refs_key(&me)).await?;
        self.index_remove(S::KIND, &object.name).await?;
        for dependency in object.spec.dependencies() {
            self.refs_remove(&dependency, &me).await?;
        }
        Ok(())
    }
}
