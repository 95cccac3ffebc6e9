//! Worker loop binding a backend implementation to its subscriber channel.

use crate::status::Component;
use crate::store::InfraDb;
use crate::task_manager::ObjectData;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A backend reconciling resources it is notified about.
///
/// `handle` is called with the [`ObjectData`] of each dispatch once the
/// object is confirmed to still be at the notified version; it re-fetches
/// the object from the store and configures its backend. `Err` carries the
/// detail recorded on the component. Backends that contribute metadata
/// report through [`InfraDb::update_status`] from their own worker instead.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, db: &InfraDb, object: &ObjectData) -> Result<(), String>;
}

/// Spawns the worker serving subscriber `name`.
///
/// Notifications for objects that changed or disappeared since dispatch are
/// dropped without invoking the handler.
pub fn spawn_handler(
    db: Arc<InfraDb>,
    name: impl Into<String>,
    mut events: mpsc::Receiver<ObjectData>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let name = name.into();
    tokio::spawn(async move {
        info!(subscriber = %name, "Handler started");
        loop {
            let object = tokio::select! {
                _ = cancel.cancelled() => break,
                object = events.recv() => match object {
                    Some(object) => object,
                    None => break,
                },
            };

            match db.current_version(object.kind, &object.name).await {
                Ok(Some(version)) if version == object.resource_version => {}
                Ok(current) => {
                    debug!(
                        subscriber = %name,
                        kind = %object.kind,
                        name = %object.name,
                        notified = %object.resource_version,
                        current = ?current,
                        "Notification outdated"
                    );
                    db.drop_task(object.notification_id);
                    continue;
                }
                Err(e) => warn!(subscriber = %name, error = %e, "Version check failed"),
            }

            let component = match handler.handle(&db, &object).await {
                Ok(()) => Component::success(name.clone()),
                Err(details) => {
                    warn!(subscriber = %name, kind = %object.kind, name = %object.name, details = %details, "Backend failed");
                    Component::error(name.clone(), details)
                }
            };
            if let Err(e) = db.report_component_status(&object, component).await {
                warn!(subscriber = %name, error = %e, "Status report failed");
            }
        }
        info!(subscriber = %name, "Handler stopped");
    })
}
