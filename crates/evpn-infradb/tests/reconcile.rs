//! End-to-end reconciliation through the public store API.

use async_trait::async_trait;
use evpn_common::{ActionError, ActionHandler, Backoff, MemoryKvStore, SubscriberConfig, PRE_REPLAY};
use evpn_infradb::{
    spawn_handler, Component, ComponentStatus, EventHandler, InfraDb, InfraDbError, ObjectData,
    OperStatus, Vrf, VrfSpec,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Harness {
    db: Arc<InfraDb>,
    kv: MemoryKvStore,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn start(backoff: Backoff) -> Harness {
    let kv = MemoryKvStore::new();
    let (db, manager) = InfraDb::new(Box::new(kv.clone()), backoff);
    let cancel = CancellationToken::new();
    tokio::spawn(manager.run(cancel.clone()));
    Harness { db, kv, cancel }
}

fn subscribe(db: &InfraDb, name: &str, priority: i32) -> mpsc::Receiver<ObjectData> {
    db.bus()
        .subscribe(
            SubscriberConfig::new(name)
                .with_priority(priority)
                .with_events(["vrf"]),
        )
        .unwrap()
}

async fn next(rx: &mut mpsc::Receiver<ObjectData>) -> ObjectData {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no dispatch within 5s")
        .expect("channel closed")
}

fn statuses(vrf: &Vrf) -> Vec<(String, ComponentStatus)> {
    vrf.status
        .components
        .iter()
        .map(|c| (c.name.clone(), c.status))
        .collect()
}

fn pair(name: &str, status: ComponentStatus) -> (String, ComponentStatus) {
    (name.to_string(), status)
}

#[tokio::test]
async fn test_create_report_delete_lifecycle() {
    let h = start(Backoff::default());
    let mut a = subscribe(&h.db, "a", 1);
    let mut b = subscribe(&h.db, "b", 2);

    // Create: both components pending, A notified first.
    let created = h.db.create(Vrf::new("blue", VrfSpec::default())).await.unwrap();
    let v1 = created.resource_version;
    assert_eq!(
        statuses(&created),
        vec![pair("a", ComponentStatus::Pending), pair("b", ComponentStatus::Pending)]
    );
    assert_eq!(created.status.oper_status, OperStatus::Down);

    let to_a = next(&mut a).await;
    assert_eq!(to_a.name, "blue");
    assert_eq!(to_a.resource_version, v1);

    // A succeeds: still down, B notified next.
    h.db.update_status::<VrfSpec>("blue", v1, to_a.notification_id, None, Component::success("a"))
        .await
        .unwrap();
    let stored = h.db.get::<VrfSpec>("blue").await.unwrap();
    assert_eq!(
        statuses(&stored),
        vec![pair("a", ComponentStatus::Success), pair("b", ComponentStatus::Pending)]
    );
    assert_eq!(stored.status.oper_status, OperStatus::Down);

    // B succeeds: up.
    let to_b = next(&mut b).await;
    assert_eq!(to_b.resource_version, v1);
    h.db.update_status::<VrfSpec>("blue", v1, to_b.notification_id, None, Component::success("b"))
        .await
        .unwrap();
    let stored = h.db.get::<VrfSpec>("blue").await.unwrap();
    assert_eq!(stored.status.oper_status, OperStatus::Up);
    assert_eq!(stored.resource_version, v1);

    // Delete: new version, both pending again, still stored.
    h.db.delete::<VrfSpec>("blue").await.unwrap();
    let deleting = h.db.get::<VrfSpec>("blue").await.unwrap();
    let v2 = deleting.resource_version;
    assert!(v2 > v1);
    assert_eq!(deleting.status.oper_status, OperStatus::ToBeDeleted);
    assert_eq!(
        statuses(&deleting),
        vec![pair("a", ComponentStatus::Pending), pair("b", ComponentStatus::Pending)]
    );

    // A late report quoting V1 changes nothing.
    h.db.update_status::<VrfSpec>("blue", v1, to_a.notification_id, None, Component::success("a"))
        .await
        .unwrap();
    assert_eq!(h.db.get::<VrfSpec>("blue").await.unwrap(), deleting);

    // Removal only after every component succeeded for V2.
    let del_a = next(&mut a).await;
    assert_eq!(del_a.resource_version, v2);
    h.db.update_status::<VrfSpec>("blue", v2, del_a.notification_id, None, Component::success("a"))
        .await
        .unwrap();
    assert!(h.db.get::<VrfSpec>("blue").await.is_ok());

    let del_b = next(&mut b).await;
    h.db.update_status::<VrfSpec>("blue", v2, del_b.notification_id, None, Component::error("b", "busy"))
        .await
        .unwrap();
    assert!(h.db.get::<VrfSpec>("blue").await.is_ok());

    h.db.update_status::<VrfSpec>("blue", v2, del_b.notification_id, None, Component::success("b"))
        .await
        .unwrap();
    assert!(h.db.get::<VrfSpec>("blue").await.unwrap_err().is_not_found());
    assert!(h.kv.is_empty());
}

#[tokio::test]
async fn test_update_while_deleting_is_rejected() {
    let h = start(Backoff::default());
    let _a = subscribe(&h.db, "a", 1);

    h.db.create(Vrf::new("blue", VrfSpec::default())).await.unwrap();
    h.db.delete::<VrfSpec>("blue").await.unwrap();
    let err = h.db.update(Vrf::new("blue", VrfSpec::default())).await.unwrap_err();
    assert!(matches!(err, InfraDbError::PendingDeletion { .. }));
}

#[tokio::test]
async fn test_update_dispatches_while_older_version_unanswered() {
    let h = start(Backoff::default());
    let mut a = subscribe(&h.db, "a", 1);

    let v1 = h.db.create(Vrf::new("blue", VrfSpec::default())).await.unwrap().resource_version;
    assert_eq!(next(&mut a).await.resource_version, v1);

    // "a" never answers V1.
    let v2 = h.db.update(Vrf::new("blue", VrfSpec::default())).await.unwrap().resource_version;
    let to_a = next(&mut a).await;
    assert_eq!(to_a.resource_version, v2);

    h.db.update_status::<VrfSpec>("blue", v2, to_a.notification_id, None, Component::success("a"))
        .await
        .unwrap();
    assert_eq!(
        h.db.get::<VrfSpec>("blue").await.unwrap().status.oper_status,
        OperStatus::Up
    );
}

#[tokio::test]
async fn test_pending_report_keeps_engine_moving() {
    let h = start(Backoff::new(Duration::from_millis(100), Duration::from_secs(1)));
    let mut a = subscribe(&h.db, "a", 1);

    let v1 = h.db.create(Vrf::new("blue", VrfSpec::default())).await.unwrap().resource_version;
    let to_a = next(&mut a).await;
    h.db.update_status::<VrfSpec>("blue", v1, to_a.notification_id, None, Component::pending("a"))
        .await
        .unwrap();

    h.db.create(Vrf::new("red", VrfSpec::default())).await.unwrap();
    let mut seen = vec![next(&mut a).await, next(&mut a).await];
    seen.sort_by(|x, y| x.name.cmp(&y.name));

    // Red is dispatched, and blue is asked again after the retry delay.
    assert_eq!(seen[0].name, "blue");
    assert_eq!(seen[0].resource_version, v1);
    assert_ne!(seen[0].notification_id, to_a.notification_id);
    assert_eq!(seen[1].name, "red");
}

struct ReadyHook {
    calls: AtomicUsize,
}

#[async_trait]
impl ActionHandler for ReadyHook {
    async fn handle(&self, _action: &str, _component: &str) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_replay_renotifies_only_the_restarted_component() {
    let h = start(Backoff::default());
    let mut a = subscribe(&h.db, "a", 1);
    let mut b = subscribe(&h.db, "b", 2);

    let created = h.db.create(Vrf::new("blue", VrfSpec::default())).await.unwrap();
    let v1 = created.resource_version;
    let to_a = next(&mut a).await;
    h.db.update_status::<VrfSpec>("blue", v1, to_a.notification_id, None, Component::success("a"))
        .await
        .unwrap();
    let to_b = next(&mut b).await;
    h.db.update_status::<VrfSpec>("blue", v1, to_b.notification_id, None, Component::success("b"))
        .await
        .unwrap();

    let hook = Arc::new(ReadyHook {
        calls: AtomicUsize::new(0),
    });
    h.db.actions().register(PRE_REPLAY, "b", hook.clone());

    assert_eq!(h.db.replay("b").await.unwrap(), 1);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert!(!h.db.task_manager().is_blocked());

    let replayed = h.db.get::<VrfSpec>("blue").await.unwrap();
    assert!(replayed.resource_version > v1);
    assert_eq!(replayed.status.oper_status, OperStatus::Down);
    assert_eq!(
        statuses(&replayed),
        vec![pair("a", ComponentStatus::Success), pair("b", ComponentStatus::Pending)]
    );

    let again = next(&mut b).await;
    assert_eq!(again.resource_version, replayed.resource_version);
    assert!(a.try_recv().is_err());

    h.db.update_status::<VrfSpec>(
        "blue",
        again.resource_version,
        again.notification_id,
        None,
        Component::success("b"),
    )
    .await
    .unwrap();
    assert_eq!(
        h.db.get::<VrfSpec>("blue").await.unwrap().status.oper_status,
        OperStatus::Up
    );
}

#[tokio::test]
async fn test_replay_without_hook_aborts_and_unblocks() {
    let h = start(Backoff::default());
    let _a = subscribe(&h.db, "a", 1);

    match h.db.replay("a").await {
        Err(InfraDbError::ReplayAborted { component, .. }) => assert_eq!(component, "a"),
        other => panic!("expected ReplayAborted, got {:?}", other),
    }
    assert!(!h.db.task_manager().is_blocked());
}

/// Fails the first `failures` calls, then succeeds.
struct FlakyBackend {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for FlakyBackend {
    async fn handle(&self, db: &InfraDb, object: &ObjectData) -> Result<(), String> {
        db.get::<VrfSpec>(&object.name)
            .await
            .map_err(|e| e.to_string())?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(format!("attempt {} failed", call + 1))
        } else {
            Ok(())
        }
    }
}

async fn wait_for_status(db: &InfraDb, name: &str, status: OperStatus) -> Vrf {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(vrf) = db.get::<VrfSpec>(name).await {
                if vrf.status.oper_status == status {
                    return vrf;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("status not reached")
}

#[tokio::test]
async fn test_handlers_converge_with_retries() {
    let h = start(Backoff::new(Duration::from_millis(10), Duration::from_millis(40)));
    let lgm = Arc::new(FlakyBackend {
        failures: 0,
        calls: AtomicUsize::new(0),
    });
    let frr = Arc::new(FlakyBackend {
        failures: 2,
        calls: AtomicUsize::new(0),
    });

    let rx = subscribe(&h.db, "lgm", 1);
    spawn_handler(h.db.clone(), "lgm", rx, lgm.clone(), h.cancel.clone());
    let rx = subscribe(&h.db, "frr", 2);
    spawn_handler(h.db.clone(), "frr", rx, frr.clone(), h.cancel.clone());

    h.db.create(Vrf::new("blue", VrfSpec::default())).await.unwrap();
    let vrf = wait_for_status(&h.db, "blue", OperStatus::Up).await;

    assert_eq!(lgm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(frr.calls.load(Ordering::SeqCst), 3);
    assert!(vrf.status.all_succeeded());
    assert_eq!(vrf.status.component("frr").map(|c| c.retry_delay), Some(Duration::ZERO));

    h.db.delete::<VrfSpec>("blue").await.unwrap();
    timeout(Duration::from_secs(5), async {
        while h.db.get::<VrfSpec>("blue").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("resource not removed");
}
