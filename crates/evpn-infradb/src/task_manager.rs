//! Dispatch of reconciliation tasks to backend subscribers.
//!
//! Every resource mutation produces a [`Task`]: the object, the version
//! that must be reconciled and the subscribers that still have to report.
//! A single worker dispatches each task to its subscribers one at a time in
//! priority order and waits for the status callback answering that exact
//! dispatch (matched by notification ID) before notifying the next one.
//! Only one dispatch per object is outstanding; other objects proceed
//! meanwhile, and a newer version of the object abandons the outstanding
//! dispatch of the older one.
//!
//! Failed dispatches are parked on a [`RetryQueue`] for the delay the
//! component reported and re-dispatched, starting with the failed
//! subscriber, once the delay has elapsed. A callback that turned out to be
//! stale (the object changed or disappeared) drops the task; the newer
//! version has its own task.

use crate::resources::ResourceKind;
use crate::version::ResourceVersion;
use evpn_common::{Backoff, EventBus, RetryQueue};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Payload published on the desired-state event bus.
///
/// Subscribers re-fetch the full object from the store and quote
/// `resource_version` and `notification_id` when reporting back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData {
    pub kind: ResourceKind,
    pub name: String,
    pub resource_version: ResourceVersion,
    pub notification_id: Uuid,
}

/// Reconciliation work for one resource version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: ResourceKind,
    pub name: String,
    pub resource_version: ResourceVersion,
    /// Subscribers still to be notified, in priority order.
    pub subscribers: Vec<String>,
    /// Delay applied the last time dispatch itself failed.
    pub(crate) delivery_delay: Duration,
}

impl Task {
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        resource_version: ResourceVersion,
        subscribers: Vec<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            resource_version,
            subscribers,
            delivery_delay: Duration::ZERO,
        }
    }

    fn is_same_object(&self, other: &Task) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

/// How a dispatched notification was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// The component failed and wants to be invoked again after the delay.
    Error { retry_delay: Duration },
    /// The callback was stale or the object is gone.
    Drop,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskStatus {
    notification_id: Uuid,
    outcome: TaskOutcome,
}

/// Cloneable handle used by the store to feed the worker.
#[derive(Clone)]
pub struct TaskManagerHandle {
    tasks: mpsc::UnboundedSender<Task>,
    statuses: mpsc::UnboundedSender<TaskStatus>,
    /// Number of replays in progress; dispatch pauses while non-zero.
    replays: Arc<watch::Sender<usize>>,
}

impl TaskManagerHandle {
    /// Queues a task. Tasks of the same object queued earlier are superseded.
    pub fn submit(&self, task: Task) {
        trace!(kind = %task.kind, name = %task.name, version = %task.resource_version, "Task submitted");
        if self.tasks.send(task).is_err() {
            debug!("Task manager stopped, task discarded");
        }
    }

    /// Answers the dispatch identified by `notification_id`.
    pub fn report(&self, notification_id: Uuid, outcome: TaskOutcome) {
        let status = TaskStatus {
            notification_id,
            outcome,
        };
        if self.statuses.send(status).is_err() {
            debug!(%notification_id, "Task manager stopped, status discarded");
        }
    }

    /// Pauses dispatching until the matching [`Self::unblock`].
    pub fn block(&self) {
        self.replays.send_modify(|n| *n += 1);
        debug!("Task dispatch blocked for replay");
    }

    pub fn unblock(&self) {
        self.replays.send_modify(|n| *n = n.saturating_sub(1));
        debug!("Task dispatch unblocked");
    }

    pub fn is_blocked(&self) -> bool {
        *self.replays.borrow() > 0
    }
}

/// The dispatch worker. Obtain one from [`crate::InfraDb::new`] and drive
/// it with [`TaskManager::run`].
pub struct TaskManager {
    bus: Arc<EventBus<ObjectData>>,
    backoff: Backoff,
    tasks: mpsc::UnboundedReceiver<Task>,
    statuses: mpsc::UnboundedReceiver<TaskStatus>,
    replays: watch::Receiver<usize>,
    queue: VecDeque<Task>,
    retries: RetryQueue<Task>,
    /// Dispatches awaiting their status, keyed by notification ID. The
    /// first subscriber of each task is the one notified.
    in_flight: HashMap<Uuid, Task>,
}

impl TaskManager {
    pub(crate) fn new(bus: Arc<EventBus<ObjectData>>, backoff: Backoff) -> (Self, TaskManagerHandle) {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (replay_tx, replay_rx) = watch::channel(0usize);

        let manager = Self {
            bus,
            backoff,
            tasks: task_rx,
            statuses: status_rx,
            replays: replay_rx,
            queue: VecDeque::new(),
            retries: RetryQueue::new(),
            in_flight: HashMap::new(),
        };
        let handle = TaskManagerHandle {
            tasks: task_tx,
            statuses: status_tx,
            replays: Arc::new(replay_tx),
        };
        (manager, handle)
    }

    /// Number of tasks queued, parked for retry or awaiting a status.
    pub fn backlog(&self) -> usize {
        self.queue.len() + self.retries.len() + self.in_flight.len()
    }

    /// Runs until `cancel` fires or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Task manager started");

        loop {
            for task in self.retries.pop_ready(Instant::now()) {
                debug!(kind = %task.kind, name = %task.name, "Retrying task");
                self.queue.push_back(task);
            }
            while let Ok(task) = self.tasks.try_recv() {
                self.enqueue(task);
            }
            while let Ok(status) = self.statuses.try_recv() {
                self.complete(status);
            }

            if !self.dispatch_ready(&cancel).await {
                break;
            }

            let deadline = self.retries.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.tasks.recv() => match task {
                    Some(task) => self.enqueue(task),
                    None => break,
                },
                status = self.statuses.recv() => match status {
                    Some(status) => self.complete(status),
                    None => break,
                },
                _ = sleep_until(deadline) => {}
                changed = self.replays.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(backlog = self.backlog(), "Task manager stopped");
    }

    /// Adds a new task, discarding queued, parked and in-flight work for
    /// older versions of the same object.
    fn enqueue(&mut self, task: Task) {
        let older = |other: &Task| other.is_same_object(&task) && other.resource_version < task.resource_version;

        let before = self.queue.len() + self.in_flight.len();
        self.queue.retain(|queued| !older(queued));
        self.in_flight.retain(|_, dispatched| !older(dispatched));
        let superseded =
            before - self.queue.len() - self.in_flight.len() + self.retries.remove_where(|parked| older(parked));
        if superseded > 0 {
            debug!(kind = %task.kind, name = %task.name, superseded, "Superseded older tasks");
        }
        self.queue.push_back(task);
    }

    fn is_blocked(&mut self) -> bool {
        *self.replays.borrow_and_update() > 0
    }

    fn is_in_flight(&self, task: &Task) -> bool {
        self.in_flight.values().any(|dispatched| dispatched.is_same_object(task))
    }

    /// Notifies the next subscriber of every queued task whose object has
    /// no dispatch outstanding. Returns false if cancelled.
    async fn dispatch_ready(&mut self, cancel: &CancellationToken) -> bool {
        let mut waiting = VecDeque::new();
        while let Some(task) = self.queue.pop_front() {
            if self.is_blocked() || self.is_in_flight(&task) {
                waiting.push_back(task);
                continue;
            }
            if !self.dispatch(task, cancel).await {
                self.queue.append(&mut waiting);
                return false;
            }
        }
        self.queue = waiting;
        true
    }

    async fn dispatch(&mut self, mut task: Task, cancel: &CancellationToken) -> bool {
        let Some(subscriber) = task.subscribers.first().cloned() else {
            return true;
        };
        let notification_id = Uuid::new_v4();
        let data = ObjectData {
            kind: task.kind,
            name: task.name.clone(),
            resource_version: task.resource_version,
            notification_id,
        };
        debug!(
            kind = %task.kind,
            name = %task.name,
            version = %task.resource_version,
            subscriber = %subscriber,
            %notification_id,
            "Dispatching task"
        );

        let sent = tokio::select! {
            _ = cancel.cancelled() => return false,
            sent = self.bus.publish_to(&subscriber, data) => sent,
        };
        match sent {
            Ok(()) => {
                task.delivery_delay = Duration::ZERO;
                self.in_flight.insert(notification_id, task);
            }
            Err(e) => {
                task.delivery_delay = self.backoff.next(task.delivery_delay);
                warn!(
                    subscriber = %subscriber,
                    error = %e,
                    retry_in = ?task.delivery_delay,
                    "Task dispatch failed"
                );
                self.retries.schedule_after(task.delivery_delay, task);
            }
        }
        true
    }

    /// Applies the answer to an outstanding dispatch.
    fn complete(&mut self, status: TaskStatus) {
        let Some(mut task) = self.in_flight.remove(&status.notification_id) else {
            trace!(notification_id = %status.notification_id, "Status for no outstanding dispatch ignored");
            return;
        };
        let subscriber = task.subscribers.first().cloned().unwrap_or_default();

        match status.outcome {
            TaskOutcome::Success => {
                trace!(subscriber = %subscriber, name = %task.name, "Component succeeded");
                task.subscribers.remove(0);
                if task.subscribers.is_empty() {
                    debug!(kind = %task.kind, name = %task.name, version = %task.resource_version, "Task completed");
                } else {
                    self.queue.push_front(task);
                }
            }
            TaskOutcome::Error { retry_delay } => {
                debug!(
                    subscriber = %subscriber,
                    name = %task.name,
                    retry_in = ?retry_delay,
                    "Component not done, task parked for retry"
                );
                self.retries.schedule_after(retry_delay, task);
            }
            TaskOutcome::Drop => {
                debug!(subscriber = %subscriber, name = %task.name, "Task dropped");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evpn_common::SubscriberConfig;
    use pretty_assertions::assert_eq;

    fn setup(subscribers: &[&str]) -> (TaskManager, TaskManagerHandle, Vec<mpsc::Receiver<ObjectData>>) {
        let bus = Arc::new(EventBus::new());
        let receivers = subscribers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                bus.subscribe(
                    SubscriberConfig::new(*name)
                        .with_priority(i32::try_from(i).unwrap())
                        .with_events(["vrf"]),
                )
                .unwrap()
            })
            .collect();
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let (manager, handle) = TaskManager::new(bus, backoff);
        (manager, handle, receivers)
    }

    fn task(name: &str, subscribers: &[&str]) -> Task {
        Task::new(
            ResourceKind::Vrf,
            name,
            ResourceVersion::next(),
            subscribers.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_dispatches_in_priority_order() {
        let (manager, handle, mut rx) = setup(&["a", "b"]);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(manager.run(cancel.clone()));

        handle.submit(task("blue", &["a", "b"]));

        let first = rx[0].recv().await.unwrap();
        assert_eq!(first.name, "blue");
        assert!(rx[1].try_recv().is_err());

        handle.report(first.notification_id, TaskOutcome::Success);
        let second = rx[1].recv().await.unwrap();
        assert_eq!(second.resource_version, first.resource_version);
        assert_ne!(second.notification_id, first.notification_id);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_redispatches_after_delay() {
        let (manager, handle, mut rx) = setup(&["a"]);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(manager.run(cancel.clone()));

        handle.submit(task("blue", &["a"]));
        let first = rx[0].recv().await.unwrap();
        handle.report(
            first.notification_id,
            TaskOutcome::Error {
                retry_delay: Duration::from_secs(5),
            },
        );

        let started = Instant::now();
        let retried = rx[0].recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(retried.resource_version, first.resource_version);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_discards_task() {
        let (manager, handle, mut rx) = setup(&["a", "b"]);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(manager.run(cancel.clone()));

        handle.submit(task("blue", &["a", "b"]));
        let first = rx[0].recv().await.unwrap();
        handle.report(first.notification_id, TaskOutcome::Drop);

        handle.submit(task("red", &["b"]));
        let next = rx[1].recv().await.unwrap();
        assert_eq!(next.name, "red");

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocked_manager_holds_dispatch() {
        let (manager, handle, mut rx) = setup(&["a"]);
        let cancel = CancellationToken::new();
        handle.block();
        assert!(handle.is_blocked());
        let worker = tokio::spawn(manager.run(cancel.clone()));

        handle.submit(task("blue", &["a"]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx[0].try_recv().is_err());

        handle.unblock();
        assert_eq!(rx[0].recv().await.unwrap().name, "blue");

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_version_replaces_unanswered_dispatch() {
        let (manager, handle, mut rx) = setup(&["a"]);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(manager.run(cancel.clone()));

        let v1 = task("blue", &["a"]);
        handle.submit(v1.clone());
        let first = rx[0].recv().await.unwrap();
        assert_eq!(first.resource_version, v1.resource_version);

        // No answer for V1; V2 is dispatched anyway.
        let v2 = task("blue", &["a"]);
        handle.submit(v2.clone());
        let second = rx[0].recv().await.unwrap();
        assert_eq!(second.resource_version, v2.resource_version);

        // A late answer to the abandoned dispatch changes nothing.
        handle.report(first.notification_id, TaskOutcome::Success);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx[0].try_recv().is_err());

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_subscriber_does_not_hold_other_objects() {
        let (manager, handle, mut rx) = setup(&["a", "b"]);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(manager.run(cancel.clone()));

        handle.submit(task("blue", &["a"]));
        assert_eq!(rx[0].recv().await.unwrap().name, "blue");

        handle.submit(task("red", &["a", "b"]));
        let red = rx[0].recv().await.unwrap();
        assert_eq!(red.name, "red");
        handle.report(red.notification_id, TaskOutcome::Success);
        assert_eq!(rx[1].recv().await.unwrap().name, "red");

        cancel.cancel();
        worker.await.unwrap();
    }

    #[test]
    fn test_enqueue_supersedes_older_versions() {
        let (mut manager, _handle, _rx) = setup(&["a"]);
        let old = task("blue", &["a"]);
        let other = task("red", &["a"]);
        let new = task("blue", &["a"]);

        manager.enqueue(old);
        manager.enqueue(other);
        manager.enqueue(new.clone());

        let queued: Vec<&str> = manager.queue.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(queued, vec!["red", "blue"]);
        assert_eq!(manager.queue.back(), Some(&new));
    }
}
