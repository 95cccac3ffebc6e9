//! Retry scheduling for failed reconciliation work.
//!
//! [`Backoff`] computes the delay a failing component waits before it is
//! invoked again; [`RetryQueue`] holds work items until their deadline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff: `base` on the first failure, then doubling up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay to use after a failure, given the delay used after the
    /// previous one (`Duration::ZERO` if this is the first failure).
    pub fn next(&self, previous: Duration) -> Duration {
        if previous.is_zero() {
            self.base
        } else {
            previous.saturating_mul(2).min(self.max)
        }
    }
}

/// Work items ordered by the instant they become due.
///
/// Items sharing a deadline are returned in insertion order.
#[derive(Debug)]
pub struct RetryQueue<T> {
    entries: BTreeMap<Instant, Vec<T>>,
    len: usize,
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T> RetryQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Schedules `item` to become due at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, item: T) {
        self.entries.entry(deadline).or_default().push(item);
        self.len += 1;
    }

    /// Schedules `item` to become due `delay` from now.
    pub fn schedule_after(&mut self, delay: Duration, item: T) {
        self.schedule(Instant::now() + delay, item);
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().copied()
    }

    /// Removes and returns every item due at or before `now`, earliest first.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<T> {
        let later = match now.checked_add(Duration::from_nanos(1)) {
            Some(bound) => self.entries.split_off(&bound),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.entries, later);
        let items: Vec<T> = ready.into_values().flatten().collect();
        self.len -= items.len();
        items
    }

    /// Drops every item matching `predicate`, returning how many were removed.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, items| {
            let before = items.len();
            items.retain(|item| !predicate(item));
            removed += before - items.len();
            !items.is_empty()
        });
        self.len -= removed;
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }
}
