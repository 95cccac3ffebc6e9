//! Resource versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static LAST_VERSION: AtomicU64 = AtomicU64::new(0);

/// Optimistic-concurrency token of one revision of a resource.
///
/// Derived from the wall clock in nanoseconds and kept strictly increasing
/// within the process, so two mutations in the same clock tick still get
/// distinct, ordered versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// Returns a version greater than every version handed out before.
    pub fn next() -> Self {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |nanos| u64::try_from(nanos).unwrap_or(0));

        let previous = LAST_VERSION
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);

        ResourceVersion(now.max(previous.saturating_add(1)))
    }

    pub const fn from_raw(raw: u64) -> Self {
        ResourceVersion(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
