//! Reconciliation status of a resource and of each backend component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Aggregate operational status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperStatus {
    #[default]
    Unspecified,
    Up,
    Down,
    /// Delete requested; removed once every component has succeeded.
    ToBeDeleted,
}

/// Status one backend component reported for one resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    #[default]
    Unspecified,
    Pending,
    Success,
    Error,
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentStatus::Unspecified => "unspecified",
            ComponentStatus::Pending => "pending",
            ComponentStatus::Success => "success",
            ComponentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A named backend's reconciliation status for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub status: ComponentStatus,
    /// Free-form backend detail, typically the last error.
    #[serde(default)]
    pub details: String,
    /// Delay before the backend is invoked again after an error.
    #[serde(default, with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Component {
    pub fn new(name: impl Into<String>, status: ComponentStatus) -> Self {
        Self {
            name: name.into(),
            status,
            details: String::new(),
            retry_delay: Duration::ZERO,
        }
    }

    pub fn pending(name: impl Into<String>) -> Self {
        Self::new(name, ComponentStatus::Pending)
    }

    pub fn success(name: impl Into<String>) -> Self {
        Self::new(name, ComponentStatus::Success)
    }

    /// An error report; a zero `retry_delay` lets the store derive the
    /// next backoff step from the previously stored delay.
    pub fn error(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            details: details.into(),
            ..Self::new(name, ComponentStatus::Error)
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Status block stored on every resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub oper_status: OperStatus,
    /// One entry per subscriber of the resource kind, in priority order.
    pub components: Vec<Component>,
}

impl ResourceStatus {
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn all_succeeded(&self) -> bool {
        self.components
            .iter()
            .all(|c| c.status == ComponentStatus::Success)
    }

    /// Names of components that have not reported success yet.
    pub fn pending_components(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| c.status != ComponentStatus::Success)
            .map(|c| c.name.clone())
            .collect()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
