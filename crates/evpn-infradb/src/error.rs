//! Error types for the resource store.

use crate::resources::ResourceKind;
use evpn_common::KvError;
use thiserror::Error;

/// Errors surfaced to callers of the resource store.
///
/// Stale or orphaned status callbacks are not errors: they are logged and
/// dropped inside [`InfraDb::update_status`](crate::InfraDb::update_status).
#[derive(Error, Debug)]
pub enum InfraDbError {
    #[error("{kind} {name} not found")]
    KeyNotFound { kind: ResourceKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{kind} {name} is being deleted")]
    PendingDeletion { kind: ResourceKind, name: String },

    #[error("{kind} {name} depends on missing {dependency}")]
    DependencyMissing {
        kind: ResourceKind,
        name: String,
        dependency: String,
    },

    #[error("{kind} {name} is still referenced by {}", dependents.join(", "))]
    InUse {
        kind: ResourceKind,
        name: String,
        dependents: Vec<String>,
    },

    #[error("persistence error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("replay of {component} aborted: {reason}")]
    ReplayAborted { component: String, reason: String },
}

impl InfraDbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InfraDbError::KeyNotFound { .. })
    }
}

/// Result type for resource store operations.
pub type Result<T> = std::result::Result<T, InfraDbError>;
