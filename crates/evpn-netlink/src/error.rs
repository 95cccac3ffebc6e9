//! Error types for the netlink synchronizer.

use evpn_common::ShellError;
use thiserror::Error;

/// Errors from kernel queries and topology reads.
///
/// None of these stop the synchronizer: a failed query is logged and the
/// affected entities are absent from that cycle's snapshot.
#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("kernel query failed: {0}")]
    Shell(#[from] ShellError),

    #[error("cannot parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("topology unavailable: {0}")]
    Topology(#[from] evpn_infradb::InfraDbError),
}

/// Result type alias for synchronizer operations.
pub type Result<T> = std::result::Result<T, NetlinkError>;
