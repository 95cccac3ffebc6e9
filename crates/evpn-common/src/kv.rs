//! Key/value persistence for the resource store.
//!
//! The store only needs whole-value `get`/`set`/`delete`; values are opaque
//! bytes (the resource store writes JSON). The backend is selected at startup
//! from a `(backend, address)` pair, see [`open_store`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from key/value backends.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("connection to {backend} at {address} failed: {reason}")]
    Connection {
        backend: KvBackend,
        address: String,
        reason: String,
    },

    #[error("command {command} on key {key} failed: {reason}")]
    Command {
        command: &'static str,
        key: String,
        reason: String,
    },

    #[error("unknown key-value backend: {0}")]
    UnknownBackend(String),

    #[error("backend {0} is not compiled in")]
    Unsupported(KvBackend),
}

/// Result type for key/value operations.
pub type Result<T> = std::result::Result<T, KvError>;

/// Minimal persistence contract used by the resource store.
///
/// Methods take `&mut self` since network backends keep a single
/// multiplexed connection; callers serialize access behind one lock.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the stored value, or `None` if the key is absent.
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn delete(&mut self, key: &str) -> Result<()>;
}

/// Available persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    /// Process-local map; contents are lost on restart.
    Memory,
    /// Redis server reached through a connection manager.
    #[default]
    Redis,
}

impl fmt::Display for KvBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvBackend::Memory => write!(f, "memory"),
            KvBackend::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for KvBackend {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(KvBackend::Memory),
            "redis" => Ok(KvBackend::Redis),
            _ => Err(KvError::UnknownBackend(s.to_string())),
        }
    }
}

/// Opens the backend named by `backend` at `address`.
///
/// The memory backend ignores `address`. Connection failures are returned
/// to the caller; the daemon treats them as fatal at startup.
pub async fn open_store(backend: KvBackend, address: &str) -> Result<Box<dyn KvStore>> {
    match backend {
        KvBackend::Memory => {
            info!("Using in-memory key-value store");
            Ok(Box::new(MemoryKvStore::new()))
        }
        #[cfg(feature = "redis")]
        KvBackend::Redis => Ok(Box::new(RedisKvStore::connect(address).await?)),
        #[cfg(not(feature = "redis"))]
        KvBackend::Redis => {
            let _ = address;
            Err(KvError::Unsupported(backend))
        }
    }
}

/// In-memory backend.
///
/// Clones share the same map, so a test can keep a handle and inspect what
/// the store persisted, or hand the same contents to a second store
/// instance to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Sorted snapshot of the stored keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisKvStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::{KvBackend, KvError, KvStore, Result};
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use tracing::{info, trace};

    /// Redis backend. Keys are stored as plain strings holding the value bytes.
    pub struct RedisKvStore {
        address: String,
        connection: ConnectionManager,
    }

    impl RedisKvStore {
        /// Connects to `address` (`host:port` or a full `redis://` URL).
        pub async fn connect(address: &str) -> Result<Self> {
            let uri = if address.contains("://") {
                address.to_string()
            } else {
                format!("redis://{}", address)
            };

            let connection_error = |reason: String| KvError::Connection {
                backend: KvBackend::Redis,
                address: address.to_string(),
                reason,
            };

            let client = redis::Client::open(uri).map_err(|e| connection_error(e.to_string()))?;
            let connection = client
                .get_connection_manager()
                .await
                .map_err(|e| connection_error(e.to_string()))?;

            info!(address = %address, "Connected to Redis");
            Ok(Self {
                address: address.to_string(),
                connection,
            })
        }

        pub fn address(&self) -> &str {
            &self.address
        }
    }

    fn command_error(command: &'static str, key: &str, e: redis::RedisError) -> KvError {
        KvError::Command {
            command,
            key: key.to_string(),
            reason: e.to_string(),
        }
    }

    #[async_trait]
    impl KvStore for RedisKvStore {
        async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
            trace!(key = %key, "GET");
            self.connection
                .get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(|e| command_error("GET", key, e))
        }

        async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
            trace!(key = %key, bytes = value.len(), "SET");
            self.connection
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| command_error("SET", key, e))
        }

        async fn delete(&mut self, key: &str) -> Result<()> {
            trace!(key = %key, "DEL");
            self.connection
                .del::<_, ()>(key)
                .await
                .map_err(|e| command_error("DEL", key, e))
        }
    }
}
