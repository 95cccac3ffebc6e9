//! Shared plumbing for the EVPN gateway control plane.
//!
//! - [`kv`]: pluggable whole-value key/value persistence (memory, Redis)
//! - [`event_bus`]: named subscribers with priorities and bounded channels
//! - [`retry`]: exponential backoff and a deadline-ordered retry queue
//! - [`action`]: named out-of-band hooks (pre-replay)
//! - [`shell`]: quoting and execution of networking commands

pub mod action;
pub mod event_bus;
pub mod kv;
pub mod retry;
pub mod shell;

pub use action::{ActionBus, ActionError, ActionHandler, PRE_REPLAY};
pub use event_bus::{DeliveryPolicy, EventBus, EventBusError, SubscriberConfig, SubscriberInfo};
pub use kv::{open_store, KvBackend, KvError, KvStore, MemoryKvStore};
pub use retry::{Backoff, RetryQueue};
pub use shell::{shellquote, ExecResult, ShellError, BRIDGE_CMD, IP_CMD};

#[cfg(feature = "redis")]
pub use kv::RedisKvStore;
