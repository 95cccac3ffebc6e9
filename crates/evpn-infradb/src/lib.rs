//! Reconciliation engine of the EVPN gateway.
//!
//! The [`InfraDb`] stores the desired network configuration as versioned
//! [`Resource`]s. Each mutation marks every backend subscribed to the
//! resource kind as `Pending` and queues a [`Task`] that the
//! [`TaskManager`] dispatches on the desired-state [`EventBus`]. Backends
//! report back through [`InfraDb::update_status`], quoting the version they
//! were notified about; outdated reports are dropped. A resource becomes
//! `Up`, or is removed after a delete, once every component succeeded.
//!
//! [`EventBus`]: evpn_common::EventBus

pub mod error;
mod handler;
mod replay;
pub mod resources;
pub mod status;
mod store;
mod task_manager;
pub mod version;

pub use error::{InfraDbError, Result};
pub use handler::{spawn_handler, EventHandler};
pub use resources::{
    BridgePort, BridgePortMetadata, BridgePortSpec, BridgePortType, IpsecProtocol, IpsecSa,
    IpsecSaMetadata, IpsecSaSpec, LogicalBridge, LogicalBridgeSpec, Metadata, NoMetadata,
    ObjectRef, Resource, ResourceKind, ResourceSpec, Svi, SviSpec, TunRep, TunRepSpec, Vrf,
    VrfMetadata, VrfSpec,
};
pub use status::{Component, ComponentStatus, OperStatus, ResourceStatus};
pub use store::InfraDb;
pub use task_manager::{ObjectData, Task, TaskManager, TaskManagerHandle, TaskOutcome};
pub use version::ResourceVersion;
