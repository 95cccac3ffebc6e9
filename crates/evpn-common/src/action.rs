//! Named out-of-band actions exchanged with backend components.
//!
//! Unlike the event bus, an action is a request/response hook: the engine
//! invokes the handler a component registered for `(action, component)` and
//! waits for its verdict. The core uses a single action, [`PRE_REPLAY`],
//! which a restarted backend answers once it is ready to re-learn state.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Action invoked before a component's state is replayed.
pub const PRE_REPLAY: &str = "pre-replay";

/// Failure reported by an action handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("no handler for action {action} of component {component}")]
    NoHandler { action: String, component: String },

    #[error("action {action} failed: {reason}")]
    Failed { action: String, reason: String },
}

impl ActionError {
    pub fn failed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        ActionError::Failed {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

/// Handler a component registers for an action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &str, component: &str) -> Result<(), ActionError>;
}

/// Registry of action handlers keyed by `(action, component)`.
#[derive(Default)]
pub struct ActionBus {
    handlers: RwLock<HashMap<(String, String), Arc<dyn ActionHandler>>>,
}

impl ActionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, replacing any previous handler for the pair.
    pub fn register(
        &self,
        action: impl Into<String>,
        component: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) {
        let key = (action.into(), component.into());
        debug!(action = %key.0, component = %key.1, "Action handler registered");
        self.handlers.write().insert(key, handler);
    }

    pub fn unregister(&self, action: &str, component: &str) -> bool {
        self.handlers
            .write()
            .remove(&(action.to_string(), component.to_string()))
            .is_some()
    }

    pub fn handler(&self, action: &str, component: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .get(&(action.to_string(), component.to_string()))
            .cloned()
    }

    /// Runs the handler registered for `(action, component)`.
    pub async fn invoke(&self, action: &str, component: &str) -> Result<(), ActionError> {
        let handler = self
            .handler(action, component)
            .ok_or_else(|| ActionError::NoHandler {
                action: action.to_string(),
                component: component.to_string(),
            })?;
        handler.handle(action, component).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ActionHandler for Counting {
        async fn handle(&self, action: &str, _component: &str) -> Result<(), ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ActionError::failed(action, "not ready"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_invoke_registered_handler() {
        let bus = ActionBus::new();
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        bus.register(PRE_REPLAY, "frr", handler.clone());

        bus.invoke(PRE_REPLAY, "frr").await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invoke_missing_or_failing_handler() {
        let bus = ActionBus::new();
        assert_eq!(
            bus.invoke(PRE_REPLAY, "p4").await,
            Err(ActionError::NoHandler {
                action: PRE_REPLAY.to_string(),
                component: "p4".to_string(),
            })
        );

        bus.register(
            PRE_REPLAY,
            "p4",
            Arc::new(Counting {
                calls: AtomicUsize::new(0),
                fail: true,
            }),
        );
        assert!(matches!(
            bus.invoke(PRE_REPLAY, "p4").await,
            Err(ActionError::Failed { .. })
        ));

        assert!(bus.unregister(PRE_REPLAY, "p4"));
        assert!(bus.handler(PRE_REPLAY, "p4").is_none());
    }
}
