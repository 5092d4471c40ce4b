//! Message bus contract
//!
//! The transport itself (serialization, topic routing, delivery) lives
//! outside this crate. The engine only relies on the narrow contract below:
//! at-least-once delivery to subscribers, a uid authority, and a process
//! identity. No cross-message ordering is guaranteed beyond what the engine
//! imposes itself.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::message::{BusMessage, ClientId, MessageKind, Uid};

/// Transport-level failures surfaced by the bus collaborator
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// A message could not be published.
    #[error("send failed: {0}")]
    Send(String),

    /// A gather round completed without collecting any responses.
    #[error("gather produced no responses within {0:?}")]
    GatherTimeout(Duration),

    /// The bus connection is gone.
    #[error("bus connection closed")]
    Closed,
}

/// Handler invoked by the bus for each delivered message
///
/// The bus may invoke handlers on arbitrary threads; implementations must do
/// only cheap, non-blocking work before handing off to their own workers.
pub trait BusHandler: Send + Sync {
    /// Deliver one message.
    fn on_message(&self, message: BusMessage);
}

/// Contract the engine requires from the message bus
pub trait MessageBus: Send + Sync {
    /// Publish a message to all subscribers.
    fn send(&self, message: BusMessage) -> Result<(), BusError>;

    /// Publish a message and collect direct responses until `timeout`
    /// elapses. Used for request rounds where peers reply individually
    /// (execution-request declines, breakpoint commands).
    fn gather(&self, message: BusMessage, timeout: Duration) -> Result<Vec<BusMessage>, BusError>;

    /// Register a handler for the given message kinds.
    fn subscribe(&self, kinds: &[MessageKind], handler: Arc<dyn BusHandler>);

    /// Issue the next globally unique transaction identifier.
    fn next_uid(&self) -> Uid;

    /// Identity of this process on the bus.
    fn client_id(&self) -> ClientId;
}
