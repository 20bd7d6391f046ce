//! Message bus contracts.
//!
//! This module contains:
//! - `Transport` trait: the broker seam (publish + consume)
//! - `DeliveryStream` trait: per-consumer stream of deliveries
//! - `Publisher`: typed, exchange-bound sending
//! - `Listener`: queue-bound consumption with concurrent handler dispatch
//! - Implementations: in-process broker, Mock

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::delivery::Delivery;
use crate::envelope::{EncodeError, Envelope};
use crate::topology::TopologyError;

pub mod dispatch;
pub mod in_process;
pub mod listener;
pub mod mock;
pub mod publisher;

pub use dispatch::{Dispatch, HandlerContext, HandlerRegistry};
pub use in_process::{DeadLetter, InProcessConfig, InProcessTransport};
pub use listener::{InFlightMessage, ListenAborted, Listener};
pub use mock::MockTransport;
pub use publisher::Publisher;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("{0} used before initialize()")]
    NotInitialized(&'static str),

    #[error("Exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("Queue '{queue}' is not declared on exchange '{exchange}'")]
    UnknownQueue { exchange: String, queue: String },

    #[error("Queue '{queue}' on exchange '{exchange}' already has a consumer")]
    ConsumerBusy { exchange: String, queue: String },

    #[error("Listener is already listening")]
    AlreadyListening,

    #[error("Transport fault: {0}")]
    Transport(String),

    #[error("Consume not supported for this transport")]
    ConsumeNotSupported,

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

// ============================================================================
// Traits
// ============================================================================

/// A message on its way to a broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
    pub correlation_id: Option<String>,
}

/// What the transport did with a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: Uuid,
    /// Queues the message was enqueued on. Empty when nothing matched.
    pub queues: Vec<String>,
}

impl PublishReceipt {
    pub fn is_routed(&self) -> bool {
        !self.queues.is_empty()
    }
}

/// Broker seam shared by publishers and listeners.
///
/// Implementations:
/// - `InProcessTransport`: topology-routed queues in memory
/// - `MockTransport`: records publishes for testing
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand a message to the broker. Returns once the broker has accepted
    /// it; delivery happens later.
    fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt>;

    /// Awaitable publish. Brokers with network round trips override this.
    async fn publish_async(&self, message: OutboundMessage) -> Result<PublishReceipt> {
        self.publish(message)
    }

    /// Attach the single consumer of `queue` on `exchange`.
    ///
    /// While `paused` reads `true` the stream withholds deliveries; messages
    /// stay queued.
    async fn consume(
        &self,
        exchange: &str,
        queue: &str,
        paused: watch::Receiver<bool>,
    ) -> Result<Box<dyn DeliveryStream>>;
}

/// Deliveries for one consumer, in queue order.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery. `None` when the stream closed cleanly, `Err` on a
    /// transport fault (after which the stream is finished).
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses no
    /// message.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;
}
