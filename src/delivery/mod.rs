//! Per-delivery primitives shared by transports and listeners.
//!
//! A transport hands each consumer a [`Delivery`]: the envelope, the
//! read-only [`MessageContextInfo`] it stamped at delivery time, and an
//! [`AckHandle`] that must be settled exactly once.

mod ack;
mod cancel;

pub use ack::{AckError, AckHandle, Settlement};
pub use cancel::{CancellationSignal, CancellationSource};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::envelope::Envelope;

/// Metadata attached by the transport to one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageContextInfo {
    message_id: Uuid,
    correlation_id: Option<String>,
    timestamp: DateTime<Utc>,
    /// Monotonically increasing within one consumer session, starting at 1.
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
}

impl MessageContextInfo {
    pub fn new(
        message_id: Uuid,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            correlation_id: None,
            timestamp,
            delivery_tag: 0,
            redelivered: false,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Stamp the consumer-session fields. Transports call this when handing
    /// the message to a consumer.
    pub fn with_delivery(mut self, delivery_tag: u64, redelivered: bool) -> Self {
        self.delivery_tag = delivery_tag;
        self.redelivered = redelivered;
        self
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

/// One message handed to a consumer.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub context: MessageContextInfo,
    pub ack: AckHandle,
}
