//! Typed sending to one exchange.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, Instrument};

use super::{BusError, OutboundMessage, PublishReceipt, Result, Transport};
use crate::envelope::{Envelope, Payload};
use crate::topology::validate_name;

/// Publishes typed payloads to the exchange it was initialized with.
///
/// Clones share the transport and copy the current binding.
pub struct Publisher<T: Transport + ?Sized> {
    transport: Arc<T>,
    exchange: Option<String>,
}

impl<T: Transport + ?Sized> Publisher<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            exchange: None,
        }
    }

    /// Bind to an exchange. Calling again rebinds.
    ///
    /// The exchange is not required to exist yet; publishing to an exchange
    /// that is still undeclared at send time fails with
    /// [`BusError::UnknownExchange`].
    pub fn initialize(&mut self, exchange: impl AsRef<str>) -> Result<()> {
        let exchange = exchange.as_ref();
        validate_name("exchange", exchange)?;
        debug!(exchange = %exchange, "Publisher initialized");
        self.exchange = Some(exchange.to_string());
        Ok(())
    }

    /// Bound exchange, if initialized.
    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    /// Encode and hand `payload` to the transport.
    pub fn send<P: Payload>(
        &self,
        payload: &P,
        routing_key: impl AsRef<str>,
    ) -> Result<PublishReceipt> {
        let message = self.outbound(payload, routing_key.as_ref(), None)?;
        self.publish(message)
    }

    /// [`send`](Self::send), tagging the message with a correlation id that
    /// consumers see in their context info.
    pub fn send_with_correlation<P: Payload>(
        &self,
        payload: &P,
        routing_key: impl AsRef<str>,
        correlation_id: impl Into<String>,
    ) -> Result<PublishReceipt> {
        let message = self.outbound(payload, routing_key.as_ref(), Some(correlation_id.into()))?;
        self.publish(message)
    }

    /// Awaitable variant of [`send`](Self::send).
    pub async fn send_async<P: Payload>(
        &self,
        payload: &P,
        routing_key: impl AsRef<str>,
    ) -> Result<PublishReceipt> {
        let message = self.outbound(payload, routing_key.as_ref(), None)?;
        let span = publish_span(&message);
        let receipt = self
            .transport
            .publish_async(message)
            .instrument(span)
            .await?;
        log_receipt(&receipt);
        Ok(receipt)
    }

    fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt> {
        let span = publish_span(&message);
        let _entered = span.enter();
        let receipt = self.transport.publish(message)?;
        log_receipt(&receipt);
        Ok(receipt)
    }

    fn outbound<P: Payload>(
        &self,
        payload: &P,
        routing_key: &str,
        correlation_id: Option<String>,
    ) -> Result<OutboundMessage> {
        let exchange = self
            .exchange
            .clone()
            .ok_or(BusError::NotInitialized("Publisher"))?;
        Ok(OutboundMessage {
            exchange,
            routing_key: routing_key.to_string(),
            envelope: Envelope::encode(payload)?,
            correlation_id,
        })
    }
}

fn publish_span(message: &OutboundMessage) -> tracing::Span {
    tracing::debug_span!(
        "publish",
        exchange = %message.exchange,
        routing_key = %message.routing_key,
        payload_type_tag = %message.envelope.payload_type_tag(),
    )
}

fn log_receipt(receipt: &PublishReceipt) {
    debug!(
        message_id = %receipt.message_id,
        queues = ?receipt.queues,
        "Published"
    );
}

impl<T: Transport + ?Sized> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            exchange: self.exchange.clone(),
        }
    }
}

impl<T: Transport + ?Sized> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.exchange)
            .finish()
    }
}
