//! Handler registration and per-delivery dispatch.
//!
//! A [`HandlerRegistry`] maps payload type tags to typed async handlers.
//! Dispatching a delivery decodes its envelope against the registered type
//! and yields the handler future; the listener decides where to run it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::delivery::{AckHandle, CancellationSignal, MessageContextInfo};
use crate::envelope::{DecodeError, DecodedPayload, Envelope, Payload};

/// Everything a handler gets besides the payload.
#[derive(Debug)]
pub struct HandlerContext {
    pub context: MessageContextInfo,
    pub cancel: CancellationSignal,
    pub ack: AckHandle,
}

/// Type-erased handler for one payload tag.
trait MessageHandler: Send + Sync {
    fn decode(&self, envelope: &Envelope) -> Result<DecodedPayload, DecodeError>;

    fn handle(&self, payload: DecodedPayload, ctx: HandlerContext) -> BoxFuture<'static, ()>;
}

struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

impl<P, F, Fut> MessageHandler for TypedHandler<P, F>
where
    P: Payload,
    F: Fn(P, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn decode(&self, envelope: &Envelope) -> Result<DecodedPayload, DecodeError> {
        envelope.decode::<P>().map(|p| Box::new(p) as DecodedPayload)
    }

    fn handle(&self, payload: DecodedPayload, ctx: HandlerContext) -> BoxFuture<'static, ()> {
        match payload.downcast::<P>() {
            Ok(payload) => Box::pin((self.f)(*payload, ctx)),
            // A payload of the wrong type would fail the same way on every
            // redelivery.
            Err(_) => {
                reject_unprocessable(&ctx.ack, P::TYPE_TAG);
                Box::pin(async {})
            }
        }
    }
}

type FallbackFn = Arc<dyn Fn(Envelope, HandlerContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Payload tag → handler table, plus an optional fallback for unknown tags.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn MessageHandler>>,
    fallback: Option<FallbackFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `P`. A later registration for the same tag
    /// replaces the earlier one.
    pub fn on<P, F, Fut>(mut self, f: F) -> Self
    where
        P: Payload,
        F: Fn(P, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = TypedHandler::<P, F> {
            f,
            _payload: PhantomData,
        };
        if self.handlers.insert(P::TYPE_TAG, Arc::new(handler)).is_some() {
            debug!(payload_type_tag = P::TYPE_TAG, "Replaced handler");
        }
        self
    }

    /// Receive envelopes whose tag has no handler, undecoded.
    pub fn fallback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Envelope, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.fallback = Some(Arc::new(
            move |envelope, ctx| -> BoxFuture<'static, ()> { Box::pin(f(envelope, ctx)) },
        ));
        self
    }

    pub fn handles(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.handlers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Resolve one delivery to the work that should run for it.
    ///
    /// Deliveries that cannot be handled are rejected without requeue here,
    /// so they land in the exchange's dead letters.
    pub fn dispatch(&self, envelope: Envelope, ctx: HandlerContext) -> Dispatch {
        let tag = envelope.payload_type_tag();
        if let Some(handler) = self.handlers.get(tag) {
            return match handler.decode(&envelope) {
                Ok(payload) => Dispatch::Run(handler.handle(payload, ctx)),
                Err(error) => {
                    reject_unprocessable(&ctx.ack, tag);
                    Dispatch::DecodeFailed(error)
                }
            };
        }
        match &self.fallback {
            Some(fallback) => Dispatch::Run(fallback(envelope, ctx)),
            None => {
                reject_unprocessable(&ctx.ack, tag);
                Dispatch::Unhandled(tag.to_string())
            }
        }
    }
}

fn reject_unprocessable(ack: &AckHandle, tag: &str) {
    if let Err(e) = ack.reject(false) {
        warn!(
            delivery_tag = ack.delivery_tag(),
            payload_type_tag = %tag,
            error = %e,
            "Failed to dead-letter unprocessable delivery"
        );
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tags", &self.tags())
            .field("fallback", &self.has_fallback())
            .finish()
    }
}

/// Result of resolving a delivery against a [`HandlerRegistry`].
pub enum Dispatch {
    /// Handler future to run. It owns the ack handle.
    Run(BoxFuture<'static, ()>),
    /// Payload did not decode; already rejected without requeue.
    DecodeFailed(DecodeError),
    /// No handler and no fallback for this tag; already rejected without
    /// requeue.
    Unhandled(String),
}

impl Dispatch {
    /// Whether a handler will see the message.
    pub fn is_handled(&self) -> bool {
        matches!(self, Dispatch::Run(_))
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Run(_) => f.write_str("Run"),
            Dispatch::DecodeFailed(e) => f.debug_tuple("DecodeFailed").field(e).finish(),
            Dispatch::Unhandled(tag) => f.debug_tuple("Unhandled").field(tag).finish(),
        }
    }
}
