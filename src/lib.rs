//! Busbar - transport-agnostic message bus
//!
//! Declarative exchange/queue topology, AMQP-style routing (direct, fanout,
//! topic), typed payload envelopes, and publisher/listener contracts over a
//! pluggable transport. An in-process transport ships for single-process
//! applications and tests.

pub mod alert;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod routing;
pub mod topology;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{BusError, HandlerContext, HandlerRegistry, Listener, Publisher, Transport};
pub use envelope::{Envelope, Payload};
pub use topology::{ExchangeKind, Specifier, Topology};
