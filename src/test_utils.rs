//! Test utilities: sample payloads and an in-process bus fixture.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{InProcessConfig, InProcessTransport};
use crate::envelope::Payload;
use crate::routing::Router;
use crate::topology::{ExchangeKind, Specifier, Topology};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub quantity: u32,
}

impl Payload for OrderPlaced {
    const TYPE_TAG: &'static str = "orders.OrderPlaced";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
}

impl Payload for OrderShipped {
    const TYPE_TAG: &'static str = "orders.OrderShipped";
}

pub fn order(id: &str, quantity: u32) -> OrderPlaced {
    OrderPlaced {
        order_id: id.to_string(),
        quantity,
    }
}

/// Topic exchange `orders` with queue `audit` bound to `orders.#` and queue
/// `placed` bound to `orders.placed`, over a fast-polling in-process broker.
pub fn orders_bus() -> (Specifier, Arc<InProcessTransport>) {
    let topology = Arc::new(Topology::new());
    let spec = Specifier::new(Arc::clone(&topology));
    spec.declare_exchange("orders", ExchangeKind::Topic)
        .expect("declare orders");
    let orders = spec.specify_exchange("orders").expect("orders handle");
    orders
        .declare_queue("audit", ["orders.#"])
        .expect("declare audit");
    orders
        .declare_queue("placed", ["orders.placed"])
        .expect("declare placed");

    let transport = InProcessTransport::with_config(
        topology,
        &InProcessConfig {
            recheck_interval_ms: 5,
        },
    )
    .with_router(Router::seeded(1));
    (spec, Arc::new(transport))
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `fut`, failing the test if it takes longer than a second.
pub async fn within_second<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), fut)
        .await
        .expect("timed out")
}
