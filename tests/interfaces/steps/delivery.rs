//! Message delivery step definitions.

use std::sync::Arc;
use std::time::Duration;

use busbar::bus::{
    HandlerContext, HandlerRegistry, InProcessConfig, InProcessTransport, ListenAborted, Listener,
    Publisher,
};
use busbar::delivery::AckError;
use busbar::envelope::Envelope;
use busbar::test_utils::{eventually, order, OrderPlaced, OrderShipped};
use busbar::topology::{ExchangeKind, Specifier, Topology};
use cucumber::{given, then, when, World};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(1);
const QUIET: Duration = Duration::from_millis(60);

/// What handlers observed.
#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Order { id: String, redelivered: bool },
    Started,
    AckResult(Result<(), AckError>),
    Fallback(String),
}

/// Test context for delivery scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct DeliveryWorld {
    spec: Specifier,
    transport: Arc<InProcessTransport>,
    exchange: String,
    listener: Option<Listener<InProcessTransport>>,
    seen_tx: mpsc::UnboundedSender<Seen>,
    seen_rx: mpsc::UnboundedReceiver<Seen>,
    aborted_tx: mpsc::UnboundedSender<ListenAborted>,
    aborted_rx: mpsc::UnboundedReceiver<ListenAborted>,
}

impl DeliveryWorld {
    fn new() -> Self {
        let topology = Arc::new(Topology::new());
        let transport = InProcessTransport::with_config(
            Arc::clone(&topology),
            &InProcessConfig {
                recheck_interval_ms: 5,
            },
        );
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (aborted_tx, aborted_rx) = mpsc::unbounded_channel();
        Self {
            spec: Specifier::new(topology),
            transport: Arc::new(transport),
            exchange: String::new(),
            listener: None,
            seen_tx,
            seen_rx,
            aborted_tx,
            aborted_rx,
        }
    }

    fn publisher(&self) -> Publisher<InProcessTransport> {
        let mut publisher = Publisher::new(Arc::clone(&self.transport));
        publisher
            .initialize(&self.exchange)
            .expect("Failed to initialize publisher");
        publisher
    }

    async fn start_listener(&mut self, queue: &str, handlers: HandlerRegistry) {
        let mut listener = Listener::new(Arc::clone(&self.transport));
        listener
            .initialize(&self.exchange, queue)
            .expect("Failed to initialize listener");
        let aborted_tx = self.aborted_tx.clone();
        listener.on_listen_aborted(move |aborted| {
            let _ = aborted_tx.send(aborted.clone());
        });
        listener.listen(handlers).await.expect("Failed to listen");
        self.listener = Some(listener);
    }

    fn listener(&self) -> &Listener<InProcessTransport> {
        self.listener.as_ref().expect("No listener started")
    }

    async fn next_seen(&mut self) -> Option<Seen> {
        tokio::time::timeout(WAIT, self.seen_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

// --- Background ---

#[given(expr = "an in-process bus with topic exchange {string} and queue {string} bound to {string}")]
async fn given_bus(world: &mut DeliveryWorld, exchange: String, queue: String, binding: String) {
    world
        .spec
        .declare_exchange(&exchange, ExchangeKind::Topic)
        .expect("Failed to declare exchange");
    world
        .spec
        .specify_exchange(&exchange)
        .expect("Exchange not declared")
        .declare_queue(&queue, [binding])
        .expect("Failed to declare queue");
    world.exchange = exchange;
}

// --- Given steps ---

#[given(expr = "a listener on {string} that acknowledges orders")]
async fn given_acking_listener(world: &mut DeliveryWorld, queue: String) {
    if let Some(mut previous) = world.listener.take() {
        previous.stop().await;
    }
    let seen = world.seen_tx.clone();
    let handlers = HandlerRegistry::new().on(move |placed: OrderPlaced, ctx: HandlerContext| {
        let seen = seen.clone();
        async move {
            ctx.ack.ack().expect("ack refused");
            let _ = seen.send(Seen::Order {
                id: placed.order_id,
                redelivered: ctx.context.redelivered(),
            });
        }
    });
    world.start_listener(&queue, handlers).await;
}

#[given(expr = "a listener on {string} that waits for cancellation")]
async fn given_waiting_listener(world: &mut DeliveryWorld, queue: String) {
    let seen = world.seen_tx.clone();
    let handlers = HandlerRegistry::new().on(move |_: OrderPlaced, ctx: HandlerContext| {
        let seen = seen.clone();
        async move {
            let _ = seen.send(Seen::Started);
            ctx.cancel.cancelled().await;
            let _ = seen.send(Seen::AckResult(ctx.ack.ack()));
        }
    });
    world.start_listener(&queue, handlers).await;
}

#[given(expr = "a listener on {string} with a fallback")]
async fn given_fallback_listener(world: &mut DeliveryWorld, queue: String) {
    let seen = world.seen_tx.clone();
    let handlers = HandlerRegistry::new().fallback(move |envelope: Envelope, ctx: HandlerContext| {
        let seen = seen.clone();
        async move {
            ctx.ack.ack().expect("ack refused");
            let _ = seen.send(Seen::Fallback(envelope.payload_type_tag().to_string()));
        }
    });
    world.start_listener(&queue, handlers).await;
}

#[given("the listener is paused")]
async fn given_paused(world: &mut DeliveryWorld) {
    world.listener().set_paused(true);
    assert!(world.listener().is_paused());
}

// --- When steps ---

#[when(expr = "I publish order {string} with key {string}")]
async fn when_publish_order(world: &mut DeliveryWorld, id: String, key: String) {
    world
        .publisher()
        .send_async(&order(&id, 1), &key)
        .await
        .expect("Publish failed");
}

#[when(expr = "I publish a shipment {string} with key {string}")]
async fn when_publish_shipment(world: &mut DeliveryWorld, id: String, key: String) {
    world
        .publisher()
        .send(&OrderShipped { order_id: id }, &key)
        .expect("Publish failed");
}

#[when("the listener is resumed")]
async fn when_resumed(world: &mut DeliveryWorld) {
    world.listener().set_paused(false);
}

#[when("the handler has started")]
async fn when_handler_started(world: &mut DeliveryWorld) {
    assert_eq!(world.next_seen().await, Some(Seen::Started));
}

#[when("the listener is stopped")]
async fn when_stopped(world: &mut DeliveryWorld) {
    let mut listener = world.listener.take().expect("No listener started");
    listener.stop().await;
}

#[when(expr = "queue {string} is deleted")]
async fn when_queue_deleted(world: &mut DeliveryWorld, queue: String) {
    world
        .spec
        .specify_exchange(&world.exchange)
        .expect("Exchange not declared")
        .delete_queue(&queue)
        .expect("Failed to delete queue");
}

// --- Then steps ---

#[then(expr = "the handler sees order {string}")]
async fn then_sees_order(world: &mut DeliveryWorld, id: String) {
    assert_eq!(
        world.next_seen().await,
        Some(Seen::Order {
            id,
            redelivered: false
        })
    );
}

#[then(expr = "the handler sees order {string} redelivered")]
async fn then_sees_redelivered(world: &mut DeliveryWorld, id: String) {
    assert_eq!(
        world.next_seen().await,
        Some(Seen::Order {
            id,
            redelivered: true
        })
    );
}

#[then("the handler sees nothing")]
async fn then_sees_nothing(world: &mut DeliveryWorld) {
    let seen = tokio::time::timeout(QUIET, world.seen_rx.recv()).await;
    assert!(seen.is_err(), "Unexpected delivery: {:?}", seen);
}

#[then("the handler's acknowledgement was refused")]
async fn then_ack_refused(world: &mut DeliveryWorld) {
    assert!(matches!(
        world.next_seen().await,
        Some(Seen::AckResult(Err(AckError::Cancelled(_))))
    ));
}

#[then(expr = "the fallback sees tag {string}")]
async fn then_fallback_sees(world: &mut DeliveryWorld, tag: String) {
    assert_eq!(world.next_seen().await, Some(Seen::Fallback(tag)));
}

#[then(expr = "queue {string} is empty")]
async fn then_queue_empty(world: &mut DeliveryWorld, queue: String) {
    let (transport, exchange) = (Arc::clone(&world.transport), world.exchange.clone());
    assert!(
        eventually(WAIT, || {
            transport.depth(&exchange, &queue) == 0 && transport.unacked(&exchange, &queue) == 0
        })
        .await
    );
}

#[then(expr = "queue {string} holds {int} message(s)")]
async fn then_queue_holds(world: &mut DeliveryWorld, queue: String, count: usize) {
    assert_eq!(world.transport.depth(&world.exchange, &queue), count);
}

#[then(expr = "the listener aborts with {int} in-flight message(s)")]
async fn then_listener_aborts(world: &mut DeliveryWorld, count: usize) {
    let aborted = tokio::time::timeout(WAIT, world.aborted_rx.recv())
        .await
        .expect("Listener did not abort")
        .expect("Abort channel closed");
    assert_eq!(aborted.queue, "placed");
    assert_eq!(aborted.messages.len(), count);
    let listener = world.listener();
    assert!(eventually(WAIT, || !listener.is_listening()).await);
}

#[then(expr = "exchange {string} has {int} dead letter(s)")]
async fn then_dead_letters(world: &mut DeliveryWorld, exchange: String, count: usize) {
    let transport = Arc::clone(&world.transport);
    assert!(
        eventually(WAIT, || transport.dead_letters(&exchange).len() == count).await,
        "Dead letters: {:?}",
        transport.dead_letters(&exchange)
    );
}
