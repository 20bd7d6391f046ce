use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Barrier};

use crate::alert::RecordingAlertSink;
use crate::bus::{InProcessTransport, OutboundMessage, Publisher};
use crate::delivery::AckError;
use crate::envelope::Payload;
use crate::test_utils::{eventually, order, orders_bus, within_second, OrderPlaced, OrderShipped};

const WAIT: Duration = Duration::from_secs(1);

fn publisher(transport: &Arc<InProcessTransport>) -> Publisher<InProcessTransport> {
    let mut publisher = Publisher::new(Arc::clone(transport));
    publisher.initialize("orders").unwrap();
    publisher
}

fn listener(
    transport: &Arc<InProcessTransport>,
    queue: &str,
) -> (Listener<InProcessTransport>, RecordingAlertSink) {
    let alerts = RecordingAlertSink::new();
    let mut listener =
        Listener::new(Arc::clone(transport)).with_alert_sink(Arc::new(alerts.clone()));
    listener.initialize("orders", queue).unwrap();
    (listener, alerts)
}

#[tokio::test]
async fn test_handler_receives_payload_and_context() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "placed");
    let (tx, mut rx) = mpsc::unbounded_channel();

    listener
        .listen(HandlerRegistry::new().on(move |placed: OrderPlaced, ctx: HandlerContext| {
            let tx = tx.clone();
            async move {
                ctx.ack.ack().unwrap();
                let _ = tx.send((placed, ctx.context));
            }
        }))
        .await
        .unwrap();

    publisher(&transport)
        .send_with_correlation(&order("o-1", 2), "orders.placed", "req-1")
        .unwrap();

    let (placed, context) = within_second(rx.recv()).await.unwrap();
    assert_eq!(placed, order("o-1", 2));
    assert_eq!(context.routing_key(), "orders.placed");
    assert_eq!(context.correlation_id(), Some("req-1"));
    assert_eq!(context.delivery_tag(), 1);
    assert!(eventually(WAIT, || transport.unacked("orders", "placed") == 0).await);

    listener.stop().await;
}

#[tokio::test]
async fn test_listen_requires_initialize() {
    let (_spec, transport) = orders_bus();
    let mut listener = Listener::new(transport);

    let result = listener.listen(HandlerRegistry::new()).await;

    assert!(matches!(result, Err(BusError::NotInitialized("Listener"))));
}

#[tokio::test]
async fn test_listen_twice_is_refused() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "audit");

    listener.listen(HandlerRegistry::new()).await.unwrap();
    let second = listener.listen(HandlerRegistry::new()).await;

    assert!(matches!(second, Err(BusError::AlreadyListening)));
    listener.stop().await;
    assert!(!listener.is_listening());
}

#[tokio::test]
async fn test_handlers_run_concurrently() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "placed");
    let barrier = Arc::new(Barrier::new(2));
    let acked = Arc::new(AtomicUsize::new(0));

    let handlers = HandlerRegistry::new().on({
        let barrier = Arc::clone(&barrier);
        let acked = Arc::clone(&acked);
        move |_: OrderPlaced, ctx: HandlerContext| {
            let barrier = Arc::clone(&barrier);
            let acked = Arc::clone(&acked);
            async move {
                // Both handlers must be running at once to pass.
                barrier.wait().await;
                ctx.ack.ack().unwrap();
                acked.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    listener.listen(handlers).await.unwrap();

    let publisher = publisher(&transport);
    publisher.send(&order("a", 1), "orders.placed").unwrap();
    publisher.send(&order("b", 1), "orders.placed").unwrap();

    assert!(eventually(WAIT, || acked.load(Ordering::SeqCst) == 2).await);
    listener.stop().await;
}

#[tokio::test]
async fn test_max_in_flight_limits_concurrency() {
    let (_spec, transport) = orders_bus();
    let (listener, _alerts) = listener(&transport, "placed");
    let mut listener = listener.with_max_in_flight(1);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let handlers = HandlerRegistry::new().on({
        let (running, peak, done) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
        move |_: OrderPlaced, ctx: HandlerContext| {
            let (running, peak, done) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                ctx.ack.ack().unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    listener.listen(handlers).await.unwrap();

    let publisher = publisher(&transport);
    for n in 0..4 {
        publisher.send(&order("o", n), "orders.placed").unwrap();
    }

    assert!(eventually(WAIT, || done.load(Ordering::SeqCst) == 4).await);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    listener.stop().await;
}

#[tokio::test]
async fn test_unhandled_tag_is_dead_lettered_and_alerted() {
    let (_spec, transport) = orders_bus();
    let (mut listener, alerts) = listener(&transport, "audit");
    listener
        .listen(HandlerRegistry::new().on(|_: OrderPlaced, ctx: HandlerContext| async move {
            ctx.ack.ack().unwrap();
        }))
        .await
        .unwrap();

    publisher(&transport)
        .send(
            &OrderShipped {
                order_id: "o-1".to_string(),
            },
            "orders.shipped",
        )
        .unwrap();

    assert!(eventually(WAIT, || transport.dead_letters("orders").len() == 1).await);
    assert_eq!(
        alerts.alerts(),
        vec![Alert::UnhandledPayload {
            exchange: "orders".to_string(),
            queue: "audit".to_string(),
            payload_type_tag: "orders.OrderShipped".to_string(),
        }]
    );
    listener.stop().await;
}

#[tokio::test]
async fn test_fallback_receives_unregistered_tags() {
    let (_spec, transport) = orders_bus();
    let (mut listener, alerts) = listener(&transport, "audit");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handlers = HandlerRegistry::new().fallback(move |envelope: Envelope, ctx: HandlerContext| {
        let tx = tx.clone();
        async move {
            ctx.ack.ack().unwrap();
            let _ = tx.send(envelope.payload_type_tag().to_string());
        }
    });
    listener.listen(handlers).await.unwrap();

    publisher(&transport)
        .send(&order("o-1", 1), "orders.placed")
        .unwrap();

    assert_eq!(
        within_second(rx.recv()).await.as_deref(),
        Some("orders.OrderPlaced")
    );
    assert!(alerts.alerts().is_empty());
    assert!(transport.dead_letters("orders").is_empty());
    listener.stop().await;
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_lettered_and_alerted() {
    let (_spec, transport) = orders_bus();
    let (mut listener, alerts) = listener(&transport, "placed");
    let invoked = Arc::new(AtomicUsize::new(0));
    listener
        .listen(HandlerRegistry::new().on({
            let invoked = Arc::clone(&invoked);
            move |_: OrderPlaced, _ctx: HandlerContext| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async {}
            }
        }))
        .await
        .unwrap();

    transport
        .publish(OutboundMessage {
            exchange: "orders".to_string(),
            routing_key: "orders.placed".to_string(),
            envelope: Envelope::from_parts(OrderPlaced::TYPE_TAG, b"{\"order_id\":7}".to_vec()),
            correlation_id: None,
        })
        .unwrap();

    assert!(eventually(WAIT, || transport.dead_letters("orders").len() == 1).await);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert!(matches!(
        alerts.alerts().as_slice(),
        [Alert::DecodeFailed { payload_type_tag, .. }] if payload_type_tag == "orders.OrderPlaced"
    ));
    listener.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_in_flight_and_requeues() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "placed");
    let (tx, mut rx) = mpsc::unbounded_channel();

    listener
        .listen(HandlerRegistry::new().on(move |_: OrderPlaced, ctx: HandlerContext| {
            let tx = tx.clone();
            async move {
                ctx.cancel.cancelled().await;
                let _ = tx.send(ctx.ack.ack());
            }
        }))
        .await
        .unwrap();

    publisher(&transport)
        .send(&order("o-1", 1), "orders.placed")
        .unwrap();
    assert!(eventually(WAIT, || listener.in_flight() == 1).await);

    within_second(listener.stop()).await;

    assert_eq!(rx.recv().await, Some(Err(AckError::Cancelled(1))));
    assert_eq!(transport.depth("orders", "placed"), 1);
    assert!(!transport.has_consumer("orders", "placed"));
}

#[tokio::test]
async fn test_stopped_listener_can_listen_again_and_sees_redelivery() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "placed");
    let publisher = publisher(&transport);
    publisher.send(&order("o-1", 1), "orders.placed").unwrap();

    listener
        .listen(HandlerRegistry::new().on(|_: OrderPlaced, ctx: HandlerContext| async move {
            ctx.cancel.cancelled().await;
        }))
        .await
        .unwrap();
    assert!(eventually(WAIT, || listener.in_flight() == 1).await);
    listener.stop().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    listener
        .listen(HandlerRegistry::new().on(move |_: OrderPlaced, ctx: HandlerContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.context.redelivered());
                ctx.ack.ack().unwrap();
            }
        }))
        .await
        .unwrap();

    assert_eq!(within_second(rx.recv()).await, Some(true));
    listener.stop().await;
}

#[tokio::test]
async fn test_paused_listener_withholds_until_resumed() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "placed");
    let (tx, mut rx) = mpsc::unbounded_channel();
    listener
        .listen(HandlerRegistry::new().on(move |placed: OrderPlaced, ctx: HandlerContext| {
            let tx = tx.clone();
            async move {
                ctx.ack.ack().unwrap();
                let _ = tx.send(placed.order_id);
            }
        }))
        .await
        .unwrap();

    listener.set_paused(true);
    assert!(listener.is_paused());
    publisher(&transport)
        .send(&order("o-1", 1), "orders.placed")
        .unwrap();

    let withheld = tokio::time::timeout(Duration::from_millis(60), rx.recv()).await;
    assert!(withheld.is_err());
    assert_eq!(transport.depth("orders", "placed"), 1);

    listener.set_paused(false);
    assert_eq!(within_second(rx.recv()).await.as_deref(), Some("o-1"));
    listener.stop().await;
}

#[tokio::test]
async fn test_queue_deletion_aborts_listening() {
    let (spec, transport) = orders_bus();
    let (mut listener, alerts) = listener(&transport, "placed");
    let (tx, mut rx) = mpsc::unbounded_channel();
    listener.on_listen_aborted(move |aborted| {
        let _ = tx.send(aborted.clone());
    });
    listener
        .listen(HandlerRegistry::new().on(|_: OrderPlaced, ctx: HandlerContext| async move {
            ctx.cancel.cancelled().await;
        }))
        .await
        .unwrap();

    publisher(&transport)
        .send(&order("o-1", 3), "orders.placed")
        .unwrap();
    assert!(eventually(WAIT, || listener.in_flight() == 1).await);

    spec.specify_exchange("orders")
        .unwrap()
        .delete_queue("placed")
        .unwrap();

    let aborted = within_second(rx.recv()).await.unwrap();
    assert_eq!(aborted.exchange, "orders");
    assert_eq!(aborted.queue, "placed");
    assert_eq!(aborted.messages.len(), 1);
    assert_eq!(
        aborted.messages[0].envelope.decode::<OrderPlaced>().unwrap(),
        order("o-1", 3)
    );
    assert!(eventually(WAIT, || !listener.is_listening()).await);
    assert!(matches!(
        alerts.alerts().as_slice(),
        [Alert::ListenAborted { in_flight: 1, .. }]
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_ignoring_ack_keeps_delivery_in_flight() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "placed");
    let invocations = Arc::new(AtomicUsize::new(0));
    listener
        .listen(HandlerRegistry::new().on({
            let invocations = Arc::clone(&invocations);
            move |_: OrderPlaced, ctx: HandlerContext| {
                invocations.fetch_add(1, Ordering::SeqCst);
                // The rest of the context, ack included, drops here.
                let cancel = ctx.cancel;
                async move { cancel.cancelled().await }
            }
        }))
        .await
        .unwrap();

    publisher(&transport)
        .send(&order("o-1", 1), "orders.placed")
        .unwrap();
    assert!(eventually(WAIT, || listener.in_flight() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(listener.in_flight(), 1);
    assert_eq!(transport.unacked("orders", "placed"), 1);
    assert_eq!(transport.depth("orders", "placed"), 0);

    within_second(listener.stop()).await;
    assert_eq!(transport.unacked("orders", "placed"), 0);
    assert_eq!(transport.depth("orders", "placed"), 1);
}

#[tokio::test]
async fn test_pause_lets_in_flight_handler_finish_and_ack() {
    let (_spec, transport) = orders_bus();
    let (mut listener, _alerts) = listener(&transport, "placed");
    let gate = Arc::new(tokio::sync::Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    listener
        .listen(HandlerRegistry::new().on({
            let gate = Arc::clone(&gate);
            move |_: OrderPlaced, ctx: HandlerContext| {
                let gate = Arc::clone(&gate);
                let tx = tx.clone();
                async move {
                    gate.notified().await;
                    let _ = tx.send(ctx.ack.ack());
                }
            }
        }))
        .await
        .unwrap();

    publisher(&transport)
        .send(&order("o-1", 1), "orders.placed")
        .unwrap();
    assert!(eventually(WAIT, || listener.in_flight() == 1).await);

    listener.set_paused(true);
    gate.notify_one();

    assert_eq!(within_second(rx.recv()).await, Some(Ok(())));
    assert!(eventually(WAIT, || listener.in_flight() == 0).await);
    assert_eq!(transport.depth("orders", "placed"), 0);
    assert_eq!(transport.unacked("orders", "placed"), 0);
    listener.stop().await;
}
