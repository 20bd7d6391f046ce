//! In-process broker.
//!
//! Routes published messages through the shared [`Topology`] into per-queue
//! FIFO storage and serves them to at most one consumer per queue. Settlement
//! follows broker semantics: ack drops the message, reject-with-requeue and
//! abandoned deliveries go back to the head of the queue flagged as
//! redelivered, and reject-without-requeue moves the message to its
//! exchange's dead letters.
//!
//! Queue deletion is detected by comparing the queue's incarnation in the
//! topology with the incarnation its storage was created for. Consumers
//! re-check at `recheck_interval` while idle.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BusError, DeliveryStream, OutboundMessage, PublishReceipt, Result, Transport};
use crate::delivery::{AckError, AckHandle, Delivery, MessageContextInfo, Settlement};
use crate::envelope::Envelope;
use crate::routing::{Router, RoutingStats};
use crate::topology::Topology;

/// In-process broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InProcessConfig {
    /// How often an idle or paused consumer re-checks that its queue still
    /// exists, in milliseconds.
    pub recheck_interval_ms: u64,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            recheck_interval_ms: 25,
        }
    }
}

/// A message rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub envelope: Envelope,
    pub context: MessageContextInfo,
}

type DeadLetterStore = Arc<Mutex<HashMap<String, Vec<DeadLetter>>>>;

type QueueStore = Arc<Mutex<HashMap<(String, String), Arc<QueueState>>>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
struct Stored {
    envelope: Envelope,
    context: MessageContextInfo,
    redelivered: bool,
}

struct QueueState {
    exchange: String,
    name: String,
    incarnation: u64,
    ready: Mutex<VecDeque<Stored>>,
    unacked: AtomicUsize,
    notify: Notify,
    consumer: AtomicBool,
}

impl QueueState {
    fn new(exchange: &str, name: &str, incarnation: u64) -> Self {
        Self {
            exchange: exchange.to_string(),
            name: name.to_string(),
            incarnation,
            ready: Mutex::new(VecDeque::new()),
            unacked: AtomicUsize::new(0),
            notify: Notify::new(),
            consumer: AtomicBool::new(false),
        }
    }

    fn push(&self, message: Stored) {
        locked(&self.ready).push_back(message);
        self.notify.notify_one();
    }

    fn requeue(&self, message: Stored) {
        locked(&self.ready).push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Stored> {
        locked(&self.ready).pop_front()
    }

    fn depth(&self) -> usize {
        locked(&self.ready).len()
    }

    fn is_current(&self, topology: &Topology) -> bool {
        topology.queue_incarnation(&self.exchange, &self.name) == Some(self.incarnation)
    }
}

/// Topology-routed in-memory broker.
pub struct InProcessTransport {
    topology: Arc<Topology>,
    router: Router,
    recheck_interval: Duration,
    queues: QueueStore,
    dead_letters: DeadLetterStore,
}

impl InProcessTransport {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self::with_config(topology, &InProcessConfig::default())
    }

    pub fn with_config(topology: Arc<Topology>, config: &InProcessConfig) -> Self {
        Self {
            topology,
            router: Router::default(),
            recheck_interval: Duration::from_millis(config.recheck_interval_ms.max(1)),
            queues: Arc::new(Mutex::new(HashMap::new())),
            dead_letters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the router, e.g. with a seeded one for reproducible direct
    /// exchange picks.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn stats(&self) -> &RoutingStats {
        self.router.stats()
    }

    /// Messages waiting on a queue, not counting unacknowledged deliveries.
    pub fn depth(&self, exchange: &str, queue: &str) -> usize {
        self.current_state(exchange, queue)
            .map(|state| state.depth())
            .unwrap_or(0)
    }

    /// Delivered but not yet settled.
    pub fn unacked(&self, exchange: &str, queue: &str) -> usize {
        self.current_state(exchange, queue)
            .map(|state| state.unacked.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn has_consumer(&self, exchange: &str, queue: &str) -> bool {
        self.current_state(exchange, queue)
            .is_some_and(|state| state.consumer.load(Ordering::SeqCst))
    }

    /// Messages rejected without requeue from any queue of `exchange`, in
    /// rejection order.
    pub fn dead_letters(&self, exchange: &str) -> Vec<DeadLetter> {
        locked(&self.dead_letters)
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    fn current_state(&self, exchange: &str, queue: &str) -> Option<Arc<QueueState>> {
        let mut queues = locked(&self.queues);
        let key = (exchange.to_string(), queue.to_string());
        let state = queues.get(&key)?;
        if state.is_current(&self.topology) {
            return Some(Arc::clone(state));
        }
        discard(&mut queues, &key);
        None
    }

    /// Drop storage of every queue that was deleted or redeclared.
    fn sweep(&self, queues: &mut HashMap<(String, String), Arc<QueueState>>) {
        let stale: Vec<_> = queues
            .iter()
            .filter(|(_, state)| !state.is_current(&self.topology))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            discard(queues, &key);
        }
    }

    /// Storage for one queue incarnation. Incarnations only grow; callers
    /// sweep stale storage first.
    fn queue_state(
        queues: &mut HashMap<(String, String), Arc<QueueState>>,
        exchange: &str,
        queue: &str,
        incarnation: u64,
    ) -> Arc<QueueState> {
        let key = (exchange.to_string(), queue.to_string());
        if let Some(state) = queues.get(&key) {
            if state.incarnation == incarnation {
                return Arc::clone(state);
            }
            if state.incarnation > incarnation {
                // Caller raced a redeclare; its queue is already gone.
                return Arc::new(QueueState::new(exchange, queue, incarnation));
            }
        }
        let state = Arc::new(QueueState::new(exchange, queue, incarnation));
        queues.insert(key, Arc::clone(&state));
        state
    }
}

fn discard(
    queues: &mut HashMap<(String, String), Arc<QueueState>>,
    key: &(String, String),
) {
    if let Some(state) = queues.remove(key) {
        debug!(
            exchange = %key.0,
            queue = %key.1,
            discarded = state.depth(),
            "Dropping storage of deleted queue"
        );
    }
}

impl fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("topology", &self.topology)
            .field("recheck_interval", &self.recheck_interval)
            .finish()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt> {
        let OutboundMessage {
            exchange,
            routing_key,
            envelope,
            correlation_id,
        } = message;

        let snapshot = self
            .topology
            .snapshot(&exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.clone()))?;
        let queues = self.router.route(&snapshot, &routing_key);

        let message_id = Uuid::new_v4();
        let context = MessageContextInfo::new(message_id, &exchange, &routing_key, Utc::now())
            .with_correlation_id(correlation_id);

        let targets: Vec<Arc<QueueState>> = {
            let mut storage = locked(&self.queues);
            self.sweep(&mut storage);
            queues
                .iter()
                .filter_map(|name| snapshot.queue(name))
                .map(|queue| {
                    Self::queue_state(&mut storage, &exchange, queue.name(), queue.incarnation())
                })
                .collect()
        };
        for target in targets {
            target.push(Stored {
                envelope: envelope.clone(),
                context: context.clone(),
                redelivered: false,
            });
        }

        Ok(PublishReceipt {
            message_id,
            queues,
        })
    }

    async fn consume(
        &self,
        exchange: &str,
        queue: &str,
        paused: watch::Receiver<bool>,
    ) -> Result<Box<dyn DeliveryStream>> {
        let snapshot = self
            .topology
            .snapshot(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;
        let incarnation = snapshot
            .queue(queue)
            .map(|q| q.incarnation())
            .ok_or_else(|| BusError::UnknownQueue {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
            })?;

        let state = {
            let mut storage = locked(&self.queues);
            self.sweep(&mut storage);
            Self::queue_state(&mut storage, exchange, queue, incarnation)
        };
        if state.consumer.swap(true, Ordering::SeqCst) {
            return Err(BusError::ConsumerBusy {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
            });
        }

        info!(
            exchange = %exchange,
            queue = %queue,
            ready = state.depth(),
            "Consumer attached"
        );

        Ok(Box::new(InProcessStream {
            topology: Arc::clone(&self.topology),
            queues: Arc::clone(&self.queues),
            state,
            dead_letters: Arc::clone(&self.dead_letters),
            paused,
            recheck_interval: self.recheck_interval,
            last_tag: 0,
            finished: false,
        }))
    }
}

// ============================================================================
// Consumer stream
// ============================================================================

struct InProcessStream {
    topology: Arc<Topology>,
    queues: QueueStore,
    state: Arc<QueueState>,
    dead_letters: DeadLetterStore,
    paused: watch::Receiver<bool>,
    recheck_interval: Duration,
    last_tag: u64,
    finished: bool,
}

impl InProcessStream {
    /// Drop this queue's storage if it is still the registered one.
    fn release_storage(&self) {
        let mut queues = locked(&self.queues);
        let key = (self.state.exchange.clone(), self.state.name.clone());
        if queues
            .get(&key)
            .is_some_and(|state| Arc::ptr_eq(state, &self.state))
        {
            discard(&mut queues, &key);
        }
    }

    fn deliver(&mut self, stored: Stored) -> Delivery {
        self.last_tag += 1;
        let tag = self.last_tag;
        let context = stored
            .context
            .clone()
            .with_delivery(tag, stored.redelivered);
        let envelope = stored.envelope.clone();

        self.state.unacked.fetch_add(1, Ordering::SeqCst);
        let settle = Settler {
            topology: Arc::clone(&self.topology),
            state: Arc::clone(&self.state),
            dead_letters: Arc::clone(&self.dead_letters),
            stored,
            tag,
        };

        Delivery {
            envelope,
            context,
            ack: AckHandle::new(tag, move |settlement| settle.settle(settlement)),
        }
    }
}

#[async_trait]
impl DeliveryStream for InProcessStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            if self.finished {
                return None;
            }

            if !self.state.is_current(&self.topology) {
                self.finished = true;
                self.release_storage();
                warn!(
                    exchange = %self.state.exchange,
                    queue = %self.state.name,
                    "Queue deleted under active consumer"
                );
                return Some(Err(BusError::Transport(format!(
                    "queue '{}' on exchange '{}' was deleted",
                    self.state.name, self.state.exchange
                ))));
            }

            let recheck = self.recheck_interval;
            if *self.paused.borrow() {
                if let Ok(Err(_)) =
                    tokio::time::timeout(recheck, self.paused.wait_for(|paused| !*paused)).await
                {
                    // Pause control dropped while paused: nobody can resume us.
                    self.finished = true;
                }
                continue;
            }

            if let Some(stored) = self.state.pop() {
                return Some(Ok(self.deliver(stored)));
            }

            let _ = tokio::time::timeout(recheck, self.state.notify.notified()).await;
        }
    }
}

impl Drop for InProcessStream {
    fn drop(&mut self) {
        self.state.consumer.store(false, Ordering::SeqCst);
        debug!(
            exchange = %self.state.exchange,
            queue = %self.state.name,
            "Consumer detached"
        );
    }
}

/// Applies one settlement to the queue a delivery came from.
struct Settler {
    topology: Arc<Topology>,
    state: Arc<QueueState>,
    dead_letters: DeadLetterStore,
    stored: Stored,
    tag: u64,
}

impl Settler {
    fn settle(self, settlement: Settlement) -> std::result::Result<(), AckError> {
        self.state.unacked.fetch_sub(1, Ordering::SeqCst);
        match settlement {
            Settlement::Ack => Ok(()),
            Settlement::Reject { requeue: false } => {
                debug!(
                    exchange = %self.state.exchange,
                    queue = %self.state.name,
                    delivery_tag = self.tag,
                    "Dead-lettering message"
                );
                locked(&self.dead_letters)
                    .entry(self.state.exchange.clone())
                    .or_default()
                    .push(DeadLetter {
                        queue: self.state.name.clone(),
                        envelope: self.stored.envelope,
                        context: self
                            .stored
                            .context
                            .with_delivery(self.tag, self.stored.redelivered),
                    });
                Ok(())
            }
            Settlement::Reject { requeue: true } | Settlement::Abandoned => {
                if !self.state.is_current(&self.topology) {
                    return Err(AckError::TransportGone(
                        self.tag,
                        format!("queue '{}' was deleted", self.state.name),
                    ));
                }
                self.state.requeue(Stored {
                    redelivered: true,
                    ..self.stored
                });
                Ok(())
            }
        }
    }
}
