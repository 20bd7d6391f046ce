//! Queue-bound consumption.
//!
//! A [`Listener`] attaches to one queue and runs a dispatch loop on the
//! tokio runtime. Each delivery is resolved through a [`HandlerRegistry`]
//! and its handler runs as its own task, so a slow handler never holds up
//! the next message. Every in-flight handler gets a cancellation signal;
//! stopping the listener or a transport fault fires it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::dispatch::{Dispatch, HandlerContext, HandlerRegistry};
use super::{BusError, DeliveryStream, Result, Transport};
use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::config::ListenerConfig;
use crate::delivery::{CancellationSignal, CancellationSource, Delivery, MessageContextInfo};
use crate::envelope::Envelope;
use crate::topology::validate_name;

/// Default time handlers get to finish after cancellation before they are
/// aborted.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A message whose handler had not finished when the listener aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightMessage {
    pub envelope: Envelope,
    pub context: MessageContextInfo,
}

/// Reported to `on_listen_aborted` callbacks when a transport fault ends
/// listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAborted {
    pub exchange: String,
    pub queue: String,
    pub reason: String,
    /// In delivery-tag order.
    pub messages: Vec<InFlightMessage>,
}

type AbortCallback = Arc<dyn Fn(&ListenAborted) + Send + Sync>;

struct InFlightEntry {
    message: InFlightMessage,
    cancel: CancellationSource,
}

type InFlight = Arc<Mutex<BTreeMap<u64, InFlightEntry>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, BTreeMap<u64, InFlightEntry>> {
    in_flight.lock().unwrap_or_else(|e| e.into_inner())
}

struct Running {
    shutdown: CancellationSource,
    in_flight: InFlight,
    task: JoinHandle<()>,
}

/// Consumes one queue and dispatches to typed handlers.
pub struct Listener<T: Transport + ?Sized> {
    transport: Arc<T>,
    binding: Option<(String, String)>,
    paused: watch::Sender<bool>,
    alerts: Arc<dyn AlertSink>,
    on_aborted: Vec<AbortCallback>,
    max_in_flight: Option<usize>,
    shutdown_grace: Duration,
    running: Option<Running>,
}

impl<T: Transport + ?Sized + 'static> Listener<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            transport,
            binding: None,
            paused,
            alerts: Arc::new(TracingAlertSink),
            on_aborted: Vec::new(),
            max_in_flight: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            running: None,
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Cap on concurrently running handlers. Deliveries beyond the cap stay
    /// on the queue until a handler finishes.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit.max(1));
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_config(mut self, config: &ListenerConfig) -> Self {
        self.max_in_flight = config.max_in_flight.map(|n| n.max(1));
        self.shutdown_grace = Duration::from_millis(config.shutdown_grace_ms);
        self
    }

    /// Bind to a queue. Takes effect on the next [`listen`](Self::listen).
    pub fn initialize(&mut self, exchange: impl AsRef<str>, queue: impl AsRef<str>) -> Result<()> {
        let (exchange, queue) = (exchange.as_ref(), queue.as_ref());
        validate_name("exchange", exchange)?;
        validate_name("queue", queue)?;
        debug!(exchange = %exchange, queue = %queue, "Listener initialized");
        self.binding = Some((exchange.to_string(), queue.to_string()));
        Ok(())
    }

    /// Register a callback for transport faults that end listening.
    pub fn on_listen_aborted<F>(&mut self, callback: F)
    where
        F: Fn(&ListenAborted) + Send + Sync + 'static,
    {
        self.on_aborted.push(Arc::new(callback));
    }

    /// Attach to the bound queue and start dispatching.
    ///
    /// Returns once the consumer is attached. A listener whose previous run
    /// ended (stopped or aborted) may listen again.
    pub async fn listen(&mut self, handlers: HandlerRegistry) -> Result<()> {
        let (exchange, queue) = self
            .binding
            .clone()
            .ok_or(BusError::NotInitialized("Listener"))?;
        if self.is_listening() {
            return Err(BusError::AlreadyListening);
        }

        let stream = self
            .transport
            .consume(&exchange, &queue, self.paused.subscribe())
            .await?;

        info!(
            exchange = %exchange,
            queue = %queue,
            handlers = ?handlers.tags(),
            fallback = handlers.has_fallback(),
            max_in_flight = ?self.max_in_flight,
            "Listening"
        );

        let shutdown = CancellationSource::new();
        let in_flight: InFlight = Arc::new(Mutex::new(BTreeMap::new()));
        let dispatcher = DispatchLoop {
            exchange,
            queue,
            handlers,
            alerts: Arc::clone(&self.alerts),
            on_aborted: self.on_aborted.clone(),
            limit: self.max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
            grace: self.shutdown_grace,
            in_flight: Arc::clone(&in_flight),
            tasks: JoinSet::new(),
        };
        let task = tokio::spawn(dispatcher.run(stream, shutdown.signal()));

        self.running = Some(Running {
            shutdown,
            in_flight,
            task,
        });
        Ok(())
    }

    /// Cancel in-flight handlers, detach from the queue and wait for the
    /// dispatch loop to finish. Unsettled messages are requeued.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.task.await {
            error!(error = %e, "Dispatch loop failed");
        }
        if let Some((exchange, queue)) = &self.binding {
            info!(exchange = %exchange, queue = %queue, "Stopped listening");
        }
    }

    /// Withhold deliveries while `true`. Queued messages are kept and
    /// in-flight handlers keep running.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.send_replace(paused) != paused {
            debug!(paused, "Listener pause toggled");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Whether the dispatch loop is still running.
    pub fn is_listening(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.running
            .as_ref()
            .map(|running| lock(&running.in_flight).len())
            .unwrap_or(0)
    }

    /// Bound exchange and queue, if initialized.
    pub fn binding(&self) -> Option<(&str, &str)> {
        self.binding
            .as_ref()
            .map(|(exchange, queue)| (exchange.as_str(), queue.as_str()))
    }
}

impl<T: Transport + ?Sized> Drop for Listener<T> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

impl<T: Transport + ?Sized> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("binding", &self.binding)
            .field("paused", &*self.paused.borrow())
            .field("max_in_flight", &self.max_in_flight)
            .field("running", &self.running.is_some())
            .finish()
    }
}

// ============================================================================
// Dispatch loop
// ============================================================================

enum Step {
    Shutdown,
    Delivery(Option<Result<Delivery>>),
}

/// Removes a delivery from the in-flight table when its task ends, however
/// it ends.
struct InFlightGuard {
    in_flight: InFlight,
    tag: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.tag);
    }
}

struct DispatchLoop {
    exchange: String,
    queue: String,
    handlers: HandlerRegistry,
    alerts: Arc<dyn AlertSink>,
    on_aborted: Vec<AbortCallback>,
    limit: Option<Arc<Semaphore>>,
    grace: Duration,
    in_flight: InFlight,
    tasks: JoinSet<()>,
}

impl DispatchLoop {
    async fn run(mut self, mut stream: Box<dyn DeliveryStream>, shutdown: CancellationSignal) {
        loop {
            let permit = match self.acquire(&shutdown).await {
                Some(permit) => permit,
                None => break self.drain(true).await,
            };
            match self.next_step(stream.as_mut(), &shutdown).await {
                Step::Shutdown => break self.drain(true).await,
                Step::Delivery(None) => {
                    info!(exchange = %self.exchange, queue = %self.queue, "Delivery stream closed");
                    break self.drain(false).await;
                }
                Step::Delivery(Some(Err(e))) => {
                    self.abort(&e);
                    break self.drain(true).await;
                }
                Step::Delivery(Some(Ok(delivery))) => self.dispatch(delivery, permit),
            }
        }
    }

    /// Wait for handler capacity. `None` on shutdown.
    async fn acquire(
        &mut self,
        shutdown: &CancellationSignal,
    ) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(limit) = self.limit.clone() else {
            return Some(None);
        };
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                permit = Arc::clone(&limit).acquire_owned() => return Some(permit.ok()),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_join(joined);
                }
            }
        }
    }

    async fn next_step(
        &mut self,
        stream: &mut dyn DeliveryStream,
        shutdown: &CancellationSignal,
    ) -> Step {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Step::Shutdown,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_join(joined);
                }
                next = stream.next_delivery() => return Step::Delivery(next),
            }
        }
    }

    fn dispatch(&mut self, delivery: Delivery, permit: Option<OwnedSemaphorePermit>) {
        let Delivery {
            envelope,
            context,
            ack,
        } = delivery;
        let tag = context.delivery_tag();
        let payload_type_tag = envelope.payload_type_tag().to_string();
        let message = InFlightMessage {
            envelope: envelope.clone(),
            context: context.clone(),
        };

        let cancel = CancellationSource::new();
        let ack = ack.with_cancellation(cancel.signal());
        // Held until the handler task ends, however little of its context
        // the handler keeps.
        let settlement = ack.clone();
        let ctx = HandlerContext {
            context,
            cancel: cancel.signal(),
            ack,
        };

        match self.handlers.dispatch(envelope, ctx) {
            Dispatch::Run(work) => {
                lock(&self.in_flight).insert(tag, InFlightEntry { message, cancel });
                let guard = InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    tag,
                };
                self.tasks.spawn(async move {
                    let _guard = guard;
                    let _permit = permit;
                    work.await;
                    drop(settlement);
                });
            }
            Dispatch::DecodeFailed(error) => self.alerts.alert(Alert::DecodeFailed {
                exchange: self.exchange.clone(),
                queue: self.queue.clone(),
                payload_type_tag,
                message: error.to_string(),
            }),
            Dispatch::Unhandled(payload_type_tag) => self.alerts.alert(Alert::UnhandledPayload {
                exchange: self.exchange.clone(),
                queue: self.queue.clone(),
                payload_type_tag,
            }),
        }
    }

    fn abort(&self, fault: &BusError) {
        let messages: Vec<InFlightMessage> = {
            let in_flight = lock(&self.in_flight);
            in_flight
                .values()
                .map(|entry| {
                    entry.cancel.cancel();
                    entry.message.clone()
                })
                .collect()
        };

        let aborted = ListenAborted {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            reason: fault.to_string(),
            messages,
        };
        self.alerts.alert(Alert::ListenAborted {
            exchange: aborted.exchange.clone(),
            queue: aborted.queue.clone(),
            in_flight: aborted.messages.len(),
            reason: aborted.reason.clone(),
        });
        for callback in &self.on_aborted {
            callback(&aborted);
        }
    }

    /// Wait for running handlers, cancelling them first if asked. Handlers
    /// still running after the grace period are aborted.
    async fn drain(&mut self, cancel: bool) {
        if cancel {
            for entry in lock(&self.in_flight).values() {
                entry.cancel.cancel();
            }
        }
        if self.tasks.is_empty() {
            return;
        }

        let tasks = &mut self.tasks;
        let finished = tokio::time::timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                exchange = %self.exchange,
                queue = %self.queue,
                remaining = self.tasks.len(),
                "Handlers ignored cancellation, aborting"
            );
            self.tasks.abort_all();
            while let Some(joined) = self.tasks.join_next().await {
                log_join(joined);
            }
        }
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "Handler panicked"),
        Err(e) => debug!(error = %e, "Handler task cancelled"),
    }
}

#[cfg(test)]
mod tests;
