//! Application-wide alerting sink.
//!
//! Listeners report decode failures, unroutable payload tags and transport
//! aborts here. Reporting is fire-and-forget: implementations must not block
//! and must not fail the caller.

use std::sync::{Arc, Mutex};

use tracing::{error, warn};

/// Something an operator should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// Payload could not be decoded; the message was dead-lettered.
    DecodeFailed {
        exchange: String,
        queue: String,
        payload_type_tag: String,
        message: String,
    },
    /// No handler or fallback registered for the payload tag.
    UnhandledPayload {
        exchange: String,
        queue: String,
        payload_type_tag: String,
    },
    /// Transport fault ended a listener.
    ListenAborted {
        exchange: String,
        queue: String,
        in_flight: usize,
        reason: String,
    },
}

pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Default sink: structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, alert: Alert) {
        match alert {
            Alert::DecodeFailed {
                exchange,
                queue,
                payload_type_tag,
                message,
            } => warn!(
                exchange = %exchange,
                queue = %queue,
                payload_type_tag = %payload_type_tag,
                error = %message,
                "Failed to decode payload"
            ),
            Alert::UnhandledPayload {
                exchange,
                queue,
                payload_type_tag,
            } => warn!(
                exchange = %exchange,
                queue = %queue,
                payload_type_tag = %payload_type_tag,
                "No handler registered for payload type"
            ),
            Alert::ListenAborted {
                exchange,
                queue,
                in_flight,
                reason,
            } => error!(
                exchange = %exchange,
                queue = %queue,
                in_flight,
                reason = %reason,
                "Listener aborted by transport fault"
            ),
        }
    }
}

/// Sink that keeps alerts in memory, for tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn alert(&self, alert: Alert) {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alert);
    }
}
