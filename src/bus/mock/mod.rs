//! Mock transport implementation for testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use super::{BusError, DeliveryStream, OutboundMessage, PublishReceipt, Result, Transport};

/// Mock transport for testing publishers.
#[derive(Default)]
pub struct MockTransport {
    published: Mutex<Vec<OutboundMessage>>,
    fail_on_publish: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> usize {
        self.published().len()
    }

    pub fn take_published(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.published())
    }

    fn published(&self) -> std::sync::MutexGuard<'_, Vec<OutboundMessage>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn publish(&self, message: OutboundMessage) -> Result<PublishReceipt> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Transport("Mock publish failure".to_string()));
        }
        self.published().push(message);
        Ok(PublishReceipt {
            message_id: Uuid::new_v4(),
            queues: Vec::new(),
        })
    }

    async fn consume(
        &self,
        _exchange: &str,
        _queue: &str,
        _paused: watch::Receiver<bool>,
    ) -> Result<Box<dyn DeliveryStream>> {
        Err(BusError::ConsumeNotSupported)
    }
}
