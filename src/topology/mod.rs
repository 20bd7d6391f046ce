//! Declarative exchange → queue → binding graph.
//!
//! [`Topology`] is an owned registry, shared by `Arc` between the
//! [`Specifier`] (writers) and transports doing route lookups (readers).
//! Each exchange is stored as an immutable `Arc<ExchangeDeclaration>`
//! snapshot; mutations build a new snapshot and swap it in under the write
//! lock, so a reader holding a snapshot never observes a half-applied
//! change.

mod specifier;

pub use specifier::{ExchangeHandle, Specifier};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;

/// Routing semantics of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Competing consumers: one matching queue wins.
    Direct,
    /// Broadcast to every attached queue.
    Fanout,
    /// Dot-segmented wildcard matching (`*`, `#`).
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        };
        f.write_str(name)
    }
}

/// Errors reported synchronously by topology mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TopologyError {
    fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// A queue attached to an exchange, with its binding patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    name: String,
    bindings: Vec<String>,
    incarnation: u64,
}

/// Read-only view handed out by the specifier API.
pub type QueueView = QueueBinding;

impl QueueBinding {
    /// Create a binding set; duplicates are collapsed keeping first occurrence.
    pub fn new<I, S>(name: impl Into<String>, bindings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<String> = Vec::new();
        for binding in bindings {
            let binding = binding.as_ref();
            if !unique.iter().any(|b| b == binding) {
                unique.push(binding.to_string());
            }
        }
        Self {
            name: name.into(),
            bindings: unique,
            incarnation: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bindings(&self) -> &[String] {
        &self.bindings
    }

    /// Identity of this queue's declaration. Stable across rebinding; a queue
    /// that is deleted (or loses its exchange) and declared again gets a new
    /// one. Zero until the queue is attached to a [`Topology`].
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Direct-exchange catch-all: no bindings at all.
    pub fn is_catch_all(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// An exchange and the queues currently attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    name: String,
    kind: ExchangeKind,
    queues: Vec<QueueBinding>,
    incarnation: u64,
}

impl ExchangeDeclaration {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            queues: Vec::new(),
            incarnation: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Identity of this declaration. Every `declare_exchange` gets a new
    /// one, even under a name that already exists. Zero until inserted into
    /// a [`Topology`].
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Attached queues in declaration order.
    pub fn queues(&self) -> &[QueueBinding] {
        &self.queues
    }

    pub fn queue(&self, name: &str) -> Option<&QueueBinding> {
        self.queues.iter().find(|q| q.name == name)
    }

    fn with_queue(&self, mut queue: QueueBinding, fresh_incarnation: u64) -> Self {
        let mut next = self.clone();
        match next.queues.iter_mut().find(|q| q.name == queue.name) {
            Some(existing) => {
                queue.incarnation = existing.incarnation;
                *existing = queue;
            }
            None => {
                queue.incarnation = fresh_incarnation;
                next.queues.push(queue);
            }
        }
        next
    }

    fn without_queue(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.queues.retain(|q| q.name != name);
        next
    }
}

/// Reject names a broker could not address.
pub(crate) fn validate_name(what: &str, name: &str) -> Result<(), TopologyError> {
    if name.trim().is_empty() {
        return Err(TopologyError::configuration(format!(
            "{} name must not be empty",
            what
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(TopologyError::configuration(format!(
            "{} name '{}' contains control characters",
            what,
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Owned registry of exchange declarations.
#[derive(Default)]
pub struct Topology {
    exchanges: RwLock<HashMap<String, Arc<ExchangeDeclaration>>>,
    incarnations: AtomicU64,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot of one exchange.
    pub fn snapshot(&self, exchange: &str) -> Option<Arc<ExchangeDeclaration>> {
        self.read().get(exchange).cloned()
    }

    /// Declared exchange names, sorted.
    pub fn exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_queue(&self, exchange: &str, queue: &str) -> bool {
        self.read()
            .get(exchange)
            .is_some_and(|e| e.queue(queue).is_some())
    }

    /// Incarnation of a declared queue, if it exists.
    pub fn queue_incarnation(&self, exchange: &str, queue: &str) -> Option<u64> {
        self.read()
            .get(exchange)
            .and_then(|e| e.queue(queue))
            .map(QueueBinding::incarnation)
    }

    /// Insert (or replace) an exchange and return its incarnation.
    pub(crate) fn insert_exchange(&self, mut declaration: ExchangeDeclaration) -> u64 {
        let mut guard = self.write();
        declaration.incarnation = self.next_incarnation();
        let incarnation = declaration.incarnation;
        guard.insert(declaration.name.clone(), Arc::new(declaration));
        incarnation
    }

    /// Snapshot of an exchange, only while it is still the declaration
    /// identified by `incarnation`.
    pub(crate) fn snapshot_of(
        &self,
        exchange: &str,
        incarnation: u64,
    ) -> Option<Arc<ExchangeDeclaration>> {
        self.snapshot(exchange).filter(|e| e.incarnation == incarnation)
    }

    pub(crate) fn remove_exchange(&self, exchange: &str) -> bool {
        self.write().remove(exchange).is_some()
    }

    pub(crate) fn upsert_queue(
        &self,
        exchange: &str,
        exchange_incarnation: u64,
        queue: QueueBinding,
    ) -> Result<(), TopologyError> {
        let mut guard = self.write();
        let current = guard.get(exchange).ok_or_else(|| {
            TopologyError::configuration(format!("exchange '{}' is not declared", exchange))
        })?;
        if current.incarnation != exchange_incarnation {
            return Err(TopologyError::configuration(format!(
                "exchange '{}' was redeclared",
                exchange
            )));
        }
        let fresh = self.next_incarnation();
        let next = Arc::new(current.with_queue(queue, fresh));
        guard.insert(exchange.to_string(), next);
        Ok(())
    }

    /// Detach a queue from the declaration identified by
    /// `exchange_incarnation`. Returns whether anything was removed.
    pub(crate) fn remove_queue(
        &self,
        exchange: &str,
        exchange_incarnation: u64,
        queue: &str,
    ) -> bool {
        let mut guard = self.write();
        let Some(current) = guard.get(exchange) else {
            return false;
        };
        if current.incarnation != exchange_incarnation || current.queue(queue).is_none() {
            return false;
        }
        let next = Arc::new(current.without_queue(queue));
        guard.insert(exchange.to_string(), next);
        true
    }

    // Exchanges and queues draw from one counter, so zero is never issued.
    fn next_incarnation(&self) -> u64 {
        self.incarnations.fetch_add(1, Ordering::Relaxed) + 1
    }

    // Snapshots are swapped whole, so a poisoned lock still guards a
    // consistent map.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ExchangeDeclaration>>> {
        self.exchanges.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ExchangeDeclaration>>> {
        self.exchanges.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("exchanges", &self.exchanges())
            .finish()
    }
}
