//! Fluent surface used by startup code to populate a [`Topology`].
//!
//! Names are accepted as anything `AsRef<str>`, so applications can pass
//! their own enums (implementing `AsRef<str>`) instead of raw strings. The
//! string form is used verbatim as the lookup key.

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    validate_name, ExchangeDeclaration, ExchangeKind, QueueBinding, QueueView, Topology,
    TopologyError,
};

/// Writer/reader facade over a shared [`Topology`].
#[derive(Debug, Clone)]
pub struct Specifier {
    topology: Arc<Topology>,
}

impl Specifier {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Create or replace an exchange. Replacing discards every queue that was
    /// attached to the previous declaration.
    pub fn declare_exchange(
        &self,
        name: impl AsRef<str>,
        kind: ExchangeKind,
    ) -> Result<(), TopologyError> {
        let name = name.as_ref();
        validate_name("exchange", name)?;

        let replaced = self.topology.snapshot(name).is_some();
        let incarnation = self
            .topology
            .insert_exchange(ExchangeDeclaration::new(name, kind));

        info!(exchange = %name, kind = %kind, replaced, incarnation, "Declared exchange");
        Ok(())
    }

    /// Remove an exchange and all its queues. Unknown exchanges are a no-op.
    pub fn delete_exchange(&self, name: impl AsRef<str>) -> Result<(), TopologyError> {
        let name = name.as_ref();
        validate_name("exchange", name)?;

        if self.topology.remove_exchange(name) {
            info!(exchange = %name, "Deleted exchange");
        } else {
            debug!(exchange = %name, "Delete of unknown exchange ignored");
        }
        Ok(())
    }

    /// Open a handle on a declared exchange.
    pub fn specify_exchange(&self, name: impl AsRef<str>) -> Result<ExchangeHandle, TopologyError> {
        let name = name.as_ref();
        validate_name("exchange", name)?;

        let Some(snapshot) = self.topology.snapshot(name) else {
            return Err(TopologyError::Configuration(format!(
                "exchange '{}' is not declared",
                name
            )));
        };

        Ok(ExchangeHandle {
            topology: Arc::clone(&self.topology),
            exchange: name.to_string(),
            incarnation: snapshot.incarnation(),
        })
    }

    /// Declared exchange names, sorted.
    pub fn exchanges(&self) -> Vec<String> {
        self.topology.exchanges()
    }
}

/// Queue-level operations scoped to one exchange.
///
/// A handle is bound to the declaration it was opened on. Once that exchange
/// is deleted or redeclared, `declare_queue` fails with
/// [`TopologyError::Configuration`], `delete_queue` does nothing and reads
/// return nothing; open a new handle to reach the new declaration.
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
    topology: Arc<Topology>,
    exchange: String,
    incarnation: u64,
}

impl ExchangeHandle {
    pub fn name(&self) -> &str {
        &self.exchange
    }

    pub fn kind(&self) -> Option<ExchangeKind> {
        self.snapshot().map(|e| e.kind())
    }

    /// Attach a queue, or replace the bindings of an existing one.
    pub fn declare_queue<I, S>(&self, name: impl AsRef<str>, bindings: I) -> Result<(), TopologyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.as_ref();
        validate_name("queue", name)?;

        let queue = QueueBinding::new(name, bindings);
        debug!(
            exchange = %self.exchange,
            queue = %name,
            bindings = ?queue.bindings(),
            "Declaring queue"
        );
        self.topology
            .upsert_queue(&self.exchange, self.incarnation, queue)
    }

    /// Detach a queue. Unknown queues are a no-op.
    pub fn delete_queue(&self, name: impl AsRef<str>) -> Result<(), TopologyError> {
        let name = name.as_ref();
        validate_name("queue", name)?;

        let removed = self
            .topology
            .remove_queue(&self.exchange, self.incarnation, name);
        if removed {
            info!(exchange = %self.exchange, queue = %name, "Deleted queue");
        }
        Ok(())
    }

    pub fn specify_queue(&self, name: impl AsRef<str>) -> Option<QueueView> {
        self.snapshot()
            .and_then(|e| e.queue(name.as_ref()).cloned())
    }

    pub fn queues(&self) -> Vec<QueueView> {
        self.snapshot()
            .map(|e| e.queues().to_vec())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Option<Arc<ExchangeDeclaration>> {
        self.topology.snapshot_of(&self.exchange, self.incarnation)
    }
}
