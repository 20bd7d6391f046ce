//! Routing engine.
//!
//! Given a routing key and an exchange's queue set, decide which queues
//! receive a message:
//!
//! - **Direct**: queues with no bindings, or a binding equal to the key
//!   (case-insensitive). Several matches compete; exactly one is chosen at
//!   random.
//! - **Fanout**: every attached queue.
//! - **Topic**: every queue with at least one binding that matches the key
//!   under the `*` / `#` wildcard grammar (see [`topic_matches`]).
//!
//! The functions here are pure apart from drawing from the injected
//! [`RandomSource`]; transports apply them, consumers never do.

mod random;

pub use random::{RandomSource, SeededRandom, ThreadRandom};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::topology::{ExchangeDeclaration, ExchangeKind, QueueBinding};

/// Topic wildcard matching one segment.
pub const SINGLE_SEGMENT_WILDCARD: &str = "*";
/// Topic wildcard matching the rest of the key.
pub const MULTI_SEGMENT_WILDCARD: &str = "#";

/// Does a topic `binding` pattern match `key`?
///
/// Both are split on `.`. Walking the key's segments, a `*` consumes one
/// segment, a `#` matches everything that remains, and any other segment
/// must be equal (case-sensitive). A binding with more segments than the key
/// only matches if the sole leftover segment is `#`.
pub fn topic_matches(binding: &str, key: &str) -> bool {
    if binding == MULTI_SEGMENT_WILDCARD {
        return true;
    }

    let pattern: Vec<&str> = binding.split('.').collect();
    let segments: Vec<&str> = key.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        // Key longer than pattern: nothing left to match against.
        let Some(expected) = pattern.get(i) else {
            return false;
        };
        match *expected {
            SINGLE_SEGMENT_WILDCARD => continue,
            MULTI_SEGMENT_WILDCARD => return true,
            literal if literal == *segment => continue,
            _ => return false,
        }
    }

    matches!(&pattern[segments.len()..], [] | [MULTI_SEGMENT_WILDCARD])
}

/// Direct binding comparison: case-insensitive, locale-independent.
pub fn direct_matches(binding: &str, key: &str) -> bool {
    binding == key || binding.to_lowercase() == key.to_lowercase()
}

/// Queues eligible for a Direct publish, before the tie-break.
pub fn direct_candidates<'a>(queues: &'a [QueueBinding], key: &str) -> Vec<&'a str> {
    distinct(
        queues
            .iter()
            .filter(|q| q.is_catch_all() || q.bindings().iter().any(|b| direct_matches(b, key)))
            .map(QueueBinding::name),
    )
}

/// Queues matched by a Topic publish.
pub fn topic_candidates<'a>(queues: &'a [QueueBinding], key: &str) -> Vec<&'a str> {
    distinct(
        queues
            .iter()
            .filter(|q| q.bindings().iter().any(|b| topic_matches(b, key)))
            .map(QueueBinding::name),
    )
}

/// Compute the ordered, duplicate-free set of queue names for one publish.
///
/// An empty result means the exchange drops the message; that is expected
/// behavior, not an error.
pub fn route(
    kind: ExchangeKind,
    queues: &[QueueBinding],
    key: &str,
    random: &dyn RandomSource,
) -> Vec<String> {
    match kind {
        ExchangeKind::Fanout => distinct(queues.iter().map(QueueBinding::name))
            .into_iter()
            .map(str::to_string)
            .collect(),
        ExchangeKind::Topic => topic_candidates(queues, key)
            .into_iter()
            .map(str::to_string)
            .collect(),
        ExchangeKind::Direct => {
            let candidates = direct_candidates(queues, key);
            match candidates.len() {
                0 => Vec::new(),
                1 => vec![candidates[0].to_string()],
                n => vec![candidates[random.pick(n).min(n - 1)].to_string()],
            }
        }
    }
}

fn distinct<'a>(names: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Counters for routing decisions.
#[derive(Debug, Default)]
pub struct RoutingStats {
    /// Publishes that reached at least one queue.
    pub routed: AtomicU64,
    /// Publishes no queue matched (silently dropped by the exchange).
    pub misses: AtomicU64,
}

impl RoutingStats {
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.routed.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Routing engine with an injected random source and miss accounting.
pub struct Router {
    random: Arc<dyn RandomSource>,
    stats: RoutingStats,
}

impl Router {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self {
            random,
            stats: RoutingStats::default(),
        }
    }

    /// Router whose Direct tie-breaks are reproducible.
    pub fn seeded(seed: u64) -> Self {
        Self::new(Arc::new(SeededRandom::new(seed)))
    }

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    /// Route one publish against an exchange snapshot.
    pub fn route(&self, exchange: &ExchangeDeclaration, key: &str) -> Vec<String> {
        let queues = route(exchange.kind(), exchange.queues(), key, self.random.as_ref());

        if queues.is_empty() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!(
                exchange = %exchange.name(),
                kind = %exchange.kind(),
                routing_key = %key,
                "No queue matched routing key, message dropped"
            );
        } else {
            self.stats.routed.fetch_add(1, Ordering::Relaxed);
        }

        queues
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRandom))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("stats", &self.stats).finish()
    }
}
