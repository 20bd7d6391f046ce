//! Routing engine step definitions.

use std::sync::Arc;

use busbar::routing::Router;
use busbar::topology::{ExchangeKind, Specifier, Topology};
use cucumber::{given, then, when, World};

/// Test context for routing scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct RoutingWorld {
    spec: Specifier,
    exchange: Option<String>,
    router: Router,
    seed: Option<u64>,
    routed: Vec<(String, Vec<String>)>,
}

impl RoutingWorld {
    fn new() -> Self {
        Self {
            spec: Specifier::new(Arc::new(Topology::new())),
            exchange: None,
            router: Router::default(),
            seed: None,
            routed: Vec::new(),
        }
    }

    fn exchange(&self) -> &str {
        self.exchange.as_deref().expect("No exchange declared")
    }

    fn route_with(&self, router: &Router, key: &str) -> Vec<String> {
        let snapshot = self
            .spec
            .topology()
            .snapshot(self.exchange())
            .expect("Exchange missing from topology");
        router.route(&snapshot, key)
    }
}

fn parse_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        other => panic!("Unknown exchange kind: {}", other),
    }
}

fn parse_queues(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(String::from)
        .collect()
}

// --- Given steps ---

#[given(expr = "a {word} exchange {string}")]
async fn given_exchange(world: &mut RoutingWorld, kind: String, name: String) {
    world
        .spec
        .declare_exchange(&name, parse_kind(&kind))
        .expect("Failed to declare exchange");
    world.exchange = Some(name);
}

#[given(expr = "queue {string} bound to {string}")]
async fn given_bound_queue(world: &mut RoutingWorld, queue: String, binding: String) {
    world
        .spec
        .specify_exchange(world.exchange())
        .expect("Exchange not declared")
        .declare_queue(&queue, [binding])
        .expect("Failed to declare queue");
}

#[given(expr = "queue {string} with no bindings")]
async fn given_catch_all_queue(world: &mut RoutingWorld, queue: String) {
    world
        .spec
        .specify_exchange(world.exchange())
        .expect("Exchange not declared")
        .declare_queue(&queue, Vec::<String>::new())
        .expect("Failed to declare queue");
}

#[given(expr = "the router is seeded with {int}")]
async fn given_seeded_router(world: &mut RoutingWorld, seed: u64) {
    world.router = Router::seeded(seed);
    world.seed = Some(seed);
}

// --- When steps ---

#[when(expr = "I route {string}")]
async fn when_route(world: &mut RoutingWorld, key: String) {
    let routed = world.route_with(&world.router, &key);
    world.routed.push((key, routed));
}

#[when(expr = "I route {string} {int} times")]
async fn when_route_many(world: &mut RoutingWorld, key: String, times: usize) {
    for _ in 0..times {
        let routed = world.route_with(&world.router, &key);
        world.routed.push((key.clone(), routed));
    }
}

#[when(expr = "the exchange {string} is redeclared as {word}")]
async fn when_redeclared(world: &mut RoutingWorld, name: String, kind: String) {
    world
        .spec
        .declare_exchange(&name, parse_kind(&kind))
        .expect("Failed to redeclare exchange");
}

// --- Then steps ---

#[then(expr = "the message reaches {string}")]
async fn then_reaches(world: &mut RoutingWorld, expected: String) {
    let (_, last) = world.routed.last().expect("Nothing routed");
    assert_eq!(last, &parse_queues(&expected));
}

#[then(expr = "the router counted {int} miss(es)")]
async fn then_misses(world: &mut RoutingWorld, misses: u64) {
    assert_eq!(world.router.stats().misses(), misses);
}

#[then(expr = "every message reached exactly one of {string}")]
async fn then_exactly_one(world: &mut RoutingWorld, candidates: String) {
    let candidates = parse_queues(&candidates);
    assert!(!world.routed.is_empty());
    for (_, routed) in &world.routed {
        assert_eq!(routed.len(), 1, "Expected one queue, got {:?}", routed);
        assert!(candidates.contains(&routed[0]));
    }
}

#[then(expr = "the picks repeat under seed {int}")]
async fn then_reproducible(world: &mut RoutingWorld, seed: u64) {
    assert_eq!(world.seed, Some(seed));
    let replay = Router::seeded(seed);
    for (key, routed) in &world.routed {
        assert_eq!(&world.route_with(&replay, key), routed);
    }
}
