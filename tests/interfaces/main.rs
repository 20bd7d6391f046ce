//! Interface tests for the routing engine and message delivery using Cucumber.
//!
//! ```bash
//! cargo test --test interfaces --features test-utils
//! ```

mod steps;

use cucumber::World;
use steps::delivery::DeliveryWorld;
use steps::routing::RoutingWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Routing Interface Tests ===\n");
    RoutingWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/routing.feature")
        .await;

    println!("\n=== Running Delivery Interface Tests ===\n");
    DeliveryWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/delivery.feature")
        .await;
}
