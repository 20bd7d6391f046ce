//! busbar-route: route inspection
//!
//! Loads a topology configuration and prints the queues a routing key would
//! reach on an exchange.
//!
//! ## Usage
//! ```text
//! busbar-route [--config PATH] EXCHANGE ROUTING_KEY
//! busbar-route [--config PATH] --list
//! ```
//!
//! ## Configuration
//! - BUSBAR_CONFIG: Path to YAML configuration (optional)
//! - BUSBAR_LOG: Log filter (default: info)

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tracing::debug;

use busbar::config::Config;
use busbar::routing::direct_candidates;
use busbar::topology::{ExchangeKind, Specifier, Topology};
use busbar::utils::bootstrap::init_tracing;

/// Print the queues a routing key reaches on a configured exchange
#[derive(Parser, Debug)]
#[command(name = "busbar-route")]
#[command(about = "Inspect routing over a configured busbar topology")]
struct Args {
    /// YAML configuration file (falls back to BUSBAR_CONFIG)
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// List declared exchanges and their queues
    #[arg(short, long, conflicts_with_all = ["exchange", "key"])]
    list: bool,

    /// Exchange to route on
    #[arg(required_unless_present = "list")]
    exchange: Option<String>,

    /// Routing key; omitted means the empty key
    key: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let spec = Specifier::new(Arc::new(Topology::new()));
    config.topology.apply(&spec)?;
    debug!(exchanges = ?spec.exchanges(), "Topology loaded");

    match args.exchange {
        None => {
            for name in spec.exchanges() {
                let Some(exchange) = spec.topology().snapshot(&name) else {
                    continue;
                };
                println!("{} ({})", exchange.name(), exchange.kind());
                for queue in exchange.queues() {
                    println!("  {} {:?}", queue.name(), queue.bindings());
                }
            }
        }
        Some(exchange) => {
            let key = args.key.unwrap_or_default();
            let snapshot = spec
                .topology()
                .snapshot(&exchange)
                .ok_or_else(|| format!("exchange '{}' is not declared", exchange))?;

            if snapshot.kind() == ExchangeKind::Direct {
                let candidates = direct_candidates(snapshot.queues(), &key);
                if candidates.len() > 1 {
                    println!("# candidates: {}", candidates.join(", "));
                }
            }

            let router = config.routing.router();
            let queues = router.route(&snapshot, &key);
            if queues.is_empty() {
                println!("# no queue matches '{}'", key);
            }
            for queue in queues {
                println!("{}", queue);
            }
        }
    }

    Ok(())
}
