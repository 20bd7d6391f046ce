//! Application configuration.
//!
//! Aggregates routing, listener, transport and topology settings into a
//! single Config struct that can be loaded from YAML files or environment
//! variables.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::bus::{InProcessConfig, InProcessTransport};
use crate::routing::Router;
use crate::topology::{ExchangeKind, Specifier, Topology, TopologyError};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "busbar.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "BUSBAR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "BUSBAR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "BUSBAR_LOG";

/// Errors from loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid topology: {0}")]
    Topology(#[from] TopologyError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Routing engine configuration.
    pub routing: RoutingConfig,
    /// Listener defaults.
    pub listener: ListenerConfig,
    /// In-process transport configuration.
    pub transport: InProcessConfig,
    /// Exchanges and queues declared at startup.
    pub topology: TopologyConfig,
}

/// Routing engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Seed for the direct-exchange tie-break. Unset means thread-local
    /// randomness.
    pub seed: Option<u64>,
}

impl RoutingConfig {
    pub fn router(&self) -> Router {
        match self.seed {
            Some(seed) => Router::seeded(seed),
            None => Router::default(),
        }
    }
}

/// Listener defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Upper bound on concurrently running handlers per listener.
    pub max_in_flight: Option<usize>,
    /// How long cancelled handlers get to exit on stop, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: None,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Declarative topology.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchanges: Vec<ExchangeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Binding patterns. Empty on a direct exchange means catch-all.
    #[serde(default)]
    pub bindings: Vec<String>,
}

impl TopologyConfig {
    /// Declare every exchange and queue through `spec`. Exchanges that
    /// already exist are redeclared, dropping their previous queues.
    pub fn apply(&self, spec: &Specifier) -> Result<(), ConfigError> {
        for exchange in &self.exchanges {
            spec.declare_exchange(&exchange.name, exchange.kind)?;
            let handle = spec.specify_exchange(&exchange.name)?;
            for queue in &exchange.queues {
                handle.declare_queue(&queue.name, &queue.bindings)?;
            }
        }
        info!(exchanges = self.exchanges.len(), "Applied topology configuration");
        Ok(())
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `busbar.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string, without file or environment
    /// layering.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Build a topology from this configuration and an in-process transport
    /// over it.
    pub fn build_in_process(&self) -> Result<(Specifier, Arc<InProcessTransport>), ConfigError> {
        let topology = Arc::new(Topology::new());
        let spec = Specifier::new(Arc::clone(&topology));
        self.topology.apply(&spec)?;
        let transport = InProcessTransport::with_config(topology, &self.transport)
            .with_router(self.routing.router());
        Ok((spec, Arc::new(transport)))
    }
}
