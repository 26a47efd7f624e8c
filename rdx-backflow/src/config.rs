//! Defines all configuration structures for the Backflow engine.
//!
//! These structs are designed to be deserialized from a configuration file
//! (e.g., a TOML file) using `serde`, layered with `BACKFLOW__*` environment
//! variables. Every field has a default, so an empty or missing file yields
//! [`FlowConfig::default`].

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// The top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// What `interval` does with a tick when its consumer has no demand.
    #[serde(default)]
    pub interval_overflow: OverflowPolicy,

    /// What a hub does with an item for a downstream that has no demand.
    #[serde(default = "default_hub_overflow")]
    pub hub_overflow: OverflowPolicy,

    /// Defaults for step verification scripts.
    #[serde(default)]
    pub verifier: VerifierConfig,

    /// Structured logging setup for the binaries.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Handling of an item that arrives for a consumer with zero demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Terminate that consumer's stream with an `Overflow` error.
    Error,
    /// Skip the item for that consumer and keep going.
    Drop,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Error
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    /// Bound on a real-time script, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Demand requested on subscribe. `None` means unbounded.
    #[serde(default)]
    pub initial_request: Option<u64>,
}

impl VerifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `"info"` or `"backflow=debug"`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Whether to print the event target next to each line.
    #[serde(default)]
    pub with_target: bool,
}

impl FlowConfig {
    /// Loads configuration from an optional TOML file, then environment
    /// variables such as `BACKFLOW__VERIFIER__TIMEOUT_MS=1000`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("BACKFLOW").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

// --- Default value functions for serde ---

fn default_hub_overflow() -> OverflowPolicy {
    OverflowPolicy::Drop
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            interval_overflow: OverflowPolicy::default(),
            hub_overflow: default_hub_overflow(),
            verifier: VerifierConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            initial_request: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            with_target: false,
        }
    }
}
