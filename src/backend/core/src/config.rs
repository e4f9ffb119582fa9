//! Configuration management.

use std::time::Duration;

use serde::Deserialize;

use crate::bundle::BundleOptions;
use crate::error::Result;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Event store configuration
    #[serde(default)]
    pub event_store: EventStoreConfig,

    /// Controller configuration
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Component switches
    #[serde(default)]
    pub bundle: BundleOptions,

    /// Observability configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Which streaming backend carries the event log.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process streaming log (not durable across restarts)
    #[default]
    Memory,
    /// Redis Streams, one stream per subject
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Backend selection
    #[serde(default)]
    pub kind: TransportKind,

    /// Connection URL (Redis backend)
    #[serde(default = "default_transport_url")]
    pub url: String,

    /// Cluster the client joins
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Client name presented to the cluster
    #[serde(default = "default_client")]
    pub client: String,

    /// Prefix for every stream key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often polling subscriptions look for new messages
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            url: default_transport_url(),
            cluster: default_cluster(),
            client: default_client(),
            key_prefix: default_key_prefix(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventStoreConfig {
    /// Per-subscriber buffer of the internal fan-out
    #[serde(default = "default_fanout_buffer")]
    pub fanout_buffer: usize,

    /// Per-subscription buffer requested from the transport
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            fanout_buffer: default_fanout_buffer(),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Upper bound on action refinement steps
    #[serde(default = "default_max_convergence_iterations")]
    pub max_convergence_iterations: usize,

    /// Evaluations allowed to run at once across aggregates
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,

    /// Age after which an unfinished aggregate is failed
    #[serde(default = "default_evaluation_timeout", with = "humantime_serde")]
    pub evaluation_timeout: Duration,

    /// Failure events tolerated before an aggregate is failed
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// First backoff delay after a failure
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Largest backoff delay
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_convergence_iterations: default_max_convergence_iterations(),
            max_concurrent_evaluations: default_max_concurrent_evaluations(),
            evaluation_timeout: default_evaluation_timeout(),
            max_errors: default_max_errors(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level / EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format
    #[serde(default)]
    pub log_format: crate::telemetry::LogFormat,

    /// Install the Prometheus recorder
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Prometheus listener address
    #[serde(default = "default_metrics_endpoint")]
    pub metrics_endpoint: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: Default::default(),
            metrics_enabled: false,
            metrics_endpoint: default_metrics_endpoint(),
        }
    }
}

// Default value functions
fn default_transport_url() -> String { "redis://localhost:6379".to_string() }
fn default_cluster() -> String { "fes-cluster".to_string() }
fn default_client() -> String { "fes".to_string() }
fn default_key_prefix() -> String { "fes:".to_string() }
fn default_poll_interval() -> Duration { Duration::from_millis(100) }
fn default_fanout_buffer() -> usize { 1024 }
fn default_subscription_buffer() -> usize { 4096 }
fn default_max_convergence_iterations() -> usize { 16 }
fn default_max_concurrent_evaluations() -> usize { 64 }
fn default_evaluation_timeout() -> Duration { Duration::from_secs(600) }
fn default_max_errors() -> usize { 3 }
fn default_backoff_base() -> Duration { Duration::from_millis(500) }
fn default_backoff_max() -> Duration { Duration::from_secs(30) }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_endpoint() -> String { "0.0.0.0:9090".to_string() }

impl Config {
    /// Load configuration from the environment (`TRIBUTARY__SECTION__KEY`).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TRIBUTARY").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TRIBUTARY").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        use crate::error::TributaryError;

        if self.controller.max_convergence_iterations == 0 {
            return Err(TributaryError::configuration(
                "controller.max_convergence_iterations must be at least 1",
            ));
        }
        if self.controller.max_concurrent_evaluations == 0 {
            return Err(TributaryError::configuration(
                "controller.max_concurrent_evaluations must be at least 1",
            ));
        }
        if self.event_store.fanout_buffer == 0 || self.event_store.subscription_buffer == 0 {
            return Err(TributaryError::configuration("event_store buffers must be non-zero"));
        }
        if self.controller.backoff_base > self.controller.backoff_max {
            return Err(TributaryError::configuration(
                "controller.backoff_base must not exceed controller.backoff_max",
            ));
        }
        Ok(())
    }
}
