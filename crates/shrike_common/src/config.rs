//! Gateway configuration.
//!
//! Constructed once at startup (from flags or a TOML section) and injected
//! into the gateway; the core holds no process-wide mutable settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::types::TabletType;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Cells whose tablets feed the health view. Empty means the local cell
    /// only. Consumed by the health-check collaborator; recorded here so
    /// operators see the effective watch set in one place.
    #[serde(default)]
    pub cells_to_watch: Vec<String>,

    /// Upper bound for the startup barrier that waits for serving tablets.
    #[serde(default = "default_initial_tablet_timeout_ms")]
    pub initial_tablet_timeout_ms: u64,

    /// Number of *additional* attempts beyond the first for a retryable
    /// failure.
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,

    /// Tablet types this gateway will serve. Empty means all types.
    #[serde(default)]
    pub allowed_tablet_types: Vec<TabletType>,

    /// Listen address for the debug HTTP endpoint. Empty disables it.
    #[serde(default)]
    pub debug_listen_addr: String,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,
}

fn default_initial_tablet_timeout_ms() -> u64 {
    30_000
}

fn default_retry_count() -> usize {
    2
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cells_to_watch: Vec::new(),
            initial_tablet_timeout_ms: default_initial_tablet_timeout_ms(),
            retry_count: default_retry_count(),
            allowed_tablet_types: Vec::new(),
            debug_listen_addr: String::new(),
            buffer: BufferConfig::default(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn initial_tablet_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_tablet_timeout_ms)
    }

    /// Cross-field validation. Called once when the gateway is constructed.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.balancer.enabled && self.balancer.vtgate_cells.is_empty() {
            return Err(GatewayError::failed_precondition(
                "balancer.vtgate_cells is required when the balancer is enabled",
            ));
        }
        if self.buffer.enabled && self.buffer.max_size == 0 {
            return Err(GatewayError::failed_precondition(
                "buffer.max_size must be at least 1 when buffering is enabled",
            ));
        }
        if self.buffer.enabled && self.buffer.window_ms == 0 {
            return Err(GatewayError::failed_precondition(
                "buffer.window_ms must be non-zero when buffering is enabled",
            ));
        }
        Ok(())
    }
}

/// Failover buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Whether primary failover buffering is enabled at all.
    pub enabled: bool,
    /// Maximum time a request may stay parked waiting for the failover to
    /// end.
    pub window_ms: u64,
    /// Maximum number of parked requests per shard.
    pub max_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 10_000,
            max_size: 1000,
        }
    }
}

impl BufferConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Tablet balancer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Switch from cell-biased random selection to the proportional
    /// balancer.
    pub enabled: bool,
    /// Cells that contain peer query routers. Required when enabled; the
    /// balancer spreads each router's outflow so every tablet in the fleet
    /// receives the same absolute load.
    #[serde(default)]
    pub vtgate_cells: Vec<String>,
    /// Keyspaces routed through the balancer. Empty means all keyspaces.
    #[serde(default)]
    pub keyspaces: Vec<String>,
}

impl BalancerConfig {
    /// Whether `keyspace` is routed through the balancer.
    pub fn applies_to(&self, keyspace: &str) -> bool {
        self.enabled && (self.keyspaces.is_empty() || self.keyspaces.iter().any(|k| k == keyspace))
    }
}

/// Split a comma-separated flag value into trimmed, non-empty items.
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
