use std::time::Duration;

use serde::Deserialize;

use crate::flow::FlowControlConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Sharding nodes, each a database on a master with optional read replicas
    #[serde(default)]
    pub nodes: Vec<ShardingNodeConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub flow_control: FlowControlConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
}

impl Config {
    /// Look up a sharding node by name
    pub fn node(&self, name: &str) -> Option<&ShardingNodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

// ============================================================================
// Sharding nodes
// ============================================================================

/// One sharding node: a physical database on a master instance
#[derive(Debug, Clone, Deserialize)]
pub struct ShardingNodeConfig {
    /// Node name referenced by route results (e.g., "dn1")
    pub name: String,
    /// Physical database the node maps to
    pub database: String,
    pub master: BackendConfig,
    /// Read replicas, used when a statement is routed to a slave
    #[serde(default)]
    pub slaves: Vec<BackendConfig>,
}

impl ShardingNodeConfig {
    pub fn has_slaves(&self) -> bool {
        !self.slaves.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl BackendConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Idle connection pool limits, applied per backend instance
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of idle connections to keep
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Maximum connection age before recycling (seconds)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Maximum idle time before closing (seconds)
    #[serde(default = "default_max_idle_time_secs")]
    pub max_idle_time_secs: u64,
}

fn default_max_idle() -> usize {
    10
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_max_idle_time_secs() -> u64 {
    300
}

impl PoolConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_age_secs: default_max_age_secs(),
            max_idle_time_secs: default_max_idle_time_secs(),
        }
    }
}

// ============================================================================
// Statistics / frontend
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StatisticsConfig {
    /// Whether completed queries are recorded
    #[serde(default = "default_statistics_enabled")]
    pub enabled: bool,
}

fn default_statistics_enabled() -> bool {
    true
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: default_statistics_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendConfig {
    /// Size of one client write buffer; fuller buffers are queued
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    16 * 1024
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}
