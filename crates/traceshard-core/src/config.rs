// CONFIGURATION
// Defaults, optional file (TOML / YAML / JSON) and TRACESHARD__* environment
// overrides, layered with the `config` crate and validated once at load.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Identity used for automated sends (background rebalancing)
    pub service_account: String,

    /// Gas budget attached to every send
    pub gas_limit: u64,

    /// Caller-side bound on a send; `None` waits indefinitely
    pub command_timeout_ms: Option<u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            service_account: "0x00000000000000000000000000000000005e7c1e".to_string(),
            gas_limit: 500_000,
            command_timeout_ms: Some(30_000),
        }
    }
}

impl LedgerConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Resource units that make up one capacity slot
    pub resource_units_per_slot: f64,

    /// Share of each shard's capacity held back from requests below `high_priority_threshold`
    pub reserved_headroom_ratio: f64,

    pub high_priority_threshold: u8,

    /// Recommend-then-assign attempts before giving up on a racing shard
    pub max_placement_attempts: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            resource_units_per_slot: 1.0,
            reserved_headroom_ratio: 0.0,
            high_priority_threshold: 8,
            max_placement_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Lifetime of the off-ledger stats mirror
    pub cache_ttl_secs: u64,

    /// Refuse metrics reports older than the snapshot already on the ledger
    pub reject_stale_metrics: bool,

    /// Weight of mean shard efficiency in the system score; the rest is load balance
    pub efficiency_weight: f64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        AccountingConfig {
            cache_ttl_secs: 60,
            reject_stale_metrics: true,
            efficiency_weight: 0.7,
        }
    }
}

impl AccountingConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    /// Shards above this load ratio shed records
    pub high_load_ratio: f64,

    /// Shards below this load ratio receive records
    pub low_load_ratio: f64,

    /// Allowed distance from the type-wide load ratio after a pass
    pub tolerance: f64,

    pub max_moves_per_pass: usize,

    /// Run a pass on this interval; `None` leaves rebalancing to admins
    pub auto_interval_secs: Option<u64>,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        RebalancerConfig {
            high_load_ratio: 0.8,
            low_load_ratio: 0.5,
            tolerance: 0.05,
            max_moves_per_pass: 100,
            auto_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceShardConfig {
    pub ledger: LedgerConfig,
    pub selector: SelectorConfig,
    pub accounting: AccountingConfig,
    pub rebalancer: RebalancerConfig,
}

impl TraceShardConfig {
    /// Load from an optional file, then `TRACESHARD__SECTION__KEY` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TRACESHARD")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: TraceShardConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.ledger.gas_limit == 0 {
            return invalid("ledger.gas_limit must be positive");
        }
        if self.ledger.service_account.trim().is_empty() {
            return invalid("ledger.service_account is empty");
        }
        if self.ledger.command_timeout_ms == Some(0) {
            return invalid("ledger.command_timeout_ms must be positive when set");
        }

        let s = &self.selector;
        if !(s.resource_units_per_slot.is_finite() && s.resource_units_per_slot > 0.0) {
            return invalid("selector.resource_units_per_slot must be positive");
        }
        if !(0.0..1.0).contains(&s.reserved_headroom_ratio) {
            return invalid("selector.reserved_headroom_ratio must be within [0, 1)");
        }
        if !(1..=10).contains(&s.high_priority_threshold) {
            return invalid("selector.high_priority_threshold must be within 1..=10");
        }
        if s.max_placement_attempts == 0 {
            return invalid("selector.max_placement_attempts must be positive");
        }

        let a = &self.accounting;
        if a.cache_ttl_secs == 0 {
            return invalid("accounting.cache_ttl_secs must be positive");
        }
        if !(a.efficiency_weight > 0.0 && a.efficiency_weight < 1.0) {
            return invalid("accounting.efficiency_weight must be within (0, 1)");
        }

        let r = &self.rebalancer;
        if !(r.low_load_ratio > 0.0 && r.low_load_ratio < r.high_load_ratio && r.high_load_ratio <= 1.0) {
            return invalid("rebalancer thresholds must satisfy 0 < low_load_ratio < high_load_ratio <= 1");
        }
        if !(0.0..=0.5).contains(&r.tolerance) {
            return invalid("rebalancer.tolerance must be within [0, 0.5]");
        }
        if r.max_moves_per_pass == 0 {
            return invalid("rebalancer.max_moves_per_pass must be positive");
        }
        if r.auto_interval_secs == Some(0) {
            return invalid("rebalancer.auto_interval_secs must be positive when set");
        }
        Ok(())
    }
}
