// SIMULATION SCENARIO
// YAML description of a shard layout to seed an in-memory ledger with

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use traceshard_core::{Caller, CreateShardRequest, ShardingService};
use traceshard_ledger::{LedgerClient, MetricsUpdate, RecordId, ShardId, ShardType, TxContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardEntry {
    #[serde(rename = "type")]
    pub shard_type: ShardType,

    #[serde(default = "default_contract_ref")]
    pub contract_ref: String,

    pub min_capacity: u64,
    pub max_capacity: u64,
    pub region: String,

    #[serde(default = "default_true")]
    pub activate: bool,

    /// Records already on the shard before the simulation starts
    #[serde(default)]
    pub preload: u64,

    #[serde(default)]
    pub metrics: Option<MetricsEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsEntry {
    pub total_transactions: u64,
    pub avg_response_time_ms: f64,
    pub throughput: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_admin")]
    pub admin: String,

    pub shards: Vec<ShardEntry>,
}

fn default_contract_ref() -> String {
    "0x0000000000000000000000000000000000000000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_admin() -> String {
    "0xadmin".to_string()
}

impl Scenario {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(raw).context("malformed scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            bail!("scenario defines no shards");
        }
        for (i, shard) in self.shards.iter().enumerate() {
            if shard.preload > shard.max_capacity {
                bail!(
                    "shard #{} preloads {} records but holds at most {}",
                    i + 1,
                    shard.preload,
                    shard.max_capacity
                );
            }
            if shard.preload > 0 && !shard.activate {
                bail!("shard #{} must be active to preload records", i + 1);
            }
        }
        Ok(())
    }

    /// Create and activate every shard through the service, then preload
    /// records straight onto the ledger, bypassing placement
    pub async fn seed(&self, service: &ShardingService, ledger: &dyn LedgerClient) -> Result<Vec<ShardId>> {
        let admin = Caller::admin(self.admin.clone());
        let ctx = TxContext::new(self.admin.clone(), service.config().ledger.gas_limit);
        let mut ids = Vec::with_capacity(self.shards.len());

        for entry in &self.shards {
            let request = CreateShardRequest {
                shard_type: entry.shard_type,
                contract_ref: entry.contract_ref.clone(),
                min_capacity: entry.min_capacity,
                max_capacity: entry.max_capacity,
                region: entry.region.clone(),
            };
            let shard_id = service.create_shard(&admin, &request).await?.shard_id;

            if entry.activate {
                service.activate_shard(&admin, shard_id).await?;
            }

            for n in 0..entry.preload {
                let record = RecordId::new(format!("seed-{}-{}", shard_id, n));
                ledger
                    .assign_record(&ctx, shard_id, &record)
                    .await
                    .with_context(|| format!("preloading shard {}", shard_id))?;
            }

            if let Some(m) = entry.metrics {
                let update = MetricsUpdate {
                    total_transactions: m.total_transactions,
                    avg_response_time_ms: m.avg_response_time_ms,
                    throughput: m.throughput,
                    error_rate: m.error_rate,
                    observed_at_ms: 0,
                };
                service.update_shard_metrics(&admin, shard_id, &update).await?;
            }
            ids.push(shard_id);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
admin: "0xops"
shards:
  - type: product
    min_capacity: 10
    max_capacity: 100
    region: US-EAST
    preload: 95
    metrics:
      total_transactions: 1200
      avg_response_time_ms: 180.0
      throughput: 35.5
      error_rate: 0.02
  - type: product
    min_capacity: 10
    max_capacity: 100
    region: EU-WEST
    preload: 10
  - type: iot
    min_capacity: 100
    max_capacity: 5000
    region: AP-SOUTH
    activate: false
"#;

    #[test]
    fn test_parse_sample() {
        let scenario = Scenario::from_yaml(SAMPLE).unwrap();
        assert_eq!(scenario.admin, "0xops");
        assert_eq!(scenario.shards.len(), 3);
        assert_eq!(scenario.shards[0].shard_type, ShardType::Product);
        assert_eq!(scenario.shards[0].preload, 95);
        assert!(scenario.shards[0].metrics.is_some());
        assert!(scenario.shards[1].activate);
        assert!(!scenario.shards[2].activate);
        assert_eq!(scenario.shards[2].shard_type, ShardType::Iot);
    }

    #[test]
    fn test_rejects_overfull_preload() {
        let raw = "shards:\n  - type: product\n    min_capacity: 1\n    max_capacity: 5\n    region: US\n    preload: 6\n";
        assert!(Scenario::from_yaml(raw).is_err());
    }

    #[test]
    fn test_rejects_unknown_fields_and_types() {
        assert!(Scenario::from_yaml("shards: []\n").is_err());
        let raw = "shards:\n  - type: pallet\n    min_capacity: 1\n    max_capacity: 5\n    region: US\n";
        assert!(Scenario::from_yaml(raw).is_err());
        let raw = "shards:\n  - type: iot\n    min_capacity: 1\n    max_capacity: 5\n    region: US\n    colour: red\n";
        assert!(Scenario::from_yaml(raw).is_err());
    }
}
