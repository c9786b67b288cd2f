// LOAD ACCOUNTING
// Per-shard load and metrics bookkeeping, plus the system-wide aggregate
//
// INVARIANTS:
// 1. Recording the same (shard, record) twice never double-counts load
// 2. Metrics snapshots are replaced wholesale, never merged
// 3. Same shard snapshot -> same system stats (pure aggregation, fixed formula)
// 4. Load and metrics are read from the ledger; nothing here is authoritative

use crate::config::AccountingConfig;
use crate::error::ShardingError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use traceshard_ledger::{
    LedgerClient, LedgerEvent, MetricsUpdate, RecordId, ShardId, ShardInfo, ShardMetrics, ShardStatus,
    ShardType, TxContext, TxReceipt,
};

/// Standard deviation of load ratios at which the balance score reaches zero
pub const BALANCE_STDDEV_CEILING: f64 = 0.5;

/// Result of recording an assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentOutcome {
    pub shard_id: ShardId,
    pub record_id: RecordId,

    /// False when the record was already on this shard
    pub newly_assigned: bool,

    pub current_load: u64,
    pub receipt: TxReceipt,
}

/// One shard's line in the system stats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardLoadSummary {
    pub shard_id: ShardId,
    pub shard_type: ShardType,
    pub status: ShardStatus,
    pub region: String,
    pub current_load: u64,
    pub max_capacity: u64,
    pub load_percentage: f64,
    pub total_transactions: u64,
    pub efficiency_score: Option<u8>,
}

/// Aggregate view over every known shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub total_shards: usize,
    pub active_shards: usize,
    pub total_transactions: u64,

    /// Mean load percentage over all shards
    pub average_system_load: f64,

    /// Mean efficiency over shards that have reported metrics
    pub average_efficiency: f64,

    /// Evenness of load ratios across active shards (0 - 100)
    pub load_balance_score: f64,

    /// Weighted mix of average efficiency and load balance (0 - 100)
    pub system_efficiency: f64,

    pub shards: Vec<ShardLoadSummary>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 100 for perfectly even load ratios, falling linearly to 0 at `BALANCE_STDDEV_CEILING`
pub fn load_balance_score(ratios: &[f64]) -> f64 {
    if ratios.len() < 2 {
        return 100.0;
    }
    let n = ratios.len() as f64;
    let mean = ratios.iter().sum::<f64>() / n;
    let variance = ratios.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    (100.0 * (1.0 - variance.sqrt() / BALANCE_STDDEV_CEILING)).clamp(0.0, 100.0)
}

/// Weighted system score; increasing in both inputs
pub fn system_efficiency(average_efficiency: f64, balance: f64, efficiency_weight: f64) -> f64 {
    let weight = efficiency_weight.clamp(0.0, 1.0);
    (weight * average_efficiency + (1.0 - weight) * balance).clamp(0.0, 100.0)
}

/// Aggregate a snapshot of shards and their latest metrics
pub fn compute_system_stats(
    snapshot: &[(ShardInfo, Option<ShardMetrics>)],
    efficiency_weight: f64,
) -> SystemStats {
    let mut ordered: Vec<&(ShardInfo, Option<ShardMetrics>)> = snapshot.iter().collect();
    ordered.sort_by_key(|(shard, _)| shard.id);

    let total_shards = ordered.len();
    let active: Vec<&ShardInfo> = ordered
        .iter()
        .map(|(shard, _)| shard)
        .filter(|s| s.status == ShardStatus::Active)
        .collect();

    let total_transactions = ordered
        .iter()
        .filter_map(|(_, m)| m.as_ref())
        .fold(0u64, |acc, m| acc.saturating_add(m.total_transactions));

    let average_system_load = if total_shards == 0 {
        0.0
    } else {
        ordered.iter().map(|(s, _)| s.load_percentage()).sum::<f64>() / total_shards as f64
    };

    let scores: Vec<f64> = ordered
        .iter()
        .filter_map(|(_, m)| m.as_ref())
        .map(|m| m.efficiency_score as f64)
        .collect();
    let average_efficiency = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };

    let ratios: Vec<f64> = active.iter().map(|s| s.load_ratio()).collect();
    let balance = load_balance_score(&ratios);

    let shards = ordered
        .iter()
        .map(|(shard, metrics)| ShardLoadSummary {
            shard_id: shard.id,
            shard_type: shard.shard_type,
            status: shard.status,
            region: shard.region.clone(),
            current_load: shard.current_load,
            max_capacity: shard.max_capacity,
            load_percentage: round2(shard.load_percentage()),
            total_transactions: metrics.map(|m| m.total_transactions).unwrap_or(0),
            efficiency_score: metrics.map(|m| m.efficiency_score),
        })
        .collect();

    // nothing provisioned, nothing to score
    let system_efficiency = if total_shards == 0 {
        0.0
    } else {
        round2(system_efficiency(average_efficiency, balance, efficiency_weight))
    };

    SystemStats {
        total_shards,
        active_shards: active.len(),
        total_transactions,
        average_system_load: round2(average_system_load),
        average_efficiency: round2(average_efficiency),
        load_balance_score: round2(balance),
        system_efficiency,
        shards,
    }
}

fn validate_metrics(update: &MetricsUpdate) -> Result<(), ShardingError> {
    let non_negative = |v: f64| v.is_finite() && v >= 0.0;
    if !non_negative(update.avg_response_time_ms) {
        return Err(ShardingError::validation("average response time must be a non-negative number"));
    }
    if !non_negative(update.throughput) {
        return Err(ShardingError::validation("throughput must be a non-negative number"));
    }
    if !non_negative(update.error_rate) || update.error_rate > 1.0 {
        return Err(ShardingError::validation("error rate must be within 0..=1"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct LoadAccounting {
    ledger: Arc<dyn LedgerClient>,
    config: AccountingConfig,
}

impl LoadAccounting {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: AccountingConfig) -> Self {
        LoadAccounting { ledger, config }
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    /// Record that `record_id` lives on `shard_id`
    ///
    /// The ledger re-checks status and capacity; a repeat of an existing
    /// assignment is a no-op that still succeeds.
    pub async fn record_assignment(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        record_id: &RecordId,
    ) -> Result<AssignmentOutcome, ShardingError> {
        if record_id.as_str().trim().is_empty() {
            return Err(ShardingError::validation("record id is empty"));
        }

        let receipt = self.ledger.assign_record(ctx, shard_id, record_id).await?;
        let assigned_load = receipt.events.iter().find_map(|e| match e {
            LedgerEvent::RecordAssigned { current_load, .. } => Some(*current_load),
            _ => None,
        });

        let (newly_assigned, current_load) = match assigned_load {
            Some(load) => {
                debug!("record {} assigned to shard {} (load {})", record_id, shard_id, load);
                (true, load)
            }
            None => {
                debug!("record {} already on shard {}", record_id, shard_id);
                (false, self.ledger.get_shard_info(shard_id).await?.current_load)
            }
        };

        Ok(AssignmentOutcome {
            shard_id,
            record_id: record_id.clone(),
            newly_assigned,
            current_load,
            receipt,
        })
    }

    pub async fn remove_assignment(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        record_id: &RecordId,
    ) -> Result<TxReceipt, ShardingError> {
        let receipt = self.ledger.remove_record(ctx, shard_id, record_id).await?;
        debug!("record {} removed from shard {}", record_id, shard_id);
        Ok(receipt)
    }

    pub async fn shard_metrics(&self, shard_id: ShardId) -> Result<Option<ShardMetrics>, ShardingError> {
        Ok(self.ledger.get_shard_metrics(shard_id).await?)
    }

    /// Replace the metrics snapshot of a shard
    ///
    /// With `reject_stale_metrics` on, a report sampled before the snapshot
    /// already on the ledger is refused. The check is read-then-write, so two
    /// writers racing on one shard can still interleave.
    pub async fn update_metrics(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        update: &MetricsUpdate,
    ) -> Result<TxReceipt, ShardingError> {
        validate_metrics(update)?;

        if self.config.reject_stale_metrics {
            if let Some(current) = self.ledger.get_shard_metrics(shard_id).await? {
                if update.observed_at_ms < current.observed_at_ms {
                    warn!(
                        "refusing stale metrics for shard {}: observed at {} < {}",
                        shard_id, update.observed_at_ms, current.observed_at_ms
                    );
                    return Err(ShardingError::StaleMetricsWrite {
                        shard_id,
                        observed_at_ms: update.observed_at_ms,
                        current_observed_at_ms: current.observed_at_ms,
                    });
                }
            }
        }

        let receipt = self.ledger.update_metrics(ctx, shard_id, update).await?;
        if let Some(LedgerEvent::MetricsUpdated { efficiency_score, .. }) = receipt.events.first() {
            info!("metrics updated for shard {} (efficiency {})", shard_id, efficiency_score);
        }
        Ok(receipt)
    }

    /// Scan every shard on the ledger and aggregate
    pub async fn system_stats(&self) -> Result<SystemStats, ShardingError> {
        let shards = self.ledger.get_all_shards().await?;
        let mut snapshot = Vec::with_capacity(shards.len());
        for shard in shards {
            let metrics = self.ledger.get_shard_metrics(shard.id).await?;
            snapshot.push((shard, metrics));
        }
        Ok(compute_system_stats(&snapshot, self.config.efficiency_weight))
    }

    pub async fn system_efficiency_score(&self) -> Result<f64, ShardingError> {
        Ok(self.system_stats().await?.system_efficiency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use traceshard_ledger::MemoryLedger;

    fn shard(id: u64, load: u64, max: u64, status: ShardStatus) -> ShardInfo {
        ShardInfo {
            id: ShardId(id),
            shard_type: ShardType::Product,
            contract_ref: "0xproduct".to_string(),
            min_capacity: 1,
            max_capacity: max,
            current_load: load,
            status,
            region: "US-EAST".to_string(),
            assigned_records: Vec::new(),
            created_at_block: 1,
        }
    }

    fn metrics(total: u64, score: u8) -> ShardMetrics {
        ShardMetrics {
            total_transactions: total,
            avg_response_time_ms: 100.0,
            throughput: 10.0,
            error_rate: 0.0,
            efficiency_score: score,
            observed_at_ms: 1,
            updated_at_block: 1,
        }
    }

    fn update(observed_at_ms: u64) -> MetricsUpdate {
        MetricsUpdate {
            total_transactions: 1_000,
            avg_response_time_ms: 250.0,
            throughput: 42.0,
            error_rate: 0.01,
            observed_at_ms,
        }
    }

    async fn ledger_with_active_shard(max: u64) -> (Arc<MemoryLedger>, TxContext, ShardId) {
        let ledger = Arc::new(MemoryLedger::new());
        let ctx = TxContext::new("0xadmin", 1_000_000);
        let id = ledger
            .create_shard(&ctx, ShardType::Product, "0xproduct", 1, max, "US-EAST")
            .await
            .unwrap()
            .shard_id;
        ledger.activate_shard(&ctx, id).await.unwrap();
        (ledger, ctx, id)
    }

    #[test]
    fn test_balance_score() {
        assert_eq!(load_balance_score(&[]), 100.0);
        assert_eq!(load_balance_score(&[0.9]), 100.0);
        assert_eq!(load_balance_score(&[0.4, 0.4, 0.4]), 100.0);
        // stddev 0.5 -> 0
        assert_eq!(load_balance_score(&[0.0, 1.0]), 0.0);
        let uneven = load_balance_score(&[0.95, 0.10]);
        let even = load_balance_score(&[0.55, 0.50]);
        assert!(even > uneven);
    }

    #[test]
    fn test_system_efficiency_is_monotonic() {
        let base = system_efficiency(60.0, 60.0, 0.7);
        assert!(system_efficiency(70.0, 60.0, 0.7) > base);
        assert!(system_efficiency(60.0, 70.0, 0.7) > base);
        assert_eq!(system_efficiency(100.0, 100.0, 0.7), 100.0);
    }

    #[test]
    fn test_compute_system_stats() {
        let snapshot = vec![
            (shard(2, 10, 100, ShardStatus::Active), Some(metrics(500, 80))),
            (shard(1, 95, 100, ShardStatus::Active), Some(metrics(1500, 60))),
            (shard(3, 0, 50, ShardStatus::Inactive), None),
        ];
        let stats = compute_system_stats(&snapshot, 0.7);

        assert_eq!(stats.total_shards, 3);
        assert_eq!(stats.active_shards, 2);
        assert_eq!(stats.total_transactions, 2000);
        assert_eq!(stats.average_system_load, 35.0);
        // shard 3 has no metrics and is left out of the mean
        assert_eq!(stats.average_efficiency, 70.0);
        // ratios 0.95 / 0.10 -> stddev 0.425 -> 15
        assert_eq!(stats.load_balance_score, 15.0);
        assert_eq!(stats.system_efficiency, 53.5);
        let ids: Vec<ShardId> = stats.shards.iter().map(|s| s.shard_id).collect();
        assert_eq!(ids, vec![ShardId(1), ShardId(2), ShardId(3)]);
    }

    #[test]
    fn test_empty_system() {
        let stats = compute_system_stats(&[], 0.7);
        assert_eq!(stats.total_shards, 0);
        assert_eq!(stats.average_system_load, 0.0);
        assert_eq!(stats.average_efficiency, 0.0);
        assert_eq!(stats.load_balance_score, 100.0);
        assert_eq!(stats.system_efficiency, 0.0);

        // one shard without metrics is scored on balance alone
        let single = compute_system_stats(&[(shard(1, 10, 100, ShardStatus::Active), None)], 0.7);
        assert_eq!(single.system_efficiency, 30.0);
    }

    #[test]
    fn test_stats_are_reproducible() {
        let a = vec![
            (shard(1, 30, 100, ShardStatus::Active), Some(metrics(10, 77))),
            (shard(2, 70, 100, ShardStatus::Active), None),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(compute_system_stats(&a, 0.7), compute_system_stats(&b, 0.7));
    }

    #[tokio::test]
    async fn test_repeat_assignment_does_not_double_count() {
        let (ledger, ctx, id) = ledger_with_active_shard(10).await;
        let accounting = LoadAccounting::new(ledger.clone(), AccountingConfig::default());
        let record = RecordId::new("prod-1");

        let first = accounting.record_assignment(&ctx, id, &record).await.unwrap();
        assert!(first.newly_assigned);
        assert_eq!(first.current_load, 1);

        let second = accounting.record_assignment(&ctx, id, &record).await.unwrap();
        assert!(!second.newly_assigned);
        assert_eq!(second.current_load, 1);
        assert!(second.receipt.is_noop());
        assert_eq!(ledger.get_shard_info(id).await.unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn test_removal_frees_capacity() {
        let (ledger, ctx, id) = ledger_with_active_shard(1).await;
        let accounting = LoadAccounting::new(ledger.clone(), AccountingConfig::default());

        accounting.record_assignment(&ctx, id, &RecordId::new("a")).await.unwrap();
        let err = accounting
            .record_assignment(&ctx, id, &RecordId::new("b"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);

        accounting.remove_assignment(&ctx, id, &RecordId::new("a")).await.unwrap();
        assert!(accounting.record_assignment(&ctx, id, &RecordId::new("b")).await.is_ok());

        let missing = accounting
            .remove_assignment(&ctx, id, &RecordId::new("zzz"))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_stale_metrics_rejected() {
        let (ledger, ctx, id) = ledger_with_active_shard(10).await;
        let accounting = LoadAccounting::new(ledger.clone(), AccountingConfig::default());

        accounting.update_metrics(&ctx, id, &update(2_000)).await.unwrap();
        let err = accounting.update_metrics(&ctx, id, &update(1_000)).await.unwrap_err();
        assert_eq!(
            err,
            ShardingError::StaleMetricsWrite {
                shard_id: id,
                observed_at_ms: 1_000,
                current_observed_at_ms: 2_000,
            }
        );
        assert_eq!(accounting.shard_metrics(id).await.unwrap().unwrap().observed_at_ms, 2_000);
    }

    #[tokio::test]
    async fn test_stale_guard_can_be_disabled() {
        let (ledger, ctx, id) = ledger_with_active_shard(10).await;
        let config = AccountingConfig {
            reject_stale_metrics: false,
            ..AccountingConfig::default()
        };
        let accounting = LoadAccounting::new(ledger.clone(), config);

        accounting.update_metrics(&ctx, id, &update(2_000)).await.unwrap();
        accounting.update_metrics(&ctx, id, &update(1_000)).await.unwrap();
        assert_eq!(accounting.shard_metrics(id).await.unwrap().unwrap().observed_at_ms, 1_000);
    }

    #[tokio::test]
    async fn test_invalid_metrics_never_reach_ledger() {
        let (ledger, ctx, id) = ledger_with_active_shard(10).await;
        let accounting = LoadAccounting::new(ledger.clone(), AccountingConfig::default());
        let block = ledger.block_number().await.unwrap();

        let mut bad = update(1);
        bad.error_rate = 1.5;
        assert_eq!(
            accounting.update_metrics(&ctx, id, &bad).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
        bad.error_rate = 0.0;
        bad.throughput = f64::NAN;
        assert!(accounting.update_metrics(&ctx, id, &bad).await.is_err());
        assert_eq!(ledger.block_number().await.unwrap(), block);
    }

    #[tokio::test]
    async fn test_empty_ledger_scores_zero() {
        let accounting = LoadAccounting::new(Arc::new(MemoryLedger::new()), AccountingConfig::default());
        assert_eq!(accounting.system_efficiency_score().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_system_stats_from_ledger() {
        let (ledger, ctx, id) = ledger_with_active_shard(100).await;
        let accounting = LoadAccounting::new(ledger.clone(), AccountingConfig::default());
        for i in 0..40 {
            accounting
                .record_assignment(&ctx, id, &RecordId::new(format!("r-{}", i)))
                .await
                .unwrap();
        }
        accounting.update_metrics(&ctx, id, &update(5)).await.unwrap();

        let stats = accounting.system_stats().await.unwrap();
        assert_eq!(stats.total_shards, 1);
        assert_eq!(stats.total_transactions, 1_000);
        assert_eq!(stats.average_system_load, 40.0);
        assert_eq!(stats.load_balance_score, 100.0);
        assert_eq!(accounting.system_efficiency_score().await.unwrap(), stats.system_efficiency);

        ledger.set_available(false);
        assert_eq!(
            accounting.system_stats().await.unwrap_err().kind(),
            ErrorKind::LedgerUnavailable
        );
    }
}
