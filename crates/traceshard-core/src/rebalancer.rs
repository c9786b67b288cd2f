// REBALANCER
// Moves records from overloaded shards to underloaded shards of the same type
//
// INVARIANTS:
// 1. Every move is one ledger transfer; no record is ever on two shards
// 2. A target is never filled past its capacity
// 3. Total load per shard type is unchanged by a pass
// 4. A bounded number of moves per pass
// 5. Interrupted passes are not rolled back; the next pass continues from
//    whatever the ledger now holds
//
// Levels are computed in integer basis points so the same snapshot always
// yields the same plan.

use crate::config::RebalancerConfig;
use crate::deadline::with_deadline;
use crate::error::ShardingError;
use crate::registry::ShardRegistry;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use traceshard_ledger::{RecordId, ShardId, ShardInfo, ShardStatus, ShardType, TxContext};

const BPS: u128 = 10_000;

/// A move decided by the planner, not yet sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedMove {
    pub record_id: RecordId,
    pub from: ShardId,
    pub to: ShardId,
}

/// A move the ledger accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMove {
    pub record_id: RecordId,
    pub from: ShardId,
    pub to: ShardId,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceReport {
    /// On-ledger pass number
    pub pass: u64,
    pub planned: usize,
    pub moves: Vec<RecordMove>,

    /// Moves refused by the ledger because state changed since planning
    pub skipped: usize,

    /// Why the pass stopped early, if it did
    pub interrupted: Option<String>,
}

impl RebalanceReport {
    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none()
    }
}

fn bps(ratio: f64) -> u128 {
    (ratio.clamp(0.0, 1.0) * BPS as f64).round() as u128
}

/// `(target ratio + tolerance) * max`, as (ceil, floor), both capped at `max`
fn levels(total_load: u128, total_capacity: u128, tolerance_bps: u128, max: u64) -> (u64, u64) {
    let max_w = max as u128;
    let scaled = total_load * BPS + tolerance_bps * total_capacity;
    let denominator = total_capacity * BPS;
    let (ceil, floor) = match scaled.checked_mul(max_w) {
        Some(numerator) => (
            numerator.div_ceil(denominator),
            numerator / denominator,
        ),
        None => {
            // capacities near u64::MAX: go through a basis-point ratio
            let ratio = scaled / total_capacity;
            let numerator = ratio.saturating_mul(max_w);
            (numerator.div_ceil(BPS), numerator / BPS)
        }
    };
    (ceil.min(max_w) as u64, floor.min(max_w) as u64)
}

/// `load / max` compared as `a < b` without floats
fn ratio_lt(a_load: u64, a_max: u64, b_load: u64, b_max: u64) -> bool {
    (a_load as u128) * (b_max as u128) < (b_load as u128) * (a_max as u128)
}

struct Slot {
    id: ShardId,
    load: u64,
    max: u64,
    shed_to: u64,
    fill_to: u64,
    records: Vec<RecordId>,
}

fn plan_type(shards: &[&ShardInfo], config: &RebalancerConfig, budget: usize) -> Vec<PlannedMove> {
    let total_load: u128 = shards.iter().map(|s| s.current_load as u128).sum();
    let total_capacity: u128 = shards.iter().map(|s| s.max_capacity as u128).sum();
    if total_capacity == 0 || budget == 0 {
        return Vec::new();
    }

    let tolerance = bps(config.tolerance);
    let high = bps(config.high_load_ratio);
    let low = bps(config.low_load_ratio);

    let slot = |s: &ShardInfo| {
        let (shed_to, fill_to) = levels(total_load, total_capacity, tolerance, s.max_capacity);
        Slot {
            id: s.id,
            load: s.current_load,
            max: s.max_capacity,
            shed_to,
            fill_to,
            records: s.assigned_records.clone(),
        }
    };

    let mut sources: Vec<Slot> = shards
        .iter()
        .filter(|s| s.current_load as u128 * BPS > high * s.max_capacity as u128)
        .map(|s| slot(*s))
        .filter(|s| s.load > s.shed_to)
        .collect();
    sources.sort_by(|a, b| {
        (b.load as u128 * a.max as u128)
            .cmp(&(a.load as u128 * b.max as u128))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut targets: Vec<Slot> = shards
        .iter()
        .filter(|s| s.status == ShardStatus::Active)
        .filter(|s| (s.current_load as u128) * BPS < low * s.max_capacity as u128)
        .map(|s| slot(*s))
        .filter(|s| s.load < s.fill_to)
        .collect();

    let mut moves = Vec::new();
    'sources: for source in sources.iter_mut() {
        while source.load > source.shed_to {
            if moves.len() >= budget {
                break 'sources;
            }

            // least loaded target that still has room below its fill level
            let mut best: Option<usize> = None;
            for (i, t) in targets.iter().enumerate() {
                if t.load >= t.fill_to || t.load >= t.max {
                    continue;
                }
                best = match best {
                    Some(j) if !ratio_lt(t.load, t.max, targets[j].load, targets[j].max) => Some(j),
                    _ => Some(i),
                };
            }
            let Some(ti) = best else {
                break 'sources;
            };

            // most recently assigned first
            let Some(record_id) = source.records.pop() else {
                break;
            };
            let target = &mut targets[ti];
            target.load += 1;
            source.load -= 1;
            moves.push(PlannedMove {
                record_id,
                from: source.id,
                to: target.id,
            });
        }
    }
    moves
}

/// Decide which records move where, from a snapshot of all shards
///
/// Only `Active` shards and shards left in `Rebalancing` by an earlier pass
/// take part. Types are handled independently, in a fixed order, sharing one
/// move budget.
pub fn plan_moves(shards: &[ShardInfo], config: &RebalancerConfig) -> Vec<PlannedMove> {
    let mut moves = Vec::new();
    for shard_type in ShardType::ALL {
        let mut of_type: Vec<&ShardInfo> = shards
            .iter()
            .filter(|s| s.shard_type == shard_type)
            .filter(|s| matches!(s.status, ShardStatus::Active | ShardStatus::Rebalancing))
            .collect();
        of_type.sort_by_key(|s| s.id);

        let budget = config.max_moves_per_pass.saturating_sub(moves.len());
        moves.extend(plan_type(&of_type, config, budget));
    }
    moves
}

#[derive(Clone)]
pub struct Rebalancer {
    registry: ShardRegistry,
    config: RebalancerConfig,
    command_timeout: Option<Duration>,
}

impl Rebalancer {
    pub fn new(registry: ShardRegistry, config: RebalancerConfig, command_timeout: Option<Duration>) -> Self {
        Rebalancer {
            registry,
            config,
            command_timeout,
        }
    }

    pub fn config(&self) -> &RebalancerConfig {
        &self.config
    }

    /// Run one pass: record it on-ledger, plan from fresh state, then move
    ///
    /// A ledger failure stops the moves, then every source marked by this
    /// pass is put back to `Active`. Errors before the first move are
    /// returned as errors; after that the pass ends with `interrupted` set
    /// and the moves made so far kept.
    pub async fn run_pass(&self, ctx: &TxContext) -> Result<RebalanceReport, ShardingError> {
        let ledger = self.registry.ledger();
        let (pass, _) = with_deadline(
            "triggerRebalancing",
            self.command_timeout,
            ledger.trigger_rebalancing(ctx),
        )
        .await?;

        let shards = self.registry.all_shards().await?;
        let plan = plan_moves(&shards, &self.config);
        info!("rebalance pass {} by {}: {} move(s) planned", pass, ctx.sender, plan.len());

        let mut report = RebalanceReport {
            pass,
            planned: plan.len(),
            moves: Vec::new(),
            skipped: 0,
            interrupted: None,
        };

        let mut marked: Vec<ShardId> = shards
            .iter()
            .filter(|s| s.status == ShardStatus::Rebalancing)
            .map(|s| s.id)
            .collect();
        let mut failure: Option<(ShardId, ShardingError)> = None;

        for planned in &plan {
            if !marked.contains(&planned.from) {
                let marking = with_deadline(
                    "setShardStatus",
                    self.command_timeout,
                    ledger.set_shard_status(ctx, planned.from, ShardStatus::Rebalancing),
                )
                .await;
                match marking {
                    Ok(_) => marked.push(planned.from),
                    Err(e) if e.is_ledger_failure() => {
                        failure = Some((planned.from, e));
                        break;
                    }
                    Err(e) => {
                        // source left Active since planning; leave it alone
                        warn!("rebalance pass {}: not shedding shard {}: {}", pass, planned.from, e);
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            let result = with_deadline(
                "transferRecord",
                self.command_timeout,
                ledger.transfer_record(ctx, &planned.record_id, planned.from, planned.to),
            )
            .await;
            match result {
                Ok(receipt) => report.moves.push(RecordMove {
                    record_id: planned.record_id.clone(),
                    from: planned.from,
                    to: planned.to,
                    tx_hash: receipt.tx_hash,
                }),
                Err(e) if e.is_ledger_failure() => {
                    failure = Some((planned.from, e));
                    break;
                }
                Err(e) => {
                    warn!(
                        "rebalance pass {}: skipped {} ({} -> {}): {}",
                        pass, planned.record_id, planned.from, planned.to, e
                    );
                    report.skipped += 1;
                }
            }
        }

        for shard_id in marked {
            let restored = with_deadline(
                "setShardStatus",
                self.command_timeout,
                ledger.set_shard_status(ctx, shard_id, ShardStatus::Active),
            )
            .await;
            if let Err(e) = restored {
                warn!("rebalance pass {}: shard {} left rebalancing: {}", pass, shard_id, e);
            }
        }

        // sources are restored before a failure is reported
        if let Some((shard_id, e)) = failure {
            self.interrupt(&mut report, shard_id, e)?;
        }

        info!(
            "rebalance pass {} done: {} moved, {} skipped{}",
            pass,
            report.moves.len(),
            report.skipped,
            if report.is_complete() { "" } else { ", interrupted" }
        );
        Ok(report)
    }

    /// Record an interruption, or fail outright when nothing has moved yet
    fn interrupt(&self, report: &mut RebalanceReport, shard_id: ShardId, err: ShardingError) -> Result<(), ShardingError> {
        error!(
            "rebalance pass {} interrupted at shard {} after {} move(s): {}",
            report.pass,
            shard_id,
            report.moves.len(),
            err
        );
        if report.moves.is_empty() {
            return Err(err);
        }
        report.interrupted = Some(err.to_string());
        Ok(())
    }
}
