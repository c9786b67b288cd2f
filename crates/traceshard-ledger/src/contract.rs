// SHARD REGISTRY CONTRACT
// Authoritative on-ledger state machine for shard metadata, assignments and metrics
//
// INVARIANTS:
// 1. No assignment or transfer may push current_load above max_capacity
// 2. A record is owned by at most one shard at any time
// 3. Repeating an assignment is a no-op (no double increment)
// 4. A transfer decrements the source and increments the destination in one step
// 5. Reads never mutate state
//
// The ledger serializes every state-changing call, so nothing in here locks.

use crate::receipt::LedgerEvent;
use crate::types::{MetricsUpdate, RecordId, ShardId, ShardInfo, ShardMetrics, ShardStatus, ShardType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Longest region tag the contract stores
pub const MAX_REGION_LEN: usize = 64;

/// Response time at which efficiency is halved (milliseconds)
pub const EFFICIENCY_LATENCY_PIVOT_MS: f64 = 1000.0;

/// Gas charged per contract operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasSchedule {
    pub create_shard: u64,
    pub activate_shard: u64,
    pub set_status: u64,
    pub assign_record: u64,
    pub remove_record: u64,
    pub transfer_record: u64,
    pub update_metrics: u64,
    pub trigger_rebalancing: u64,
}

impl Default for GasSchedule {
    fn default() -> Self {
        GasSchedule {
            create_shard: 220_000,
            activate_shard: 45_000,
            set_status: 40_000,
            assign_record: 85_000,
            remove_record: 60_000,
            transfer_record: 120_000,
            update_metrics: 70_000,
            trigger_rebalancing: 30_000,
        }
    }
}

/// Revert reasons of the shard registry contract
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ContractError {
    #[error("max capacity {max} must exceed min capacity {min}")]
    InvalidCapacity { min: u64, max: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    #[error("shard {0} is already active")]
    AlreadyActive(ShardId),

    #[error("shard {shard_id} cannot move from {from} to {to}")]
    InvalidTransition {
        shard_id: ShardId,
        from: ShardStatus,
        to: ShardStatus,
    },

    #[error("shard {shard_id} is {status} and not accepting assignments")]
    ShardNotAccepting { shard_id: ShardId, status: ShardStatus },

    #[error("shard {shard_id} is full ({current_load}/{max_capacity})")]
    ShardFull {
        shard_id: ShardId,
        current_load: u64,
        max_capacity: u64,
    },

    #[error("record {record_id} is already assigned to shard {shard_id}")]
    RecordAlreadyAssigned { record_id: RecordId, shard_id: ShardId },

    #[error("record {record_id} is not assigned to shard {shard_id}")]
    RecordNotAssigned { record_id: RecordId, shard_id: ShardId },

    #[error("invalid metrics: {0}")]
    InvalidMetrics(String),
}

/// Efficiency score the contract derives from a metrics report (0 - 100)
///
/// Monotonically decreasing in both error rate and response time.
pub fn efficiency_score(update: &MetricsUpdate) -> u8 {
    let reliability = (1.0 - update.error_rate).clamp(0.0, 1.0);
    let latency = EFFICIENCY_LATENCY_PIVOT_MS / (EFFICIENCY_LATENCY_PIVOT_MS + update.avg_response_time_ms.max(0.0));
    (100.0 * reliability * latency).round().clamp(0.0, 100.0) as u8
}

fn validate_metrics(update: &MetricsUpdate) -> Result<(), ContractError> {
    let finite = |v: f64| v.is_finite() && v >= 0.0;
    if !finite(update.avg_response_time_ms) {
        return Err(ContractError::InvalidMetrics("avg response time must be a non-negative number".to_string()));
    }
    if !finite(update.throughput) {
        return Err(ContractError::InvalidMetrics("throughput must be a non-negative number".to_string()));
    }
    if !finite(update.error_rate) || update.error_rate > 1.0 {
        return Err(ContractError::InvalidMetrics("error rate must be within 0..=1".to_string()));
    }
    Ok(())
}

/// Shard registry contract state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardContract {
    shards: BTreeMap<ShardId, ShardInfo>,
    metrics: BTreeMap<ShardId, ShardMetrics>,

    /// Record -> owning shard (fast ownership check)
    record_index: HashMap<RecordId, ShardId>,

    next_shard_id: u64,
    rebalance_passes: u64,
}

impl ShardContract {
    pub fn new() -> Self {
        ShardContract {
            next_shard_id: 1,
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    pub fn shard(&self, shard_id: ShardId) -> Result<&ShardInfo, ContractError> {
        self.shards.get(&shard_id).ok_or(ContractError::ShardNotFound(shard_id))
    }

    /// Ids of shards of `shard_type`, ascending
    pub fn shards_by_type(&self, shard_type: ShardType) -> Vec<ShardId> {
        self.shards
            .values()
            .filter(|s| s.shard_type == shard_type)
            .map(|s| s.id)
            .collect()
    }

    pub fn active_shards(&self) -> Vec<ShardId> {
        self.shards
            .values()
            .filter(|s| s.status == ShardStatus::Active)
            .map(|s| s.id)
            .collect()
    }

    pub fn all_shards(&self) -> Vec<ShardInfo> {
        self.shards.values().cloned().collect()
    }

    pub fn metrics(&self, shard_id: ShardId) -> Result<Option<ShardMetrics>, ContractError> {
        self.shard(shard_id)?;
        Ok(self.metrics.get(&shard_id).copied())
    }

    pub fn record_shard(&self, record_id: &RecordId) -> Option<ShardId> {
        self.record_index.get(record_id).copied()
    }

    // ------------------------------------------------------------------
    // Sends
    // ------------------------------------------------------------------

    pub fn create_shard(
        &mut self,
        shard_type: ShardType,
        contract_ref: &str,
        min_capacity: u64,
        max_capacity: u64,
        region: &str,
        block: u64,
    ) -> Result<(ShardId, Vec<LedgerEvent>), ContractError> {
        if min_capacity == 0 {
            return Err(ContractError::InvalidArgument("min capacity must be positive".to_string()));
        }
        if max_capacity <= min_capacity {
            return Err(ContractError::InvalidCapacity { min: min_capacity, max: max_capacity });
        }
        let region = region.trim();
        if region.is_empty() || region.len() > MAX_REGION_LEN {
            return Err(ContractError::InvalidArgument(format!(
                "region must be 1..={} characters",
                MAX_REGION_LEN
            )));
        }
        if contract_ref.trim().is_empty() {
            return Err(ContractError::InvalidArgument("contract reference is empty".to_string()));
        }

        let id = ShardId(self.next_shard_id);
        self.next_shard_id += 1;

        self.shards.insert(
            id,
            ShardInfo {
                id,
                shard_type,
                contract_ref: contract_ref.trim().to_string(),
                min_capacity,
                max_capacity,
                current_load: 0,
                status: ShardStatus::Inactive,
                region: region.to_string(),
                assigned_records: Vec::new(),
                created_at_block: block,
            },
        );

        Ok((
            id,
            vec![LedgerEvent::ShardCreated {
                shard_id: id,
                shard_type,
                max_capacity,
                region: region.to_string(),
            }],
        ))
    }

    pub fn activate_shard(&mut self, shard_id: ShardId) -> Result<Vec<LedgerEvent>, ContractError> {
        let shard = self.shard_mut(shard_id)?;
        match shard.status {
            ShardStatus::Active => Err(ContractError::AlreadyActive(shard_id)),
            ShardStatus::Inactive => {
                shard.status = ShardStatus::Active;
                Ok(vec![LedgerEvent::ShardActivated { shard_id }])
            }
            from => Err(ContractError::InvalidTransition {
                shard_id,
                from,
                to: ShardStatus::Active,
            }),
        }
    }

    pub fn set_status(&mut self, shard_id: ShardId, to: ShardStatus) -> Result<Vec<LedgerEvent>, ContractError> {
        let shard = self.shard_mut(shard_id)?;
        let from = shard.status;
        if !from.can_transition_to(to) {
            return Err(ContractError::InvalidTransition { shard_id, from, to });
        }
        shard.status = to;
        Ok(vec![LedgerEvent::ShardStatusChanged { shard_id, from, to }])
    }

    /// Assign a record to a shard, re-checking capacity at write time
    pub fn assign_record(&mut self, shard_id: ShardId, record_id: &RecordId) -> Result<Vec<LedgerEvent>, ContractError> {
        if record_id.as_str().trim().is_empty() {
            return Err(ContractError::InvalidArgument("record id is empty".to_string()));
        }
        self.shard(shard_id)?;

        match self.record_index.get(record_id) {
            Some(owner) if *owner == shard_id => return Ok(Vec::new()),
            Some(owner) => {
                return Err(ContractError::RecordAlreadyAssigned {
                    record_id: record_id.clone(),
                    shard_id: *owner,
                })
            }
            None => {}
        }

        let shard = self.shard_mut(shard_id)?;
        if !shard.status.accepts_assignments() {
            return Err(ContractError::ShardNotAccepting { shard_id, status: shard.status });
        }
        if shard.current_load >= shard.max_capacity {
            return Err(ContractError::ShardFull {
                shard_id,
                current_load: shard.current_load,
                max_capacity: shard.max_capacity,
            });
        }

        shard.current_load += 1;
        shard.assigned_records.push(record_id.clone());
        let current_load = shard.current_load;
        self.record_index.insert(record_id.clone(), shard_id);

        Ok(vec![LedgerEvent::RecordAssigned {
            shard_id,
            record_id: record_id.clone(),
            current_load,
        }])
    }

    pub fn remove_record(&mut self, shard_id: ShardId, record_id: &RecordId) -> Result<Vec<LedgerEvent>, ContractError> {
        self.shard(shard_id)?;
        if self.record_index.get(record_id) != Some(&shard_id) {
            return Err(ContractError::RecordNotAssigned {
                record_id: record_id.clone(),
                shard_id,
            });
        }

        let shard = self.shard_mut(shard_id)?;
        shard.assigned_records.retain(|r| r != record_id);
        shard.current_load = shard.current_load.saturating_sub(1);
        let current_load = shard.current_load;
        self.record_index.remove(record_id);

        Ok(vec![LedgerEvent::RecordRemoved {
            shard_id,
            record_id: record_id.clone(),
            current_load,
        }])
    }

    /// Move one record between shards of the same type
    pub fn transfer_record(
        &mut self,
        record_id: &RecordId,
        from: ShardId,
        to: ShardId,
    ) -> Result<Vec<LedgerEvent>, ContractError> {
        if from == to {
            return Err(ContractError::InvalidArgument("source and destination are the same shard".to_string()));
        }
        let source_type = self.shard(from)?.shard_type;
        let target = self.shard(to)?;
        if target.shard_type != source_type {
            return Err(ContractError::InvalidArgument(format!(
                "cannot move a {} record into a {} shard",
                source_type, target.shard_type
            )));
        }
        if self.record_index.get(record_id) != Some(&from) {
            return Err(ContractError::RecordNotAssigned {
                record_id: record_id.clone(),
                shard_id: from,
            });
        }
        if !target.status.accepts_assignments() {
            return Err(ContractError::ShardNotAccepting { shard_id: to, status: target.status });
        }
        if target.current_load >= target.max_capacity {
            return Err(ContractError::ShardFull {
                shard_id: to,
                current_load: target.current_load,
                max_capacity: target.max_capacity,
            });
        }

        // All checks passed; apply both sides before returning
        let source = self.shard_mut(from)?;
        source.assigned_records.retain(|r| r != record_id);
        source.current_load = source.current_load.saturating_sub(1);

        let target = self.shard_mut(to)?;
        target.assigned_records.push(record_id.clone());
        target.current_load += 1;

        self.record_index.insert(record_id.clone(), to);

        Ok(vec![LedgerEvent::RecordTransferred {
            record_id: record_id.clone(),
            from,
            to,
        }])
    }

    /// Overwrite the metrics snapshot of a shard wholesale
    ///
    /// Ordering is not checked: an older report arriving late replaces a newer one.
    pub fn update_metrics(
        &mut self,
        shard_id: ShardId,
        update: &MetricsUpdate,
        block: u64,
    ) -> Result<Vec<LedgerEvent>, ContractError> {
        self.shard(shard_id)?;
        validate_metrics(update)?;

        let score = efficiency_score(update);
        self.metrics.insert(
            shard_id,
            ShardMetrics {
                total_transactions: update.total_transactions,
                avg_response_time_ms: update.avg_response_time_ms,
                throughput: update.throughput,
                error_rate: update.error_rate,
                efficiency_score: score,
                observed_at_ms: update.observed_at_ms,
                updated_at_block: block,
            },
        );

        Ok(vec![LedgerEvent::MetricsUpdated {
            shard_id,
            efficiency_score: score,
        }])
    }

    pub fn trigger_rebalancing(&mut self, requested_by: &str) -> Result<(u64, Vec<LedgerEvent>), ContractError> {
        self.rebalance_passes += 1;
        let pass = self.rebalance_passes;
        Ok((
            pass,
            vec![LedgerEvent::RebalanceTriggered {
                requested_by: requested_by.to_string(),
                pass,
            }],
        ))
    }

    fn shard_mut(&mut self, shard_id: ShardId) -> Result<&mut ShardInfo, ContractError> {
        self.shards.get_mut(&shard_id).ok_or(ContractError::ShardNotFound(shard_id))
    }
}
