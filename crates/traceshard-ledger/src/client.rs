// LEDGER CLIENT
// Call/send seam between the sharding core and whatever ledger backs it.
//
// Calls are read-only. Sends are state-changing, signed by `TxContext::sender`
// and bounded by `TxContext::gas_limit`; they resolve once the transaction is
// mined. No timeout is applied here: callers bound sends themselves and must
// treat an expired wait as an unknown outcome.

use crate::contract::ContractError;
use crate::receipt::{TxContext, TxReceipt};
use crate::types::{MetricsUpdate, RecordId, ShardId, ShardInfo, ShardMetrics, ShardStatus, ShardType};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Ledger unreachable or not initialised
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The contract rejected the call
    #[error("transaction reverted: {0}")]
    Reverted(#[from] ContractError),

    #[error("out of gas: required {required}, limit {limit}")]
    OutOfGas { required: u64, limit: u64 },

    /// Submitted, but no receipt observed; the transaction may still be mined
    #[error("timed out waiting for receipt")]
    Timeout,
}

impl LedgerError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Result of a `create_shard` send
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedShard {
    pub shard_id: ShardId,
    pub receipt: TxReceipt,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    // ---- calls ----

    async fn get_shard_info(&self, shard_id: ShardId) -> Result<ShardInfo, LedgerError>;

    /// Ids of all shards of `shard_type`, ascending
    async fn get_shards_by_type(&self, shard_type: ShardType) -> Result<Vec<ShardId>, LedgerError>;

    async fn get_active_shards(&self) -> Result<Vec<ShardId>, LedgerError>;

    /// Every shard record, ascending by id
    async fn get_all_shards(&self) -> Result<Vec<ShardInfo>, LedgerError>;

    /// Latest metrics snapshot, `None` if never reported
    async fn get_shard_metrics(&self, shard_id: ShardId) -> Result<Option<ShardMetrics>, LedgerError>;

    async fn get_record_shard(&self, record_id: &RecordId) -> Result<Option<ShardId>, LedgerError>;

    async fn block_number(&self) -> Result<u64, LedgerError>;

    // ---- sends ----

    async fn create_shard(
        &self,
        ctx: &TxContext,
        shard_type: ShardType,
        contract_ref: &str,
        min_capacity: u64,
        max_capacity: u64,
        region: &str,
    ) -> Result<CreatedShard, LedgerError>;

    async fn activate_shard(&self, ctx: &TxContext, shard_id: ShardId) -> Result<TxReceipt, LedgerError>;

    async fn set_shard_status(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        status: ShardStatus,
    ) -> Result<TxReceipt, LedgerError>;

    /// Idempotent per (shard, record); a repeat returns a receipt without events
    async fn assign_record(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        record_id: &RecordId,
    ) -> Result<TxReceipt, LedgerError>;

    async fn remove_record(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        record_id: &RecordId,
    ) -> Result<TxReceipt, LedgerError>;

    async fn transfer_record(
        &self,
        ctx: &TxContext,
        record_id: &RecordId,
        from: ShardId,
        to: ShardId,
    ) -> Result<TxReceipt, LedgerError>;

    async fn update_metrics(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        update: &MetricsUpdate,
    ) -> Result<TxReceipt, LedgerError>;

    /// Records a rebalancing pass on-ledger, returning the pass number
    async fn trigger_rebalancing(&self, ctx: &TxContext) -> Result<(u64, TxReceipt), LedgerError>;
}
