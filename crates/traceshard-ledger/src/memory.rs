// IN-MEMORY LEDGER
// Deterministic stand-in for the permissioned chain: one contract instance,
// globally serialized sends, gas metering, receipts and an event log.
// Fault injection hooks let tests exercise the degraded paths.

use crate::client::{CreatedShard, LedgerClient, LedgerError};
use crate::contract::{ContractError, GasSchedule, ShardContract};
use crate::receipt::{LedgerEvent, LoggedEvent, TxContext, TxReceipt};
use crate::types::{MetricsUpdate, RecordId, ShardId, ShardInfo, ShardMetrics, ShardStatus, ShardType};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct LedgerState {
    contract: ShardContract,
    block_number: u64,
    nonce: u64,
    events: Vec<LoggedEvent>,
}

/// In-memory ledger hosting a single shard registry contract
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    gas: GasSchedule,
    available: AtomicBool,

    /// Remaining sends before every send fails as unavailable
    send_budget: Mutex<Option<u64>>,

    /// Artificial delay applied before every call and send
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_gas_schedule(GasSchedule::default())
    }

    pub fn with_gas_schedule(gas: GasSchedule) -> Self {
        MemoryLedger {
            state: Mutex::new(LedgerState {
                contract: ShardContract::new(),
                block_number: 0,
                nonce: 0,
                events: Vec::new(),
            }),
            gas,
            available: AtomicBool::new(true),
            send_budget: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    pub fn gas_schedule(&self) -> GasSchedule {
        self.gas
    }

    /// Simulate the ledger going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Let `n` more sends succeed, then fail every send as unavailable
    pub fn fail_sends_after(&self, n: u64) {
        *self.send_budget.lock() = Some(n);
    }

    pub fn clear_faults(&self) {
        *self.send_budget.lock() = None;
        self.set_available(true);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Every event emitted so far, in mining order
    pub fn events(&self) -> Vec<LoggedEvent> {
        self.state.lock().events.clone()
    }

    /// Events emitted by one transaction
    pub fn events_for_tx(&self, tx_hash: &str) -> Vec<LedgerEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.tx_hash == tx_hash)
            .map(|e| e.event.clone())
            .collect()
    }

    async fn gate(&self) -> Result<(), LedgerError> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger node not reachable".to_string()));
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&ShardContract) -> T) -> T {
        let state = self.state.lock();
        f(&state.contract)
    }

    /// Run one state-changing call as a transaction
    fn execute<T>(
        &self,
        ctx: &TxContext,
        operation: &str,
        gas: u64,
        f: impl FnOnce(&mut ShardContract, u64) -> Result<(T, Vec<LedgerEvent>), ContractError>,
    ) -> Result<(T, TxReceipt), LedgerError> {
        if ctx.gas_limit < gas {
            warn!("[MemoryLedger] {} from {} out of gas ({} < {})", operation, ctx.sender, ctx.gas_limit, gas);
            return Err(LedgerError::OutOfGas { required: gas, limit: ctx.gas_limit });
        }

        {
            let mut budget = self.send_budget.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(LedgerError::Unavailable("injected send failure".to_string()));
                }
                *remaining -= 1;
            }
        }

        let mut state = self.state.lock();
        state.nonce += 1;
        let block = state.block_number + 1;
        let tx_hash = tx_hash(&ctx.sender, state.nonce, operation, block);

        let (value, events) = f(&mut state.contract, block)?;

        state.block_number = block;
        for event in &events {
            state.events.push(LoggedEvent {
                tx_hash: tx_hash.clone(),
                block_number: block,
                sender: ctx.sender.clone(),
                event: event.clone(),
            });
        }
        debug!("[MemoryLedger] {} mined in block {} ({} events)", operation, block, events.len());

        Ok((
            value,
            TxReceipt {
                tx_hash,
                block_number: block,
                gas_used: gas,
                events,
            },
        ))
    }
}

fn tx_hash(sender: &str, nonce: u64, operation: &str, block: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(nonce.to_le_bytes());
    hasher.update(operation.as_bytes());
    hasher.update(block.to_le_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn get_shard_info(&self, shard_id: ShardId) -> Result<ShardInfo, LedgerError> {
        self.gate().await?;
        self.read(|c| c.shard(shard_id).cloned()).map_err(LedgerError::from)
    }

    async fn get_shards_by_type(&self, shard_type: ShardType) -> Result<Vec<ShardId>, LedgerError> {
        self.gate().await?;
        Ok(self.read(|c| c.shards_by_type(shard_type)))
    }

    async fn get_active_shards(&self) -> Result<Vec<ShardId>, LedgerError> {
        self.gate().await?;
        Ok(self.read(|c| c.active_shards()))
    }

    async fn get_all_shards(&self) -> Result<Vec<ShardInfo>, LedgerError> {
        self.gate().await?;
        Ok(self.read(|c| c.all_shards()))
    }

    async fn get_shard_metrics(&self, shard_id: ShardId) -> Result<Option<ShardMetrics>, LedgerError> {
        self.gate().await?;
        self.read(|c| c.metrics(shard_id)).map_err(LedgerError::from)
    }

    async fn get_record_shard(&self, record_id: &RecordId) -> Result<Option<ShardId>, LedgerError> {
        self.gate().await?;
        Ok(self.read(|c| c.record_shard(record_id)))
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.gate().await?;
        Ok(self.state.lock().block_number)
    }

    async fn create_shard(
        &self,
        ctx: &TxContext,
        shard_type: ShardType,
        contract_ref: &str,
        min_capacity: u64,
        max_capacity: u64,
        region: &str,
    ) -> Result<CreatedShard, LedgerError> {
        self.gate().await?;
        let (shard_id, receipt) = self.execute(ctx, "createShard", self.gas.create_shard, |c, block| {
            c.create_shard(shard_type, contract_ref, min_capacity, max_capacity, region, block)
        })?;
        Ok(CreatedShard { shard_id, receipt })
    }

    async fn activate_shard(&self, ctx: &TxContext, shard_id: ShardId) -> Result<TxReceipt, LedgerError> {
        self.gate().await?;
        let ((), receipt) = self.execute(ctx, "activateShard", self.gas.activate_shard, |c, _| {
            c.activate_shard(shard_id).map(|events| ((), events))
        })?;
        Ok(receipt)
    }

    async fn set_shard_status(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        status: ShardStatus,
    ) -> Result<TxReceipt, LedgerError> {
        self.gate().await?;
        let ((), receipt) = self.execute(ctx, "setShardStatus", self.gas.set_status, |c, _| {
            c.set_status(shard_id, status).map(|events| ((), events))
        })?;
        Ok(receipt)
    }

    async fn assign_record(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        record_id: &RecordId,
    ) -> Result<TxReceipt, LedgerError> {
        self.gate().await?;
        let ((), receipt) = self.execute(ctx, "assignRecord", self.gas.assign_record, |c, _| {
            c.assign_record(shard_id, record_id).map(|events| ((), events))
        })?;
        Ok(receipt)
    }

    async fn remove_record(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        record_id: &RecordId,
    ) -> Result<TxReceipt, LedgerError> {
        self.gate().await?;
        let ((), receipt) = self.execute(ctx, "removeRecord", self.gas.remove_record, |c, _| {
            c.remove_record(shard_id, record_id).map(|events| ((), events))
        })?;
        Ok(receipt)
    }

    async fn transfer_record(
        &self,
        ctx: &TxContext,
        record_id: &RecordId,
        from: ShardId,
        to: ShardId,
    ) -> Result<TxReceipt, LedgerError> {
        self.gate().await?;
        let ((), receipt) = self.execute(ctx, "transferRecord", self.gas.transfer_record, |c, _| {
            c.transfer_record(record_id, from, to).map(|events| ((), events))
        })?;
        Ok(receipt)
    }

    async fn update_metrics(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        update: &MetricsUpdate,
    ) -> Result<TxReceipt, LedgerError> {
        self.gate().await?;
        let ((), receipt) = self.execute(ctx, "updateShardMetrics", self.gas.update_metrics, |c, block| {
            c.update_metrics(shard_id, update, block).map(|events| ((), events))
        })?;
        Ok(receipt)
    }

    async fn trigger_rebalancing(&self, ctx: &TxContext) -> Result<(u64, TxReceipt), LedgerError> {
        self.gate().await?;
        let sender = ctx.sender.clone();
        self.execute(ctx, "triggerRebalancing", self.gas.trigger_rebalancing, |c, _| {
            c.trigger_rebalancing(&sender)
        })
    }
}
