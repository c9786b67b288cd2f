// TRANSACTION RECEIPTS & EVENTS
// What a state-changing ledger call returns, and what it emits for
// off-ledger log correlation.

use crate::types::{RecordId, ShardId, ShardStatus, ShardType};
use serde::{Deserialize, Serialize};

/// Signing identity and resource budget attached to every send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxContext {
    /// Address of the signing account
    pub sender: String,

    /// Maximum gas this transaction may consume
    pub gas_limit: u64,
}

impl TxContext {
    pub fn new(sender: impl Into<String>, gas_limit: u64) -> Self {
        TxContext {
            sender: sender.into(),
            gas_limit,
        }
    }
}

/// Event emitted by the shard registry contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LedgerEvent {
    ShardCreated {
        shard_id: ShardId,
        shard_type: ShardType,
        max_capacity: u64,
        region: String,
    },
    ShardActivated {
        shard_id: ShardId,
    },
    ShardStatusChanged {
        shard_id: ShardId,
        from: ShardStatus,
        to: ShardStatus,
    },
    RecordAssigned {
        shard_id: ShardId,
        record_id: RecordId,
        current_load: u64,
    },
    RecordRemoved {
        shard_id: ShardId,
        record_id: RecordId,
        current_load: u64,
    },
    /// One event per move; source decrement and destination increment are a single unit
    RecordTransferred {
        record_id: RecordId,
        from: ShardId,
        to: ShardId,
    },
    MetricsUpdated {
        shard_id: ShardId,
        efficiency_score: u8,
    },
    RebalanceTriggered {
        requested_by: String,
        pass: u64,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::ShardCreated { .. } => "ShardCreated",
            LedgerEvent::ShardActivated { .. } => "ShardActivated",
            LedgerEvent::ShardStatusChanged { .. } => "ShardStatusChanged",
            LedgerEvent::RecordAssigned { .. } => "RecordAssigned",
            LedgerEvent::RecordRemoved { .. } => "RecordRemoved",
            LedgerEvent::RecordTransferred { .. } => "RecordTransferred",
            LedgerEvent::MetricsUpdated { .. } => "MetricsUpdated",
            LedgerEvent::RebalanceTriggered { .. } => "RebalanceTriggered",
        }
    }
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Hex-encoded transaction hash
    pub tx_hash: String,
    pub block_number: u64,
    pub gas_used: u64,

    /// Empty when the call was a no-op (e.g. a repeated assignment)
    pub events: Vec<LedgerEvent>,
}

impl TxReceipt {
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// An event together with the transaction that emitted it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedEvent {
    pub tx_hash: String,
    pub block_number: u64,
    pub sender: String,
    pub event: LedgerEvent,
}
