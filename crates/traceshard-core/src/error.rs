// SHARDING ERRORS
// Every ledger failure is converted here, at the boundary, into one of a
// small set of kinds callers can act on.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use traceshard_ledger::{ContractError, LedgerError, RecordId, ShardId, ShardStatus, ShardType};

/// Coarse classification of a failure, for callers and envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed input; nothing was sent to the ledger
    Validation,
    /// Unknown shard or record
    NotFound,
    /// No shard of the requested type is provisioned or active
    NoShardAvailable,
    /// Shards exist but none has room
    CapacityExhausted,
    /// State does not allow the operation (bad transition, record owned elsewhere)
    Conflict,
    /// Ledger unreachable or not configured; degraded but non-fatal
    LedgerUnavailable,
    PermissionDenied,
    StaleMetricsWrite,
    /// A send outlived its deadline; it may still be mined
    OutcomeUnknown,
    /// Ledger refused the transaction for a non-semantic reason (e.g. gas)
    LedgerRejected,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShardingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    #[error("record {record_id} is not assigned to shard {shard_id}")]
    RecordNotFound { record_id: RecordId, shard_id: ShardId },

    #[error("no {shard_type} shard available: {detail}")]
    NoShardAvailable { shard_type: ShardType, detail: String },

    #[error("no {shard_type} shard has room for {slots} slot(s)")]
    CapacityExhausted { shard_type: ShardType, slots: u64 },

    #[error("shard {shard_id} is full ({current_load}/{max_capacity})")]
    ShardFull {
        shard_id: ShardId,
        current_load: u64,
        max_capacity: u64,
    },

    #[error("shard {shard_id} is {status} and not accepting assignments")]
    ShardNotAccepting { shard_id: ShardId, status: ShardStatus },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("placement service unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("caller '{caller}' may not {operation}")]
    PermissionDenied { operation: String, caller: String },

    #[error("stale metrics for shard {shard_id}: report observed at {observed_at_ms} but ledger holds {current_observed_at_ms}")]
    StaleMetricsWrite {
        shard_id: ShardId,
        observed_at_ms: u64,
        current_observed_at_ms: u64,
    },

    #[error("outcome of {operation} unknown after {timeout_ms} ms; verify before retrying")]
    OutcomeUnknown { operation: String, timeout_ms: u64 },

    #[error("ledger rejected transaction: {0}")]
    LedgerRejected(String),
}

impl ShardingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardingError::Validation(_) => ErrorKind::Validation,
            ShardingError::ShardNotFound(_) | ShardingError::RecordNotFound { .. } => ErrorKind::NotFound,
            ShardingError::NoShardAvailable { .. } => ErrorKind::NoShardAvailable,
            ShardingError::CapacityExhausted { .. } | ShardingError::ShardFull { .. } => ErrorKind::CapacityExhausted,
            ShardingError::ShardNotAccepting { .. } | ShardingError::Conflict(_) => ErrorKind::Conflict,
            ShardingError::LedgerUnavailable(_) => ErrorKind::LedgerUnavailable,
            ShardingError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ShardingError::StaleMetricsWrite { .. } => ErrorKind::StaleMetricsWrite,
            ShardingError::OutcomeUnknown { .. } => ErrorKind::OutcomeUnknown,
            ShardingError::LedgerRejected(_) => ErrorKind::LedgerRejected,
        }
    }

    /// HTTP-style status code for response envelopes
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound | ErrorKind::NoShardAvailable => 404,
            ErrorKind::CapacityExhausted | ErrorKind::LedgerUnavailable => 503,
            ErrorKind::Conflict | ErrorKind::StaleMetricsWrite => 409,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::OutcomeUnknown => 504,
            ErrorKind::LedgerRejected => 502,
        }
    }

    /// Whether the failure came from (or instead of) a ledger round trip
    pub fn is_ledger_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LedgerUnavailable | ErrorKind::OutcomeUnknown | ErrorKind::LedgerRejected
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ShardingError::Validation(msg.into())
    }
}

impl From<ContractError> for ShardingError {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::InvalidCapacity { .. }
            | ContractError::InvalidArgument(_)
            | ContractError::InvalidMetrics(_) => ShardingError::Validation(err.to_string()),
            ContractError::ShardNotFound(id) => ShardingError::ShardNotFound(id),
            ContractError::AlreadyActive(_)
            | ContractError::InvalidTransition { .. }
            | ContractError::RecordAlreadyAssigned { .. } => ShardingError::Conflict(err.to_string()),
            ContractError::ShardNotAccepting { shard_id, status } => {
                ShardingError::ShardNotAccepting { shard_id, status }
            }
            ContractError::ShardFull {
                shard_id,
                current_load,
                max_capacity,
            } => ShardingError::ShardFull {
                shard_id,
                current_load,
                max_capacity,
            },
            ContractError::RecordNotAssigned { record_id, shard_id } => {
                ShardingError::RecordNotFound { record_id, shard_id }
            }
        }
    }
}

impl From<LedgerError> for ShardingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(reason) => ShardingError::LedgerUnavailable(reason),
            LedgerError::Reverted(contract) => contract.into(),
            LedgerError::OutOfGas { .. } => ShardingError::LedgerRejected(err.to_string()),
            LedgerError::Timeout => ShardingError::OutcomeUnknown {
                operation: "ledger call".to_string(),
                timeout_ms: 0,
            },
        }
    }
}
