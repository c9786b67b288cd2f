//! Ledger side of traceshard.
//!
//! The sharding core never talks to a chain directly; it goes through
//! [`LedgerClient`]. [`ShardContract`] holds the registry rules the chain
//! enforces, and [`MemoryLedger`] hosts that contract in-process for tests
//! and simulation.

pub mod client;
pub mod contract;
pub mod memory;
pub mod receipt;
pub mod types;

pub use client::{CreatedShard, LedgerClient, LedgerError};
pub use contract::{efficiency_score, ContractError, GasSchedule, ShardContract};
pub use memory::MemoryLedger;
pub use receipt::{LedgerEvent, LoggedEvent, TxContext, TxReceipt};
pub use types::{MetricsUpdate, RecordId, ShardId, ShardInfo, ShardMetrics, ShardStatus, ShardType};
