//! Placement layer of traceshard.
//!
//! Decides which shard a new record goes to, keeps per-shard load and
//! metrics in step with the ledger, and rebalances records between shards.
//! All state lives behind a [`traceshard_ledger::LedgerClient`]; this crate
//! only reads it, decides, and sends commands.

pub mod accounting;
pub mod cache;
pub mod clock;
pub mod config;
pub mod deadline;
pub mod envelope;
pub mod error;
pub mod rebalancer;
pub mod registry;
pub mod selector;
pub mod service;

pub use accounting::{AssignmentOutcome, LoadAccounting, ShardLoadSummary, SystemStats};
pub use cache::{CachedStats, MetricsCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccountingConfig, ConfigError, LedgerConfig, RebalancerConfig, SelectorConfig, TraceShardConfig};
pub use envelope::ApiResponse;
pub use error::{ErrorKind, ShardingError};
pub use rebalancer::{plan_moves, PlannedMove, RebalanceReport, Rebalancer, RecordMove};
pub use registry::{CreateShardRequest, ShardRegistry};
pub use selector::{rank_candidates, PlacementRequest, Priority, PriorityLevel, Recommendation, ShardSelector};
pub use service::{Assignment, Caller, Placement, Role, ShardingService};
