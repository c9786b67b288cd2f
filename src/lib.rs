//! traceshard: adaptive shard placement for a ledger-backed traceability platform.
//!
//! The workspace is split in two layers:
//!
//! * [`ledger`]: the [`ledger::LedgerClient`] seam, the shard registry
//!   contract rules and an in-memory ledger.
//! * [`placement`]: shard selection, load accounting, the metrics cache, rebalancing and
//!   the [`ShardingService`] facade.
//!
//! ```no_run
//! use std::sync::Arc;
//! use traceshard::{Caller, CreateShardRequest, ShardingService, TraceShardConfig};
//! use traceshard::ledger::{MemoryLedger, ShardType};
//!
//! # async fn run() -> Result<(), traceshard::ShardingError> {
//! let service = ShardingService::new(Arc::new(MemoryLedger::new()), TraceShardConfig::default());
//! let admin = Caller::admin("0xadmin");
//! let shard = service
//!     .create_shard(
//!         &admin,
//!         &CreateShardRequest {
//!             shard_type: ShardType::Product,
//!             contract_ref: "0xproduct".to_string(),
//!             min_capacity: 10,
//!             max_capacity: 100,
//!             region: "US-EAST".to_string(),
//!         },
//!     )
//!     .await?;
//! service.activate_shard(&admin, shard.shard_id).await?;
//! let placed = service.assign_product_to_shard(&admin, "product-1", Some("US-EAST")).await?;
//! assert_eq!(placed.shard_id, shard.shard_id);
//! # Ok(())
//! # }
//! ```

pub use traceshard_core as placement;
pub use traceshard_ledger as ledger;

pub use traceshard_core::{
    ApiResponse, Assignment, Caller, CreateShardRequest, ErrorKind, Placement, PlacementRequest, Priority,
    RebalanceReport, Recommendation, Role, ShardingError, ShardingService, SystemStats, TraceShardConfig,
};
