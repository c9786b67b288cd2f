// SHARDING SERVICE
// The surface the rest of the platform calls: registry commands, placement,
// accounting and aggregate queries, with role checks and ledger-failure policy
//
// INVARIANTS:
// 1. Permission and validation failures are returned before any ledger call
// 2. A missing or unreachable ledger is a LedgerUnavailable result, never a panic
// 3. Every send is bounded by the configured command timeout
// 4. Only the ledger's own write-time check authorizes an assignment

use crate::accounting::{LoadAccounting, SystemStats};
use crate::cache::{CachedStats, MetricsCache};
use crate::clock::{Clock, SystemClock};
use crate::config::TraceShardConfig;
use crate::deadline::with_deadline;
use crate::error::{ErrorKind, ShardingError};
use crate::rebalancer::{RebalanceReport, Rebalancer};
use crate::registry::{parse_shard_type, CreateShardRequest, ShardRegistry};
use crate::selector::{normalized_cost, PlacementRequest, Priority, Recommendation, ShardSelector};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use traceshard_ledger::{
    CreatedShard, LedgerClient, MetricsUpdate, RecordId, ShardId, ShardInfo, ShardMetrics, ShardStatus,
    ShardType, TxContext, TxReceipt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Participant,
    Viewer,
}

/// Authenticated identity on whose behalf a command runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Caller { id: id.into(), role }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn participant(id: impl Into<String>) -> Self {
        Self::new(id, Role::Participant)
    }

    pub fn viewer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Viewer)
    }

    pub fn can_administer(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_assign(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Participant)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Where a new record should be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Placement {
    Sharded(Recommendation),

    /// Sharding skipped; write to default storage
    Unsharded { reason: String },
}

/// A record placed on a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub shard_id: ShardId,
    pub record_id: RecordId,
    pub newly_assigned: bool,
    pub current_load: u64,
    pub reason: String,

    /// Recommend-then-assign rounds used
    pub attempts: u32,

    /// Absent when the record was already placed and nothing was sent
    pub receipt: Option<TxReceipt>,
}

struct Core {
    registry: ShardRegistry,
    selector: ShardSelector,
    accounting: LoadAccounting,
    cache: Arc<MetricsCache>,
    rebalancer: Rebalancer,
}

pub struct ShardingService {
    core: Option<Core>,
    config: TraceShardConfig,
}

fn observe<T>(
    operation: &str,
    shard_id: Option<ShardId>,
    caller: &str,
    result: Result<T, ShardingError>,
) -> Result<T, ShardingError> {
    if let Err(e) = &result {
        let shard = shard_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
        match e.kind() {
            ErrorKind::Validation | ErrorKind::PermissionDenied => {
                debug!("{} rejected (shard {}, caller {}): {}", operation, shard, caller, e)
            }
            _ if e.is_ledger_failure() => {
                error!("{} failed (shard {}, caller {}): {}", operation, shard, caller, e)
            }
            _ => warn!("{} failed (shard {}, caller {}): {}", operation, shard, caller, e),
        }
    }
    result
}

impl ShardingService {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: TraceShardConfig) -> Self {
        Self::with_clock(ledger, config, Arc::new(SystemClock))
    }

    pub fn with_clock(ledger: Arc<dyn LedgerClient>, config: TraceShardConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = ShardRegistry::new(ledger.clone());
        let selector = ShardSelector::new(registry.clone(), config.selector.clone());
        let accounting = LoadAccounting::new(ledger, config.accounting.clone());
        let cache = Arc::new(MetricsCache::new(accounting.clone(), clock, config.accounting.cache_ttl()));
        let rebalancer = Rebalancer::new(
            registry.clone(),
            config.rebalancer.clone(),
            config.ledger.command_timeout(),
        );

        ShardingService {
            core: Some(Core {
                registry,
                selector,
                accounting,
                cache,
                rebalancer,
            }),
            config,
        }
    }

    /// Service with no ledger behind it; every operation degrades
    pub fn unconfigured(config: TraceShardConfig) -> Self {
        warn!("sharding service started without a ledger; placement falls back to default storage");
        ShardingService { core: None, config }
    }

    pub fn is_configured(&self) -> bool {
        self.core.is_some()
    }

    pub fn config(&self) -> &TraceShardConfig {
        &self.config
    }

    fn core(&self) -> Result<&Core, ShardingError> {
        self.core
            .as_ref()
            .ok_or_else(|| ShardingError::LedgerUnavailable("no ledger configured".to_string()))
    }

    fn ctx(&self, caller: &Caller) -> TxContext {
        TxContext::new(caller.id.clone(), self.config.ledger.gas_limit)
    }

    fn require_admin(caller: &Caller, operation: &str) -> Result<(), ShardingError> {
        if caller.can_administer() {
            return Ok(());
        }
        Err(ShardingError::PermissionDenied {
            operation: operation.to_string(),
            caller: caller.id.clone(),
        })
    }

    fn require_writer(caller: &Caller, operation: &str) -> Result<(), ShardingError> {
        if caller.can_assign() {
            return Ok(());
        }
        Err(ShardingError::PermissionDenied {
            operation: operation.to_string(),
            caller: caller.id.clone(),
        })
    }

    async fn send<T, F>(&self, operation: &str, fut: F) -> Result<T, ShardingError>
    where
        F: Future<Output = Result<T, ShardingError>>,
    {
        with_deadline(operation, self.config.ledger.command_timeout(), fut).await
    }

    // ---- registry commands (admin) ----

    pub async fn create_shard(
        &self,
        caller: &Caller,
        request: &CreateShardRequest,
    ) -> Result<CreatedShard, ShardingError> {
        let result: Result<CreatedShard, ShardingError> = async {
            Self::require_admin(caller, "createShard")?;
            request.validate()?;
            let core = self.core()?;
            let created = self
                .send("createShard", core.registry.create_shard(&self.ctx(caller), request))
                .await?;
            info!(
                "shard {} created: {} {}..{} in {} (tx {})",
                created.shard_id,
                request.shard_type,
                request.min_capacity,
                request.max_capacity,
                request.region,
                created.receipt.tx_hash
            );
            Ok(created)
        }
        .await;
        observe("createShard", None, &caller.id, result)
    }

    pub async fn activate_shard(&self, caller: &Caller, shard_id: ShardId) -> Result<TxReceipt, ShardingError> {
        let result: Result<TxReceipt, ShardingError> = async {
            Self::require_admin(caller, "activateShard")?;
            let core = self.core()?;
            let receipt = self
                .send("activateShard", core.registry.activate_shard(&self.ctx(caller), shard_id))
                .await?;
            info!("shard {} activated (tx {})", shard_id, receipt.tx_hash);
            Ok(receipt)
        }
        .await;
        observe("activateShard", Some(shard_id), &caller.id, result)
    }

    pub async fn set_shard_status(
        &self,
        caller: &Caller,
        shard_id: ShardId,
        status: ShardStatus,
    ) -> Result<TxReceipt, ShardingError> {
        let result: Result<TxReceipt, ShardingError> = async {
            Self::require_admin(caller, "setShardStatus")?;
            let core = self.core()?;
            let receipt = self
                .send("setShardStatus", core.registry.set_status(&self.ctx(caller), shard_id, status))
                .await?;
            info!("shard {} now {} (tx {})", shard_id, status, receipt.tx_hash);
            Ok(receipt)
        }
        .await;
        observe("setShardStatus", Some(shard_id), &caller.id, result)
    }

    pub async fn update_shard_metrics(
        &self,
        caller: &Caller,
        shard_id: ShardId,
        update: &MetricsUpdate,
    ) -> Result<TxReceipt, ShardingError> {
        let result: Result<TxReceipt, ShardingError> = async {
            Self::require_admin(caller, "updateShardMetrics")?;
            let core = self.core()?;
            self.send(
                "updateShardMetrics",
                core.accounting.update_metrics(&self.ctx(caller), shard_id, update),
            )
            .await
        }
        .await;
        observe("updateShardMetrics", Some(shard_id), &caller.id, result)
    }

    pub async fn trigger_rebalancing(&self, caller: &Caller) -> Result<RebalanceReport, ShardingError> {
        let result: Result<RebalanceReport, ShardingError> = async {
            Self::require_admin(caller, "triggerRebalancing")?;
            let core = self.core()?;
            core.rebalancer.run_pass(&self.ctx(caller)).await
        }
        .await;
        observe("triggerRebalancing", None, &caller.id, result)
    }

    // ---- placement ----

    /// Place a product record, optionally preferring a region
    pub async fn assign_product_to_shard(
        &self,
        caller: &Caller,
        record_id: &str,
        preferred_region: Option<&str>,
    ) -> Result<Assignment, ShardingError> {
        let request = PlacementRequest::parse("product", 1.0, Priority::default().value(), preferred_region);
        match request {
            Ok(request) => self.assign_record(caller, &RecordId::new(record_id), &request).await,
            Err(e) => observe("assignProductToShard", None, &caller.id, Err(e)),
        }
    }

    /// Recommend a shard and write the assignment, retrying when the chosen
    /// shard is taken between recommendation and write
    ///
    /// A record already on a shard of the requested type is returned as is.
    pub async fn assign_record(
        &self,
        caller: &Caller,
        record_id: &RecordId,
        request: &PlacementRequest,
    ) -> Result<Assignment, ShardingError> {
        let result: Result<Assignment, ShardingError> = async {
            Self::require_writer(caller, "assignRecord")?;
            if record_id.as_str().trim().is_empty() {
                return Err(ShardingError::validation("record id is empty"));
            }
            request.validate()?;
            let core = self.core()?;

            if let Some(existing) = core.registry.ledger().get_record_shard(record_id).await? {
                let shard = core.registry.shard_info(existing).await?;
                if shard.shard_type != request.shard_type {
                    return Err(ShardingError::Conflict(format!(
                        "record {} already lives on {} shard {}",
                        record_id, shard.shard_type, existing
                    )));
                }
                debug!("record {} already on shard {}", record_id, existing);
                return Ok(Assignment {
                    shard_id: existing,
                    record_id: record_id.clone(),
                    newly_assigned: false,
                    current_load: shard.current_load,
                    reason: format!("record already assigned to shard {}", existing),
                    attempts: 0,
                    receipt: None,
                });
            }

            let ctx = self.ctx(caller);
            let max_attempts = self.config.selector.max_placement_attempts;
            for attempt in 1..=max_attempts {
                let recommendation = core.selector.recommend(request).await?;
                let written = self
                    .send(
                        "assignRecord",
                        core.accounting.record_assignment(&ctx, recommendation.shard_id, record_id),
                    )
                    .await;

                match written {
                    Ok(outcome) => {
                        info!(
                            "record {} placed on shard {} (load {}, attempt {})",
                            record_id, outcome.shard_id, outcome.current_load, attempt
                        );
                        return Ok(Assignment {
                            shard_id: outcome.shard_id,
                            record_id: outcome.record_id,
                            newly_assigned: outcome.newly_assigned,
                            current_load: outcome.current_load,
                            reason: recommendation.reason,
                            attempts: attempt,
                            receipt: Some(outcome.receipt),
                        });
                    }
                    Err(e @ ShardingError::ShardFull { .. }) | Err(e @ ShardingError::ShardNotAccepting { .. }) => {
                        warn!(
                            "shard {} lost to a concurrent writer for record {} (attempt {}/{}): {}",
                            recommendation.shard_id, record_id, attempt, max_attempts, e
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            let slots = normalized_cost(request.estimated_cost, self.config.selector.resource_units_per_slot)?;
            Err(ShardingError::CapacityExhausted {
                shard_type: request.shard_type,
                slots,
            })
        }
        .await;
        observe("assignRecord", None, &caller.id, result)
    }

    pub async fn remove_record(
        &self,
        caller: &Caller,
        shard_id: ShardId,
        record_id: &RecordId,
    ) -> Result<TxReceipt, ShardingError> {
        let result: Result<TxReceipt, ShardingError> = async {
            Self::require_writer(caller, "removeRecord")?;
            let core = self.core()?;
            self.send(
                "removeRecord",
                core.accounting.remove_assignment(&self.ctx(caller), shard_id, record_id),
            )
            .await
        }
        .await;
        observe("removeRecord", Some(shard_id), &caller.id, result)
    }

    /// Placement decision with the unsharded fallback applied
    ///
    /// Only an unavailable ledger falls back; capacity and validation
    /// failures still surface so callers can decide to queue or fail.
    pub async fn place(&self, request: &PlacementRequest) -> Result<Placement, ShardingError> {
        match self.recommend_request(request).await {
            Ok(recommendation) => Ok(Placement::Sharded(recommendation)),
            Err(ShardingError::LedgerUnavailable(reason)) => {
                warn!("placing {} record without a shard: {}", request.shard_type, reason);
                Ok(Placement::Unsharded { reason })
            }
            Err(e) => Err(e),
        }
    }

    // ---- reads ----

    pub async fn recommend(
        &self,
        shard_type: &str,
        estimated_cost: f64,
        priority: u8,
        preferred_region: Option<&str>,
    ) -> Result<Recommendation, ShardingError> {
        let request = PlacementRequest::parse(shard_type, estimated_cost, priority, preferred_region);
        match request {
            Ok(request) => self.recommend_request(&request).await,
            Err(e) => observe("recommend", None, "-", Err(e)),
        }
    }

    pub async fn recommend_request(&self, request: &PlacementRequest) -> Result<Recommendation, ShardingError> {
        let result: Result<Recommendation, ShardingError> = async {
            request.validate()?;
            self.core()?.selector.recommend(request).await
        }
        .await;
        observe("recommend", None, "-", result)
    }

    pub async fn get_shard_info(&self, shard_id: ShardId) -> Result<ShardInfo, ShardingError> {
        let result = async { self.core()?.registry.shard_info(shard_id).await }.await;
        observe("getShardInfo", Some(shard_id), "-", result)
    }

    pub async fn get_shards_by_type(&self, shard_type: &str) -> Result<Vec<ShardId>, ShardingError> {
        let result = async {
            let shard_type: ShardType = parse_shard_type(shard_type)?;
            self.core()?.registry.shards_by_type(shard_type).await
        }
        .await;
        observe("getShardsByType", None, "-", result)
    }

    pub async fn get_active_shards(&self) -> Result<Vec<ShardId>, ShardingError> {
        let result = async { self.core()?.registry.active_shards().await }.await;
        observe("getActiveShards", None, "-", result)
    }

    pub async fn get_all_shards(&self) -> Result<Vec<ShardInfo>, ShardingError> {
        let result = async { self.core()?.registry.all_shards().await }.await;
        observe("getAllShards", None, "-", result)
    }

    pub async fn get_shard_load_percentage(&self, shard_id: ShardId) -> Result<f64, ShardingError> {
        let result = async { self.core()?.registry.load_percentage(shard_id).await }.await;
        observe("getShardLoadPercentage", Some(shard_id), "-", result)
    }

    pub async fn get_optimal_shard(&self, region: Option<&str>) -> Result<Recommendation, ShardingError> {
        let result = async { self.core()?.selector.optimal_shard(region).await }.await;
        observe("getOptimalShard", None, "-", result)
    }

    pub async fn get_shard_metrics(&self, shard_id: ShardId) -> Result<Option<ShardMetrics>, ShardingError> {
        let result = async { self.core()?.accounting.shard_metrics(shard_id).await }.await;
        observe("getShardMetrics", Some(shard_id), "-", result)
    }

    /// Fresh aggregate, read through to the ledger
    pub async fn get_system_stats(&self) -> Result<SystemStats, ShardingError> {
        let result = async { self.core()?.accounting.system_stats().await }.await;
        observe("getSystemStats", None, "-", result)
    }

    /// Aggregate from the off-ledger mirror; may be up to one TTL old
    pub async fn get_cached_system_stats(&self) -> Result<CachedStats, ShardingError> {
        let result = async { self.core()?.cache.get().await }.await;
        observe("getCachedSystemStats", None, "-", result)
    }

    pub async fn get_system_efficiency_score(&self) -> Result<f64, ShardingError> {
        let result = async { self.core()?.accounting.system_efficiency_score().await }.await;
        observe("getSystemEfficiencyScore", None, "-", result)
    }

    // ---- background work ----

    /// Start the cache refresher and, if configured, periodic rebalancing
    ///
    /// Both stop when `shutdown` flips to true.
    pub fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Some(core) = self.core.as_ref() else {
            return Vec::new();
        };

        let mut handles = vec![core
            .cache
            .clone()
            .spawn_refresher(self.config.accounting.cache_ttl(), shutdown.clone())];

        if let Some(secs) = self.config.rebalancer.auto_interval_secs {
            let rebalancer = core.rebalancer.clone();
            let ctx = TxContext::new(self.config.ledger.service_account.clone(), self.config.ledger.gas_limit);
            let mut shutdown = shutdown;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                // skip the immediate first tick
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match rebalancer.run_pass(&ctx).await {
                                Ok(report) if !report.is_complete() => {
                                    warn!("scheduled rebalance pass {} interrupted", report.pass)
                                }
                                Ok(_) => {}
                                Err(e) => error!("scheduled rebalance failed: {}", e),
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use traceshard_ledger::{LedgerError, MemoryLedger};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn admin() -> Caller {
        Caller::admin("0xadmin")
    }

    fn product_shard(region: &str, max: u64) -> CreateShardRequest {
        CreateShardRequest {
            shard_type: ShardType::Product,
            contract_ref: "0xproduct".to_string(),
            min_capacity: 1,
            max_capacity: max,
            region: region.to_string(),
        }
    }

    async fn service_with_shards(shards: &[(&str, u64)]) -> (Arc<MemoryLedger>, ShardingService, Vec<ShardId>) {
        init_logs();
        let ledger = Arc::new(MemoryLedger::new());
        let service = ShardingService::new(ledger.clone(), TraceShardConfig::default());
        let mut ids = Vec::new();
        for (region, max) in shards {
            let id = service.create_shard(&admin(), &product_shard(region, *max)).await.unwrap().shard_id;
            service.activate_shard(&admin(), id).await.unwrap();
            ids.push(id);
        }
        (ledger, service, ids)
    }

    #[tokio::test]
    async fn test_admin_commands_require_admin() {
        let (ledger, service, ids) = service_with_shards(&[("US-EAST", 10)]).await;
        let block = ledger.block_number().await.unwrap();

        for caller in [Caller::participant("0xp"), Caller::viewer("0xv")] {
            let err = service.create_shard(&caller, &product_shard("US-EAST", 10)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
            let err = service.activate_shard(&caller, ids[0]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
            let err = service.trigger_rebalancing(&caller).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        }
        let err = service
            .assign_product_to_shard(&Caller::viewer("0xv"), "p-1", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        assert_eq!(ledger.block_number().await.unwrap(), block);
    }

    #[tokio::test]
    async fn test_assign_product_is_idempotent() {
        let (_ledger, service, ids) = service_with_shards(&[("US-EAST", 10)]).await;
        let participant = Caller::participant("0xfarm");

        let first = service.assign_product_to_shard(&participant, "p-1", None).await.unwrap();
        assert!(first.newly_assigned);
        assert_eq!(first.shard_id, ids[0]);
        assert!(first.receipt.is_some());

        let again = service.assign_product_to_shard(&participant, "p-1", None).await.unwrap();
        assert!(!again.newly_assigned);
        assert!(again.receipt.is_none());
        assert_eq!(again.current_load, 1);
        assert_eq!(service.get_shard_info(ids[0]).await.unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn test_regional_preference() {
        let (_ledger, service, ids) = service_with_shards(&[("US-EAST", 10), ("EU-WEST", 10)]).await;
        let placed = service
            .assign_product_to_shard(&admin(), "p-eu", Some("EU-WEST"))
            .await
            .unwrap();
        assert_eq!(placed.shard_id, ids[1]);

        // EU-WEST now 1/10, US-EAST 0/10: load wins over region
        let optimal = service.get_optimal_shard(Some("EU-WEST")).await.unwrap();
        assert_eq!(optimal.shard_id, ids[0]);
    }

    #[tokio::test]
    async fn test_validation_before_ledger() {
        let (ledger, service, _) = service_with_shards(&[("US-EAST", 10)]).await;
        let block = ledger.block_number().await.unwrap();

        assert_eq!(
            service.recommend("warehouse", 1.0, 1, None).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            service.get_shards_by_type("pallet").await.unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            service
                .create_shard(&admin(), &product_shard("US;EAST", 10))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            service.assign_product_to_shard(&admin(), "  ", None).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert_eq!(ledger.block_number().await.unwrap(), block);
    }

    #[tokio::test]
    async fn test_unconfigured_service_degrades() {
        let service = ShardingService::unconfigured(TraceShardConfig::default());
        assert!(!service.is_configured());

        let request = PlacementRequest::new(ShardType::Product, 1.0, Priority::default());
        assert!(matches!(service.place(&request).await.unwrap(), Placement::Unsharded { .. }));

        let unavailable = |e: ShardingError| e.kind() == ErrorKind::LedgerUnavailable;
        assert!(unavailable(service.get_active_shards().await.unwrap_err()));
        assert!(unavailable(service.get_system_stats().await.unwrap_err()));
        assert!(unavailable(service.get_cached_system_stats().await.unwrap_err()));
        assert!(unavailable(service.get_optimal_shard(None).await.unwrap_err()));
        assert!(unavailable(
            service.assign_product_to_shard(&admin(), "p-1", None).await.unwrap_err()
        ));
        assert!(unavailable(service.trigger_rebalancing(&admin()).await.unwrap_err()));
        assert!(service.spawn_background_tasks(watch::channel(false).1).is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_service_still_validates() {
        let service = ShardingService::unconfigured(TraceShardConfig::default());
        let negative = PlacementRequest::new(ShardType::Product, -5.0, Priority::default());

        assert_eq!(service.place(&negative).await.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(
            service.recommend_request(&negative).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            service.recommend("product", f64::NAN, 5, None).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn test_unreachable_ledger_degrades() {
        let (ledger, service, ids) = service_with_shards(&[("US-EAST", 10)]).await;
        ledger.set_available(false);

        let request = PlacementRequest::new(ShardType::Product, 1.0, Priority::default());
        assert!(matches!(service.place(&request).await.unwrap(), Placement::Unsharded { .. }));
        assert_eq!(
            service.get_shard_load_percentage(ids[0]).await.unwrap_err().kind(),
            ErrorKind::LedgerUnavailable
        );
        assert_eq!(
            service.get_system_efficiency_score().await.unwrap_err().kind(),
            ErrorKind::LedgerUnavailable
        );

        ledger.set_available(true);
        assert!(matches!(service.place(&request).await.unwrap(), Placement::Sharded(_)));
    }

    #[tokio::test]
    async fn test_slow_send_is_outcome_unknown() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut config = TraceShardConfig::default();
        config.ledger.command_timeout_ms = Some(20);
        let service = ShardingService::new(ledger.clone(), config);

        ledger.set_latency(Some(Duration::from_millis(200)));
        let err = service.create_shard(&admin(), &product_shard("US-EAST", 10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutcomeUnknown);
        assert_eq!(err.status_code(), 504);
    }

    /// Ledger where another writer grabs the last slot of a shard right
    /// before our assignment lands
    struct RacingLedger {
        inner: MemoryLedger,
        race_on: Mutex<Option<ShardId>>,
    }

    #[async_trait]
    impl LedgerClient for RacingLedger {
        async fn get_shard_info(&self, shard_id: ShardId) -> Result<ShardInfo, LedgerError> {
            self.inner.get_shard_info(shard_id).await
        }

        async fn get_shards_by_type(&self, shard_type: ShardType) -> Result<Vec<ShardId>, LedgerError> {
            self.inner.get_shards_by_type(shard_type).await
        }

        async fn get_active_shards(&self) -> Result<Vec<ShardId>, LedgerError> {
            self.inner.get_active_shards().await
        }

        async fn get_all_shards(&self) -> Result<Vec<ShardInfo>, LedgerError> {
            self.inner.get_all_shards().await
        }

        async fn get_shard_metrics(&self, shard_id: ShardId) -> Result<Option<ShardMetrics>, LedgerError> {
            self.inner.get_shard_metrics(shard_id).await
        }

        async fn get_record_shard(&self, record_id: &RecordId) -> Result<Option<ShardId>, LedgerError> {
            self.inner.get_record_shard(record_id).await
        }

        async fn block_number(&self) -> Result<u64, LedgerError> {
            self.inner.block_number().await
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
            self.inner
                .create_shard(ctx, shard_type, contract_ref, min_capacity, max_capacity, region)
                .await
        }

        async fn activate_shard(&self, ctx: &TxContext, shard_id: ShardId) -> Result<TxReceipt, LedgerError> {
            self.inner.activate_shard(ctx, shard_id).await
        }

        async fn set_shard_status(
            &self,
            ctx: &TxContext,
            shard_id: ShardId,
            status: ShardStatus,
        ) -> Result<TxReceipt, LedgerError> {
            self.inner.set_shard_status(ctx, shard_id, status).await
        }

        async fn assign_record(
            &self,
            ctx: &TxContext,
            shard_id: ShardId,
            record_id: &RecordId,
        ) -> Result<TxReceipt, LedgerError> {
            let race = {
                let mut target = self.race_on.lock();
                if *target == Some(shard_id) {
                    *target = None;
                    true
                } else {
                    false
                }
            };
            if race {
                let rival = TxContext::new("0xrival", ctx.gas_limit);
                self.inner.assign_record(&rival, shard_id, &RecordId::new("rival")).await?;
            }
            self.inner.assign_record(ctx, shard_id, record_id).await
        }

        async fn remove_record(
            &self,
            ctx: &TxContext,
            shard_id: ShardId,
            record_id: &RecordId,
        ) -> Result<TxReceipt, LedgerError> {
            self.inner.remove_record(ctx, shard_id, record_id).await
        }

        async fn transfer_record(
            &self,
            ctx: &TxContext,
            record_id: &RecordId,
            from: ShardId,
            to: ShardId,
        ) -> Result<TxReceipt, LedgerError> {
            self.inner.transfer_record(ctx, record_id, from, to).await
        }

        async fn update_metrics(
            &self,
            ctx: &TxContext,
            shard_id: ShardId,
            update: &MetricsUpdate,
        ) -> Result<TxReceipt, LedgerError> {
            self.inner.update_metrics(ctx, shard_id, update).await
        }

        async fn trigger_rebalancing(&self, ctx: &TxContext) -> Result<(u64, TxReceipt), LedgerError> {
            self.inner.trigger_rebalancing(ctx).await
        }
    }

    #[tokio::test]
    async fn test_lost_race_re_recommends() {
        init_logs();
        let ledger = Arc::new(RacingLedger {
            inner: MemoryLedger::new(),
            race_on: Mutex::new(None),
        });
        let service = ShardingService::new(ledger.clone(), TraceShardConfig::default());

        let a = service.create_shard(&admin(), &product_shard("US-EAST", 2)).await.unwrap().shard_id;
        let b = service.create_shard(&admin(), &product_shard("EU-WEST", 4)).await.unwrap().shard_id;
        service.activate_shard(&admin(), a).await.unwrap();
        service.activate_shard(&admin(), b).await.unwrap();
        service.assign_product_to_shard(&admin(), "a-1", Some("US-EAST")).await.unwrap();
        service.assign_product_to_shard(&admin(), "b-1", Some("EU-WEST")).await.unwrap();
        service.assign_product_to_shard(&admin(), "b-2", Some("EU-WEST")).await.unwrap();

        // A is 1/2 (0.5), B is 2/4 (0.5): A wins on id, then the rival fills it
        *ledger.race_on.lock() = Some(a);
        let placed = service.assign_product_to_shard(&admin(), "p-1", None).await.unwrap();
        assert_eq!(placed.shard_id, b);
        assert_eq!(placed.attempts, 2);

        let shard_a = service.get_shard_info(a).await.unwrap();
        assert!(shard_a.current_load <= shard_a.max_capacity);
    }

    #[tokio::test]
    async fn test_full_system_is_capacity_exhausted() {
        let (_ledger, service, _) = service_with_shards(&[("US-EAST", 1), ("EU-WEST", 1)]).await;
        service.assign_product_to_shard(&admin(), "p-1", None).await.unwrap();
        service.assign_product_to_shard(&admin(), "p-2", None).await.unwrap();

        let err = service.assign_product_to_shard(&admin(), "p-3", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);

        let empty = ShardingService::new(Arc::new(MemoryLedger::new()), TraceShardConfig::default());
        let err = empty.assign_product_to_shard(&admin(), "p-1", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoShardAvailable);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut config = TraceShardConfig::default();
        config.rebalancer.auto_interval_secs = Some(3600);
        let service = ShardingService::new(ledger, config);

        let (tx, rx) = watch::channel(false);
        let handles = service.spawn_background_tasks(rx);
        assert_eq!(handles.len(), 2);

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }
}
