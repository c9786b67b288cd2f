// METRICS CACHE
// Off-ledger mirror of the system stats, for dashboards
//
// INVARIANTS:
// 1. Never writes to the ledger
// 2. Never consulted for a capacity decision
// 3. An entry older than the TTL is served only when the ledger is unreachable,
//    and is then flagged stale

use crate::accounting::{LoadAccounting, SystemStats};
use crate::clock::Clock;
use crate::error::ShardingError;
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedStats {
    pub stats: SystemStats,
    pub fetched_at_ms: u64,

    /// Older than the TTL; served because a refresh failed
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    stats: SystemStats,
    fetched_at_ms: u64,
}

pub struct MetricsCache {
    accounting: LoadAccounting,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entry: RwLock<Option<Entry>>,
}

impl MetricsCache {
    pub fn new(accounting: LoadAccounting, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        MetricsCache {
            accounting,
            clock,
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, entry: &Entry) -> bool {
        self.clock.now_ms().saturating_sub(entry.fetched_at_ms) < self.ttl.as_millis() as u64
    }

    /// Current entry without touching the ledger
    pub fn peek(&self) -> Option<CachedStats> {
        let guard = self.entry.read();
        guard.as_ref().map(|entry| CachedStats {
            stats: entry.stats.clone(),
            fetched_at_ms: entry.fetched_at_ms,
            stale: !self.is_fresh(entry),
        })
    }

    /// Cached stats, refreshed from the ledger once the TTL has passed
    pub async fn get(&self) -> Result<CachedStats, ShardingError> {
        if let Some(cached) = self.peek() {
            if !cached.stale {
                return Ok(cached);
            }
        }

        match self.refresh().await {
            Ok(fresh) => Ok(fresh),
            Err(err) if err.is_ledger_failure() => match self.peek() {
                Some(mut cached) => {
                    warn!("serving stale system stats from {}: {}", cached.fetched_at_ms, err);
                    cached.stale = true;
                    Ok(cached)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Recompute from the ledger and replace the entry
    pub async fn refresh(&self) -> Result<CachedStats, ShardingError> {
        let stats = self.accounting.system_stats().await?;
        let fetched_at_ms = self.clock.now_ms();
        *self.entry.write() = Some(Entry {
            stats: stats.clone(),
            fetched_at_ms,
        });
        debug!("system stats refreshed ({} shards)", stats.total_shards);
        Ok(CachedStats {
            stats,
            fetched_at_ms,
            stale: false,
        })
    }

    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }

    /// Refresh on `interval` until `shutdown` flips to true or its sender drops
    pub fn spawn_refresher(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!("metrics cache refresh failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("metrics cache refresher stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AccountingConfig;
    use crate::error::ErrorKind;
    use traceshard_ledger::{LedgerClient, MemoryLedger, RecordId, ShardType, TxContext};

    async fn setup() -> (Arc<MemoryLedger>, Arc<ManualClock>, MetricsCache) {
        let ledger = Arc::new(MemoryLedger::new());
        let ctx = TxContext::new("0xadmin", 1_000_000);
        let id = ledger
            .create_shard(&ctx, ShardType::Product, "0xproduct", 1, 100, "US-EAST")
            .await
            .unwrap()
            .shard_id;
        ledger.activate_shard(&ctx, id).await.unwrap();

        let clock = Arc::new(ManualClock::new(1_000));
        let accounting = LoadAccounting::new(ledger.clone(), AccountingConfig::default());
        let cache = MetricsCache::new(accounting, clock.clone(), Duration::from_secs(60));
        (ledger, clock, cache)
    }

    #[tokio::test]
    async fn test_serves_cached_value_within_ttl() {
        let (ledger, clock, cache) = setup().await;
        let ctx = TxContext::new("0xadmin", 1_000_000);

        assert!(cache.peek().is_none());
        let first = cache.get().await.unwrap();
        assert_eq!(first.stats.shards[0].current_load, 0);

        let id = first.stats.shards[0].shard_id;
        ledger.assign_record(&ctx, id, &RecordId::new("p-1")).await.unwrap();

        clock.advance(Duration::from_secs(30));
        let cached = cache.get().await.unwrap();
        assert_eq!(cached.stats.shards[0].current_load, 0);
        assert_eq!(cached.fetched_at_ms, 1_000);

        clock.advance(Duration::from_secs(31));
        let refreshed = cache.get().await.unwrap();
        assert_eq!(refreshed.stats.shards[0].current_load, 1);
        assert!(!refreshed.stale);
    }

    #[tokio::test]
    async fn test_falls_back_to_stale_when_ledger_down() {
        let (ledger, clock, cache) = setup().await;
        cache.get().await.unwrap();

        ledger.set_available(false);
        clock.advance(Duration::from_secs(120));
        let served = cache.get().await.unwrap();
        assert!(served.stale);
        assert_eq!(served.fetched_at_ms, 1_000);

        cache.invalidate();
        assert_eq!(cache.get().await.unwrap_err().kind(), ErrorKind::LedgerUnavailable);
    }

    #[tokio::test]
    async fn test_never_writes_to_ledger() {
        let (ledger, clock, cache) = setup().await;
        let block = ledger.block_number().await.unwrap();
        for _ in 0..3 {
            cache.refresh().await.unwrap();
            clock.advance(Duration::from_secs(61));
            cache.get().await.unwrap();
        }
        assert_eq!(ledger.block_number().await.unwrap(), block);
    }

    #[tokio::test]
    async fn test_refresher_stops_on_shutdown() {
        let (_ledger, _clock, cache) = setup().await;
        let cache = Arc::new(cache);
        let (tx, rx) = watch::channel(false);

        let handle = cache.clone().spawn_refresher(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.peek().is_some());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
