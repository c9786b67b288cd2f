// SHARD SELECTOR
// Load- and capacity-aware placement of new records
//
// INVARIANTS:
// 1. A shard is only recommended if current_load + cost fits within its capacity
// 2. Lowest load ratio wins; preferred region breaks ties, then lowest shard id
// 3. Same snapshot -> same recommendation (no randomness, no float ordering)
// 4. "No shard" and "no capacity" are reported as different errors
//
// A recommendation is advisory. The ledger re-checks capacity when the
// assignment is written, and only that check authorizes a placement.

use crate::config::SelectorConfig;
use crate::error::ShardingError;
use crate::registry::{parse_shard_type, validate_region, ShardRegistry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use traceshard_ledger::{ShardId, ShardInfo, ShardType};

/// Request priority, 1 (lowest) to 10 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Result<Self, ShardingError> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ShardingError::validation(format!(
                "priority must be within {}..={}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )));
        }
        Ok(Priority(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn level(&self) -> PriorityLevel {
        match self.0 {
            1..=3 => PriorityLevel::Low,
            4..=7 => PriorityLevel::Normal,
            _ => PriorityLevel::High,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityLevel {
    Low,
    Normal,
    High,
}

/// A validated placement request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRequest {
    pub shard_type: ShardType,
    pub estimated_cost: f64,
    pub priority: Priority,
    pub preferred_region: Option<String>,
}

impl PlacementRequest {
    pub fn new(shard_type: ShardType, estimated_cost: f64, priority: Priority) -> Self {
        PlacementRequest {
            shard_type,
            estimated_cost,
            priority,
            preferred_region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.preferred_region = Some(region.into());
        self
    }

    /// Build from untyped input, rejecting anything malformed
    pub fn parse(
        shard_type: &str,
        estimated_cost: f64,
        priority: u8,
        preferred_region: Option<&str>,
    ) -> Result<Self, ShardingError> {
        let shard_type = parse_shard_type(shard_type)?;
        let priority = Priority::new(priority)?;
        let preferred_region = match preferred_region {
            Some(region) => Some(validate_region(region)?.to_string()),
            None => None,
        };
        let request = PlacementRequest {
            shard_type,
            estimated_cost,
            priority,
            preferred_region,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ShardingError> {
        if !self.estimated_cost.is_finite() || self.estimated_cost < 0.0 {
            return Err(ShardingError::validation(format!(
                "estimated resource cost must be a non-negative number, got {}",
                self.estimated_cost
            )));
        }
        if let Some(region) = &self.preferred_region {
            validate_region(region)?;
        }
        Ok(())
    }
}

/// Outcome of a successful placement decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub shard_id: ShardId,
    pub region: String,
    pub current_load: u64,
    pub max_capacity: u64,
    pub load_ratio: f64,

    /// Number of shards that could have taken the request
    pub eligible: usize,

    /// Advisory, for logs and dashboards
    pub reason: String,
}

/// Capacity slots consumed by a request of `cost` resource units (at least one)
pub fn normalized_cost(cost: f64, units_per_slot: f64) -> Result<u64, ShardingError> {
    if !cost.is_finite() || cost < 0.0 {
        return Err(ShardingError::validation("estimated resource cost must be a non-negative number"));
    }
    let slots = (cost / units_per_slot).ceil();
    if slots > u64::MAX as f64 {
        return Err(ShardingError::validation("estimated resource cost is too large"));
    }
    Ok((slots as u64).max(1))
}

/// Capacity a request may fill up to, after any priority reservation
fn usable_capacity(shard: &ShardInfo, priority: Priority, config: &SelectorConfig) -> u64 {
    if priority.value() >= config.high_priority_threshold || config.reserved_headroom_ratio <= 0.0 {
        return shard.max_capacity;
    }
    let reserved = (shard.max_capacity as f64 * config.reserved_headroom_ratio).floor() as u64;
    shard.max_capacity.saturating_sub(reserved)
}

/// Order by load ratio (exact, via cross-multiplication), then region match, then id
fn compare_candidates(a: &ShardInfo, b: &ShardInfo, preferred_region: Option<&str>) -> Ordering {
    let lhs = a.current_load as u128 * b.max_capacity as u128;
    let rhs = b.current_load as u128 * a.max_capacity as u128;

    lhs.cmp(&rhs)
        .then_with(|| match preferred_region {
            Some(region) => {
                let a_match = a.region.eq_ignore_ascii_case(region);
                let b_match = b.region.eq_ignore_ascii_case(region);
                b_match.cmp(&a_match)
            }
            None => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Eligible shards, best first
pub fn rank_candidates<'a>(
    shards: &'a [ShardInfo],
    slots: u64,
    priority: Priority,
    preferred_region: Option<&str>,
    config: &SelectorConfig,
) -> Vec<&'a ShardInfo> {
    let mut eligible: Vec<&ShardInfo> = shards
        .iter()
        .filter(|s| s.status.accepts_assignments())
        .filter(|s| s.current_load.saturating_add(slots) <= usable_capacity(s, priority, config))
        .collect();
    eligible.sort_by(|a, b| compare_candidates(a, b, preferred_region));
    eligible
}

/// Pick a shard from a snapshot of every shard of the requested type
pub fn select(
    shards: &[ShardInfo],
    request: &PlacementRequest,
    config: &SelectorConfig,
) -> Result<Recommendation, ShardingError> {
    let shard_type = request.shard_type;
    let slots = normalized_cost(request.estimated_cost, config.resource_units_per_slot)?;

    let of_type: Vec<ShardInfo> = shards.iter().filter(|s| s.shard_type == shard_type).cloned().collect();
    if of_type.is_empty() {
        return Err(ShardingError::NoShardAvailable {
            shard_type,
            detail: "no shard of this type has been provisioned".to_string(),
        });
    }
    if !of_type.iter().any(|s| s.status.accepts_assignments()) {
        return Err(ShardingError::NoShardAvailable {
            shard_type,
            detail: format!("{} shard(s) exist but none is active", of_type.len()),
        });
    }

    let region = request.preferred_region.as_deref();
    let ranked = rank_candidates(&of_type, slots, request.priority, region, config);
    let best = match ranked.first() {
        Some(best) => *best,
        None => return Err(ShardingError::CapacityExhausted { shard_type, slots }),
    };

    let region_note = match region {
        Some(r) if best.region.eq_ignore_ascii_case(r) => format!(", in preferred region {}", r),
        Some(r) => format!(", outside preferred region {}", r),
        None => String::new(),
    };
    let reason = format!(
        "shard {} ({}) at {}/{} ({:.1}%) has the lowest load ratio of {} eligible {} shard(s){}",
        best.id,
        best.region,
        best.current_load,
        best.max_capacity,
        best.load_percentage(),
        ranked.len(),
        shard_type,
        region_note
    );

    Ok(Recommendation {
        shard_id: best.id,
        region: best.region.clone(),
        current_load: best.current_load,
        max_capacity: best.max_capacity,
        load_ratio: best.load_ratio(),
        eligible: ranked.len(),
        reason,
    })
}

#[derive(Clone)]
pub struct ShardSelector {
    registry: ShardRegistry,
    config: SelectorConfig,
}

impl ShardSelector {
    pub fn new(registry: ShardRegistry, config: SelectorConfig) -> Self {
        ShardSelector { registry, config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Recommend a shard for a new record, reading fresh state from the ledger
    pub async fn recommend(&self, request: &PlacementRequest) -> Result<Recommendation, ShardingError> {
        request.validate()?;
        let shards = self.registry.snapshot_of_type(request.shard_type).await?;
        select(&shards, request, &self.config)
    }

    /// Best product shard for a region (`getOptimalShard`)
    pub async fn optimal_shard(&self, region: Option<&str>) -> Result<Recommendation, ShardingError> {
        let mut request = PlacementRequest::new(ShardType::Product, 1.0, Priority::default());
        if let Some(region) = region {
            request = request.with_region(validate_region(region)?);
        }
        self.recommend(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use traceshard_ledger::ShardStatus;

    fn shard(id: u64, load: u64, max: u64, region: &str, status: ShardStatus) -> ShardInfo {
        ShardInfo {
            id: ShardId(id),
            shard_type: ShardType::Product,
            contract_ref: format!("0x{:040x}", id),
            min_capacity: 1,
            max_capacity: max,
            current_load: load,
            status,
            region: region.to_string(),
            assigned_records: Vec::new(),
            created_at_block: id,
        }
    }

    fn request() -> PlacementRequest {
        PlacementRequest::new(ShardType::Product, 1.0, Priority::new(1).unwrap())
    }

    #[test]
    fn test_lower_load_ratio_wins_over_creation_order() {
        let shards = vec![
            shard(1, 95, 100, "US-EAST", ShardStatus::Active),
            shard(2, 10, 100, "EU-WEST", ShardStatus::Active),
        ];
        let rec = select(&shards, &request(), &SelectorConfig::default()).unwrap();
        assert_eq!(rec.shard_id, ShardId(2));
        assert_eq!(rec.eligible, 2);
    }

    #[test]
    fn test_ratio_not_absolute_load() {
        // 40/400 = 0.10 beats 20/100 = 0.20
        let shards = vec![
            shard(1, 20, 100, "US-EAST", ShardStatus::Active),
            shard(2, 40, 400, "US-EAST", ShardStatus::Active),
        ];
        assert_eq!(select(&shards, &request(), &SelectorConfig::default()).unwrap().shard_id, ShardId(2));
    }

    #[test]
    fn test_region_breaks_ties_then_lowest_id() {
        let shards = vec![
            shard(1, 10, 100, "US-EAST", ShardStatus::Active),
            shard(2, 10, 100, "EU-WEST", ShardStatus::Active),
            shard(3, 10, 100, "EU-WEST", ShardStatus::Active),
        ];
        let config = SelectorConfig::default();

        assert_eq!(select(&shards, &request(), &config).unwrap().shard_id, ShardId(1));

        let regional = request().with_region("eu-west");
        let rec = select(&shards, &regional, &config).unwrap();
        assert_eq!(rec.shard_id, ShardId(2));
        assert!(rec.reason.contains("in preferred region"));
    }

    #[test]
    fn test_region_does_not_override_load() {
        let shards = vec![
            shard(1, 10, 100, "US-EAST", ShardStatus::Active),
            shard(2, 50, 100, "EU-WEST", ShardStatus::Active),
        ];
        let rec = select(&shards, &request().with_region("EU-WEST"), &SelectorConfig::default()).unwrap();
        assert_eq!(rec.shard_id, ShardId(1));
    }

    #[test]
    fn test_full_shards_give_capacity_exhausted() {
        let shards = vec![
            shard(1, 100, 100, "US-EAST", ShardStatus::Active),
            shard(2, 100, 100, "EU-WEST", ShardStatus::Active),
        ];
        let err = select(&shards, &request(), &SelectorConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
    }

    #[test]
    fn test_no_shards_gives_no_shard_available() {
        let err = select(&[], &request(), &SelectorConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoShardAvailable);

        let inactive = vec![shard(1, 0, 100, "US-EAST", ShardStatus::Inactive)];
        let err = select(&inactive, &request(), &SelectorConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoShardAvailable);
    }

    #[test]
    fn test_cost_must_fit_remaining_capacity() {
        let shards = vec![shard(1, 95, 100, "US-EAST", ShardStatus::Active)];
        let config = SelectorConfig::default();

        let fits = PlacementRequest::new(ShardType::Product, 5.0, Priority::default());
        assert!(select(&shards, &fits, &config).is_ok());

        let too_big = PlacementRequest::new(ShardType::Product, 5.5, Priority::default());
        assert_eq!(select(&shards, &too_big, &config).unwrap_err().kind(), ErrorKind::CapacityExhausted);
    }

    #[test]
    fn test_non_active_shards_are_skipped() {
        let shards = vec![
            shard(1, 0, 100, "US-EAST", ShardStatus::Maintenance),
            shard(2, 0, 100, "US-EAST", ShardStatus::Rebalancing),
            shard(3, 50, 100, "US-EAST", ShardStatus::Active),
        ];
        assert_eq!(select(&shards, &request(), &SelectorConfig::default()).unwrap().shard_id, ShardId(3));
    }

    #[test]
    fn test_headroom_reserved_for_high_priority() {
        let shards = vec![shard(1, 90, 100, "US-EAST", ShardStatus::Active)];
        let config = SelectorConfig {
            reserved_headroom_ratio: 0.1,
            ..SelectorConfig::default()
        };

        let low = PlacementRequest::new(ShardType::Product, 1.0, Priority::new(2).unwrap());
        assert_eq!(select(&shards, &low, &config).unwrap_err().kind(), ErrorKind::CapacityExhausted);

        let urgent = PlacementRequest::new(ShardType::Product, 1.0, Priority::new(9).unwrap());
        assert_eq!(select(&shards, &urgent, &config).unwrap().shard_id, ShardId(1));
    }

    #[test]
    fn test_normalized_cost() {
        assert_eq!(normalized_cost(0.0, 1.0).unwrap(), 1);
        assert_eq!(normalized_cost(2.1, 1.0).unwrap(), 3);
        assert_eq!(normalized_cost(10.0, 5.0).unwrap(), 2);
        assert!(normalized_cost(-1.0, 1.0).is_err());
        assert!(normalized_cost(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            PlacementRequest::parse("warehouse", 1.0, 1, None).unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert!(PlacementRequest::parse("product", 1.0, 0, None).is_err());
        assert!(PlacementRequest::parse("product", 1.0, 11, None).is_err());
        assert!(PlacementRequest::parse("product", 1.0, 5, Some("")).is_err());
        assert!(PlacementRequest::parse("iot", 3.0, 5, Some("AP-SOUTH")).is_ok());
    }

    #[test]
    fn test_recommendation_is_deterministic() {
        let shards: Vec<ShardInfo> = (1..=20)
            .map(|i| shard(i, (i * 7) % 13, 50, if i % 2 == 0 { "EU" } else { "US" }, ShardStatus::Active))
            .collect();
        let req = request().with_region("EU");
        let first = select(&shards, &req, &SelectorConfig::default()).unwrap();
        for _ in 0..10 {
            assert_eq!(select(&shards, &req, &SelectorConfig::default()).unwrap(), first);
        }
    }
}
