// SHARD DOMAIN TYPES
// Records shared between the ledger contract and off-ledger callers
//
// INVARIANTS:
// 1. 0 <= current_load <= max_capacity for every shard
// 2. Status transitions follow inactive -> active -> {rebalancing, maintenance} -> active
// 3. Type, capacity bounds and region are fixed at creation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ShardId uniquely identifies a shard on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl ShardId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a product, IoT reading or participant record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId(value.to_string())
    }
}

/// Kind of record a shard stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardType {
    Product,
    Iot,
    Participant,
}

impl ShardType {
    pub const ALL: [ShardType; 3] = [ShardType::Product, ShardType::Iot, ShardType::Participant];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardType::Product => "product",
            ShardType::Iot => "iot",
            ShardType::Participant => "participant",
        }
    }
}

impl fmt::Display for ShardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" => Ok(ShardType::Product),
            "iot" => Ok(ShardType::Iot),
            "participant" => Ok(ShardType::Participant),
            other => Err(format!("unknown shard type '{}'", other)),
        }
    }
}

/// Shard status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    /// Created but not yet serving
    Inactive,

    /// Accepting new assignments
    Active,

    /// Shedding records to other shards
    Rebalancing,

    /// Temporarily closed to new assignments
    Maintenance,
}

impl ShardStatus {
    /// Whether the ledger permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: ShardStatus) -> bool {
        use ShardStatus::*;
        matches!(
            (self, next),
            (Inactive, Active)
                | (Active, Rebalancing)
                | (Active, Maintenance)
                | (Active, Inactive)
                | (Rebalancing, Active)
                | (Maintenance, Active)
                | (Maintenance, Inactive)
        )
    }

    pub fn accepts_assignments(&self) -> bool {
        *self == ShardStatus::Active
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Inactive => "inactive",
            ShardStatus::Active => "active",
            ShardStatus::Rebalancing => "rebalancing",
            ShardStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inactive" => Ok(ShardStatus::Inactive),
            "active" => Ok(ShardStatus::Active),
            "rebalancing" => Ok(ShardStatus::Rebalancing),
            "maintenance" => Ok(ShardStatus::Maintenance),
            other => Err(format!("unknown shard status '{}'", other)),
        }
    }
}

/// Full on-ledger shard record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    pub id: ShardId,
    pub shard_type: ShardType,

    /// Address of the contract instance or partition backing this shard
    pub contract_ref: String,

    pub min_capacity: u64,
    pub max_capacity: u64,
    pub current_load: u64,
    pub status: ShardStatus,
    pub region: String,

    /// Records owned by this shard, in assignment order
    pub assigned_records: Vec<RecordId>,

    pub created_at_block: u64,
}

impl ShardInfo {
    pub fn remaining_capacity(&self) -> u64 {
        self.max_capacity.saturating_sub(self.current_load)
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        self.current_load as f64 / self.max_capacity as f64
    }

    pub fn load_percentage(&self) -> f64 {
        self.load_ratio() * 100.0
    }

    pub fn can_accept(&self, slots: u64) -> bool {
        self.status.accepts_assignments()
            && self.current_load.saturating_add(slots) <= self.max_capacity
    }

    pub fn holds(&self, record_id: &RecordId) -> bool {
        self.assigned_records.iter().any(|r| r == record_id)
    }
}

/// Caller-supplied part of a metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub total_transactions: u64,
    pub avg_response_time_ms: f64,

    /// Transactions per second
    pub throughput: f64,

    /// Fraction of failed transactions (0.0 - 1.0)
    pub error_rate: f64,

    /// When the reporter sampled these numbers (unix millis)
    pub observed_at_ms: u64,
}

/// Metrics snapshot as stored on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMetrics {
    pub total_transactions: u64,
    pub avg_response_time_ms: f64,
    pub throughput: f64,
    pub error_rate: f64,

    /// Computed by the contract (0 - 100)
    pub efficiency_score: u8,

    pub observed_at_ms: u64,
    pub updated_at_block: u64,
}
