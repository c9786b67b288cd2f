// SHARD REGISTRY
// Typed, validated view of the on-ledger registry. Validation happens here so
// malformed requests never reach the ledger.

use crate::error::ShardingError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use traceshard_ledger::contract::MAX_REGION_LEN;
use traceshard_ledger::{
    CreatedShard, LedgerClient, ShardId, ShardInfo, ShardStatus, ShardType, TxContext, TxReceipt,
};

/// Parameters of an admin `createShard` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShardRequest {
    pub shard_type: ShardType,
    pub contract_ref: String,
    pub min_capacity: u64,
    pub max_capacity: u64,
    pub region: String,
}

impl CreateShardRequest {
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.min_capacity == 0 || self.max_capacity == 0 {
            return Err(ShardingError::validation("capacities must be positive"));
        }
        if self.max_capacity <= self.min_capacity {
            return Err(ShardingError::validation(format!(
                "max capacity {} must exceed min capacity {}",
                self.max_capacity, self.min_capacity
            )));
        }
        if self.contract_ref.trim().is_empty() {
            return Err(ShardingError::validation("contract reference is empty"));
        }
        validate_region(&self.region)?;
        Ok(())
    }
}

/// Accepts ASCII alphanumerics, '-', '_' and spaces; returns the trimmed tag
pub fn validate_region(region: &str) -> Result<&str, ShardingError> {
    let region = region.trim();
    if region.is_empty() || region.len() > MAX_REGION_LEN {
        return Err(ShardingError::validation(format!(
            "region must be 1..={} characters",
            MAX_REGION_LEN
        )));
    }
    if !region
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ')
    {
        return Err(ShardingError::validation(format!("region '{}' contains invalid characters", region)));
    }
    Ok(region)
}

pub fn parse_shard_type(raw: &str) -> Result<ShardType, ShardingError> {
    raw.parse::<ShardType>().map_err(ShardingError::Validation)
}

#[derive(Clone)]
pub struct ShardRegistry {
    ledger: Arc<dyn LedgerClient>,
}

impl ShardRegistry {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        ShardRegistry { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    pub async fn create_shard(
        &self,
        ctx: &TxContext,
        request: &CreateShardRequest,
    ) -> Result<CreatedShard, ShardingError> {
        request.validate()?;
        let created = self
            .ledger
            .create_shard(
                ctx,
                request.shard_type,
                request.contract_ref.trim(),
                request.min_capacity,
                request.max_capacity,
                request.region.trim(),
            )
            .await?;
        Ok(created)
    }

    pub async fn activate_shard(&self, ctx: &TxContext, shard_id: ShardId) -> Result<TxReceipt, ShardingError> {
        Ok(self.ledger.activate_shard(ctx, shard_id).await?)
    }

    pub async fn set_status(
        &self,
        ctx: &TxContext,
        shard_id: ShardId,
        status: ShardStatus,
    ) -> Result<TxReceipt, ShardingError> {
        Ok(self.ledger.set_shard_status(ctx, shard_id, status).await?)
    }

    pub async fn shard_info(&self, shard_id: ShardId) -> Result<ShardInfo, ShardingError> {
        Ok(self.ledger.get_shard_info(shard_id).await?)
    }

    pub async fn shards_by_type(&self, shard_type: ShardType) -> Result<Vec<ShardId>, ShardingError> {
        Ok(self.ledger.get_shards_by_type(shard_type).await?)
    }

    pub async fn active_shards(&self) -> Result<Vec<ShardId>, ShardingError> {
        Ok(self.ledger.get_active_shards().await?)
    }

    pub async fn all_shards(&self) -> Result<Vec<ShardInfo>, ShardingError> {
        let mut shards = self.ledger.get_all_shards().await?;
        shards.sort_by_key(|s| s.id);
        Ok(shards)
    }

    /// Current records of every shard of one type, ascending by id
    pub async fn snapshot_of_type(&self, shard_type: ShardType) -> Result<Vec<ShardInfo>, ShardingError> {
        let ids = self.ledger.get_shards_by_type(shard_type).await?;
        let mut shards = Vec::with_capacity(ids.len());
        for id in ids {
            shards.push(self.ledger.get_shard_info(id).await?);
        }
        shards.sort_by_key(|s| s.id);
        Ok(shards)
    }

    pub async fn load_percentage(&self, shard_id: ShardId) -> Result<f64, ShardingError> {
        let shard = self.shard_info(shard_id).await?;
        Ok(shard.load_percentage())
    }
}
