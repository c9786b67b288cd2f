//! Caller-side deadline for ledger sends.

use crate::error::ShardingError;
use std::future::Future;
use std::time::Duration;

/// Await `fut`, giving up after `timeout`
///
/// Expiry does not mean the send failed: the transaction may still be mined,
/// so it surfaces as `OutcomeUnknown` rather than a ledger error.
pub async fn with_deadline<T, E, F>(operation: &str, timeout: Option<Duration>, fut: F) -> Result<T, ShardingError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ShardingError>,
{
    let Some(limit) = timeout else {
        return fut.await.map_err(Into::into);
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ShardingError::OutcomeUnknown {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
