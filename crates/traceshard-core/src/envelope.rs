//! Uniform `{success, data, message}` response envelope.

use crate::error::{ErrorKind, ShardingError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,

    #[serde(default)]
    pub data: Option<T>,

    pub message: String,

    /// HTTP-style status, present on failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            message: message.into(),
            status: None,
            error: None,
        }
    }

    pub fn failure(err: &ShardingError) -> Self {
        ApiResponse {
            success: false,
            data: None,
            message: err.to_string(),
            status: Some(err.status_code()),
            error: Some(err.kind()),
        }
    }

    pub fn from_result(result: Result<T, ShardingError>, message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Self::ok(data, message),
            Err(err) => Self::failure(&err),
        }
    }
}
