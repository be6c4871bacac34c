//! Replies to [`Request`](super::Request)s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RpcError;
use super::RequestId;

/// The answer to one request, matched to it by `id`.
///
/// On failure `error` holds the rendered message and `error_type` the
/// [`RpcError::kind`] it came from, so the client can rebuild a typed error.
/// Peers that omit `error_type` surface as kind `Remote`.
///
/// ```
/// use dccrpc_common::protocol::Response;
/// use serde_json::json;
///
/// assert!(Response::ok(3, json!("pong")).success);
/// assert!(!Response::failed(3, "no such method").success);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
            error_type: None,
        }
    }

    pub fn failed(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(message.into()),
            error_type: None,
        }
    }

    pub fn from_error(id: RequestId, err: &RpcError) -> Self {
        Self {
            error_type: Some(err.kind().to_string()),
            ..Self::failed(id, err.to_string())
        }
    }

    /// A success without a result is `null`. Failed responses become [`RpcError::Remote`] with the server's category.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            // serde reads a `null` result back as `None`
            Response {
                success: true,
                result,
                ..
            } => Ok(result.unwrap_or(Value::Null)),
            Response {
                error, error_type, ..
            } => Err(RpcError::remote(
                error_type.unwrap_or_else(|| "Remote".to_string()),
                error.unwrap_or_else(|| "Unknown error".to_string()),
            )),
        }
    }
}
