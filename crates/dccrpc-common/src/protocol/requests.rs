//! Raw requests as they travel over the wire.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RpcError;

pub type RequestId = u64;

/// One service-method invocation.
///
/// `method` is always a [`ServiceMethod`] name; `args` is its JSON payload
/// (a [`CallSpec`](super::CallSpec) for `call`, a list of them for `batch_call`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub args: Value,
    /// Client-side deadline, informational for the server.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            id: next_request_id(),
            method: method.into(),
            args,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(self, timeout_ms: u64) -> Self {
        Self {
            timeout_ms: Some(timeout_ms),
            ..self
        }
    }
}

/// Ids are a random per-process prefix plus a sequence number, so two client
/// processes talking to one server do not collide in its logs.
fn next_request_id() -> RequestId {
    static PREFIX: OnceLock<u64> = OnceLock::new();
    static SEQUENCE: AtomicU64 = AtomicU64::new(1);

    let prefix = *PREFIX.get_or_init(|| (uuid::Uuid::new_v4().as_u128() as u64) << 32);
    prefix | (SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF)
}

/// Methods exposed by the service object behind every server URI.
///
/// These are the only names a raw [`Request`] may carry. Registered functions
/// are reached through [`ServiceMethod::Call`] and [`ServiceMethod::BatchCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceMethod {
    /// `call(function_name, *args, **kwargs)`
    Call,
    /// `batch_call([{function, args, kwargs}, ...])`
    BatchCall,
    /// `list_methods()`
    ListMethods,
    /// `get_globals()`
    GetGlobals,
}

impl ServiceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceMethod::Call => "call",
            ServiceMethod::BatchCall => "batch_call",
            ServiceMethod::ListMethods => "list_methods",
            ServiceMethod::GetGlobals => "get_globals",
        }
    }
}

impl fmt::Display for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceMethod {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(ServiceMethod::Call),
            "batch_call" => Ok(ServiceMethod::BatchCall),
            "list_methods" => Ok(ServiceMethod::ListMethods),
            "get_globals" => Ok(ServiceMethod::GetGlobals),
            other => Err(RpcError::InvalidRequest(format!(
                "Unknown service method '{}'",
                other
            ))),
        }
    }
}
