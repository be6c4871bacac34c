//! Call specs and batch results carried inside service requests.
//!
//! A `call` request carries one [`CallSpec`]; a `batch_call` request carries a
//! list of them and is answered with one [`BatchResult`] per spec, in order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::RpcError;

/// Reserved keyword argument selecting a function version (`MAJOR.MINOR.PATCH`).
pub const VERSION_KWARG: &str = "_version";

/// Reserved keyword argument carrying an auth token for guarded functions.
pub const AUTH_TOKEN_KWARG: &str = "_auth_token";

/// One function invocation: `{"function": str, "args": [...], "kwargs": {...}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CallSpec {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Removes a reserved keyword argument and returns it as a string.
    pub fn take_reserved(&mut self, name: &str) -> Option<String> {
        match self.kwargs.remove(name) {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Outcome of a single entry in a batch call.
///
/// Serialized as `{"status": "success", "result": ...}` or
/// `{"status": "error", "error": "...", "type": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchResult {
    Success {
        result: Value,
    },
    Error {
        error: String,
        #[serde(rename = "type")]
        kind: String,
    },
}

impl BatchResult {
    pub fn from_outcome(outcome: Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => BatchResult::Success { result },
            Err(e) => BatchResult::Error {
                error: e.to_string(),
                kind: e.kind().to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchResult::Success { .. })
    }

    /// Converts back into a call outcome, rebuilding errors as remote errors.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            BatchResult::Success { result } => Ok(result),
            BatchResult::Error { error, kind } => Err(RpcError::remote(kind, error)),
        }
    }
}
