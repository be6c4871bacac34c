use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Function '{0}' is not registered")]
    FunctionNotFound(String),

    #[error("Invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("File integrity check failed: {0}")]
    Integrity(String),

    #[error("File transfer error: {0}")]
    FileTransfer(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Task '{0}' has not completed yet")]
    TaskNotCompleted(String),

    #[error("Task '{0}' was canceled")]
    TaskCanceled(String),

    /// A task failure replayed from the task table. Carries the kind of the
    /// original error so callers see the same type they would have seen inline.
    #[error("{message}")]
    TaskFailed { kind: String, message: String },

    #[error("Script error: {0}")]
    Script(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("No registered instance found for {0}")]
    InstanceNotFound(String),

    /// An error raised by the remote side, rebuilt from a failed response.
    #[error("{message}")]
    Remote { kind: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether this error is a transport failure worth retrying.
    ///
    /// Only communication failures and timeouts qualify. Everything raised by
    /// application code is surfaced to the caller as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Connection(_) | RpcError::Timeout(_))
    }

    /// Stable name of the error category, sent over the wire as `error_type`.
    pub fn kind(&self) -> &str {
        match self {
            RpcError::Transport(_) => "Transport",
            RpcError::JsonSerialization(_)
            | RpcError::MsgPackEncode(_)
            | RpcError::MsgPackDecode(_) => "Serialization",
            RpcError::Timeout(_) => "Timeout",
            RpcError::Connection(_) => "Connection",
            RpcError::InvalidRequest(_) => "InvalidRequest",
            RpcError::InvalidResponse(_) => "InvalidResponse",
            RpcError::FunctionNotFound(_) => "FunctionNotFound",
            RpcError::InvalidVersion(_) => "InvalidVersion",
            RpcError::PermissionDenied(_) => "PermissionDenied",
            RpcError::Validation(_) => "Validation",
            RpcError::Integrity(_) => "Integrity",
            RpcError::FileTransfer(_) => "FileTransfer",
            RpcError::TaskNotFound(_) => "TaskNotFound",
            RpcError::TaskNotCompleted(_) => "TaskNotCompleted",
            RpcError::TaskCanceled(_) => "TaskCanceled",
            RpcError::TaskFailed { kind, .. } => kind,
            RpcError::Script(_) => "Script",
            RpcError::Config(_) => "Config",
            RpcError::Registry(_) => "Registry",
            RpcError::InstanceNotFound(_) => "InstanceNotFound",
            RpcError::Remote { kind, .. } => kind,
            RpcError::Io(_) => "Io",
        }
    }

    /// Rebuilds an error received in a failed response.
    pub fn remote(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Remote {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
