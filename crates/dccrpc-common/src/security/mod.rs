//! Security for dccrpc servers.
//!
//! Three independent mechanisms guard a server:
//!
//! - **Capability flags** ([`SecurityFlags`]): per-process switches read from
//!   `TP_DCC_RPC_*` environment variables that enable remote control, env-var
//!   control, mandatory tokens and wire options.
//! - **Auth tokens** ([`TokenAuthority`]): HMAC-SHA256 signed tokens required by
//!   functions registered with `requires_auth`, or by every call when the
//!   encryption flag is on.
//! - **Access lists** ([`AccessControlList`]): per-function caller IP patterns.

pub mod acl;
pub mod auth;

pub use acl::AccessControlList;
pub use auth::{TokenAuthority, TokenClaims};

use crate::compression::DEFAULT_COMPRESSION_THRESHOLD;
use crate::protocol::error::{Result, RpcError};
use crate::serialization::SerializationFormat;
use crate::transport::WireOptions;

pub const ENV_REMOTE_CONTROL: &str = "TP_DCC_RPC_REMOTE_CONTROL";
pub const ENV_ENV_CONTROL: &str = "TP_DCC_RPC_ENV_CONTROL";
pub const ENV_ENCRYPTION: &str = "TP_DCC_RPC_ENCRYPTION";
pub const ENV_COMPRESSION: &str = "TP_DCC_RPC_COMPRESSION";
pub const ENV_COMPRESSION_THRESHOLD: &str = "TP_DCC_RPC_COMPRESSION_THRESHOLD";
pub const ENV_SERIALIZATION: &str = "TP_DCC_RPC_SERIALIZATION";
pub const ENV_SECRET: &str = "TP_DCC_RPC_SECRET";

/// Capability switches of one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityFlags {
    /// Remote registration, shutdown, kill and introspection.
    pub remote_control: bool,
    /// `get_env`/`set_env`/`list_env`.
    pub env_control: bool,
    /// Every call must carry a valid auth token.
    pub encryption: bool,
    pub compression: bool,
    pub compression_threshold: usize,
    pub serialization: SerializationFormat,
}

impl Default for SecurityFlags {
    fn default() -> Self {
        Self {
            remote_control: true,
            env_control: false,
            encryption: false,
            compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            serialization: SerializationFormat::Json,
        }
    }
}

impl SecurityFlags {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the flags from an arbitrary variable lookup.
    ///
    /// Unparseable values fall back to the default and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| match lookup(key) {
            None => default,
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                tracing::warn!(variable = key, value = %raw, "Invalid boolean flag, using default");
                default
            }),
        };

        let compression_threshold = match lookup(ENV_COMPRESSION_THRESHOLD) {
            None => defaults.compression_threshold,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(variable = ENV_COMPRESSION_THRESHOLD, value = %raw, "Invalid threshold, using default");
                defaults.compression_threshold
            }),
        };

        let serialization = match lookup(ENV_SERIALIZATION) {
            None => defaults.serialization,
            Some(raw) => raw.parse().unwrap_or_else(|e: RpcError| {
                tracing::warn!(variable = ENV_SERIALIZATION, error = %e, "Using default serialization");
                defaults.serialization
            }),
        };

        Self {
            remote_control: flag(ENV_REMOTE_CONTROL, defaults.remote_control),
            env_control: flag(ENV_ENV_CONTROL, defaults.env_control),
            encryption: flag(ENV_ENCRYPTION, defaults.encryption),
            compression: flag(ENV_COMPRESSION, defaults.compression),
            compression_threshold,
            serialization,
        }
    }

    pub fn require_remote_control(&self, action: &str) -> Result<()> {
        if self.remote_control {
            Ok(())
        } else {
            Err(RpcError::PermissionDenied(format!(
                "Remote control is disabled on this server ({} refused)",
                action
            )))
        }
    }

    pub fn require_env_control(&self, action: &str) -> Result<()> {
        if self.env_control {
            Ok(())
        } else {
            Err(RpcError::PermissionDenied(format!(
                "Environment control is disabled on this server ({} refused)",
                action
            )))
        }
    }

    pub fn wire_options(&self) -> WireOptions {
        WireOptions {
            format: self.serialization,
            compress: self.compression,
            compression_threshold: self.compression_threshold,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
