use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::protocol::error::RpcError;

pub const URI_SCHEME: &str = "dccrpc://";

/// Address of a running server.
///
/// Parses `dccrpc://host:port` as well as a bare `host:port`, and always
/// prints the scheme form. IPv6 hosts use brackets: `dccrpc://[::1]:9090`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RpcUri {
    pub host: String,
    pub port: u16,
}

impl RpcUri {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for `ToSocketAddrs`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for RpcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", URI_SCHEME, self.socket_addr())
    }
}

impl FromStr for RpcUri {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.trim();
        let rest = rest.strip_prefix(URI_SCHEME).unwrap_or(rest);
        let rest = rest.trim_end_matches('/');

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| RpcError::InvalidRequest(format!("Invalid URI '{}': missing port", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RpcError::InvalidRequest(format!("Invalid URI '{}': missing host", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| RpcError::InvalidRequest(format!("Invalid URI '{}': {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

impl Serialize for RpcUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RpcUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
