//! Body serialization formats.
//!
//! Every frame carries its format in the flags byte, so a server can answer
//! each client in the format that client chose.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Json,
    Msgpack,
}

impl SerializationFormat {
    /// Encodes a value in this format.
    ///
    /// MessagePack uses named fields so that optional and defaulted struct
    /// fields decode the same way they do from JSON.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Json => Ok(serde_json::to_vec(value)?),
            SerializationFormat::Msgpack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Json => Ok(serde_json::from_slice(data)?),
            SerializationFormat::Msgpack => Ok(rmp_serde::from_slice(data)?),
        }
    }

    /// Two-bit tag stored in the frame flags.
    pub fn tag(&self) -> u8 {
        match self {
            SerializationFormat::Json => 0,
            SerializationFormat::Msgpack => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(SerializationFormat::Json),
            1 => Ok(SerializationFormat::Msgpack),
            other => Err(RpcError::InvalidRequest(format!(
                "Unknown serialization format tag {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SerializationFormat::Json => "json",
            SerializationFormat::Msgpack => "msgpack",
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerializationFormat {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SerializationFormat::Json),
            "msgpack" | "messagepack" => Ok(SerializationFormat::Msgpack),
            other => Err(RpcError::Config(format!(
                "Unsupported serialization format '{}'",
                other
            ))),
        }
    }
}
