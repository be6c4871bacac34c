use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::compression::{self, DEFAULT_COMPRESSION_THRESHOLD};
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Request, Response};
use crate::serialization::SerializationFormat;
use crate::transport::MAX_MESSAGE_SIZE;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FORMAT_SHIFT: u8 = 1;
const FORMAT_MASK: u8 = 0b0000_0110;

/// How bodies are written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireOptions {
    pub format: SerializationFormat,
    pub compress: bool,
    /// Bodies larger than this many bytes are compressed when `compress` is set.
    pub compression_threshold: usize,
}

impl Default for WireOptions {
    fn default() -> Self {
        Self {
            format: SerializationFormat::Json,
            compress: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Codec for encoding/decoding framed RPC messages.
///
/// An encoded frame is the flags byte followed by the body; the length prefix
/// is added by the transport. Decoding reads the flags, so a codec can decode
/// frames written with any options and reports the format it found.
///
/// # Example
///
/// ```
/// use dccrpc_common::transport::{Codec, WireOptions};
/// use dccrpc_common::serialization::SerializationFormat;
/// use dccrpc_common::protocol::Request;
/// use serde_json::json;
///
/// let codec = Codec::new(WireOptions {
///     format: SerializationFormat::Msgpack,
///     ..WireOptions::default()
/// });
/// let request = Request::new("list_methods", json!(null));
/// let frame = codec.encode_request(&request).unwrap();
/// let (decoded, format) = codec.decode_request(&frame).unwrap();
/// assert_eq!(decoded, request);
/// assert_eq!(format, SerializationFormat::Msgpack);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    options: WireOptions,
}

impl Codec {
    pub fn new(options: WireOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &WireOptions {
        &self.options
    }

    pub fn encode_request(&self, request: &Request) -> Result<Vec<u8>> {
        self.encode_as(self.options.format, request)
    }

    pub fn decode_request(&self, frame: &[u8]) -> Result<(Request, SerializationFormat)> {
        Self::decode(frame)
    }

    /// Encodes a response in the given format, usually the format of the request.
    pub fn encode_response(&self, response: &Response, format: SerializationFormat) -> Result<Vec<u8>> {
        self.encode_as(format, response)
    }

    pub fn decode_response(&self, frame: &[u8]) -> Result<Response> {
        Self::decode(frame).map(|(response, _)| response)
    }

    fn encode_as<T: Serialize>(&self, format: SerializationFormat, value: &T) -> Result<Vec<u8>> {
        let body = format.encode(value)?;
        let mut flags = format.tag() << FORMAT_SHIFT;

        let body = if self.options.compress
            && compression::should_compress(body.len(), self.options.compression_threshold)
        {
            flags |= FLAG_COMPRESSED;
            compression::compress(&body)?
        } else {
            body
        };

        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(flags);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<(T, SerializationFormat)> {
        let (&flags, body) = frame
            .split_first()
            .ok_or_else(|| RpcError::InvalidRequest("Empty frame".to_string()))?;

        let format = SerializationFormat::from_tag((flags & FORMAT_MASK) >> FORMAT_SHIFT)?;
        let value = if flags & FLAG_COMPRESSED != 0 {
            format.decode(&compression::decompress(body, MAX_MESSAGE_SIZE)?)?
        } else {
            format.decode(body)?
        };
        Ok((value, format))
    }
}
