//! dccrpc Transport Layer
//!
//! This module provides the TCP transport and codec for sending/receiving RPC messages.
//!
//! # Architecture
//!
//! - **Transport**: TCP with keep-alive connections
//! - **Codec**: JSON or MessagePack bodies, optionally zlib-compressed
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [1-byte flags] + [body]`
//!
//! The flags byte uses bit 0 for compression and bits 1-2 for the body format.
//! The length prefix covers the flags byte and the body.
//!
//! # Components
//!
//! - **[`Codec`]**: Encode/decode protocol messages according to [`WireOptions`]
//! - **[`TcpTransport`]**: Synchronous TCP transport (used by clients and probes)
//! - **[`TcpServer`]**: Async TCP server (used by the RPC server thread)
//! - **[`RpcUri`]**: `dccrpc://host:port` addresses
//!
//! # Message Size Limits
//!
//! All transport implementations enforce a maximum frame size of 100 MB.
//!
//! # Example
//!
//! ```no_run
//! use dccrpc_common::transport::{RpcUri, TcpTransport};
//! use dccrpc_common::protocol::Request;
//! use serde_json::json;
//!
//! let uri: RpcUri = "dccrpc://127.0.0.1:9090".parse().unwrap();
//! let transport = TcpTransport::default();
//! let mut stream = transport.connect(&uri).unwrap();
//!
//! let request = Request::new("list_methods", json!(null));
//! let response = transport.send_request(&mut stream, &request).unwrap();
//! ```

pub mod codec;
pub mod tcp;
pub mod tcp_server;
pub mod uri;

pub use codec::{Codec, WireOptions};
pub use tcp::TcpTransport;
pub use tcp_server::TcpServer;
pub use uri::RpcUri;

/// Largest frame either side accepts.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;
