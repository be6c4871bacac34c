//! dccrpc Common Types and Transport
//!
//! This crate provides the protocol definitions, wire transport and shared
//! infrastructure for the dccrpc remote procedure call system, which lets
//! tools drive functions registered inside running DCC host applications.
//!
//! # Overview
//!
//! - **Protocol Layer**: Request/Response types, call specs, batch results and errors
//! - **Transport Layer**: framed TCP transport with pluggable serialization and compression
//! - **Security**: capability flags, HMAC auth tokens and per-function access lists
//! - **Configuration**: versioned, persisted settings deep-merged with defaults
//! - **File transfer**: self-describing transfer packages with integrity verification
//!
//! # Wire protocol
//!
//! - **Transport**: TCP with keep-alive connections
//! - **Serialization**: JSON or MessagePack, chosen per frame
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [1-byte flags] + [payload]`
//! - **Max Message Size**: 100 MB
//!
//! # Example
//!
//! ```no_run
//! use dccrpc_common::{CallSpec, Request, Response, ServiceMethod};
//! use serde_json::json;
//!
//! let spec = CallSpec::new("ping");
//! let request = Request::new(ServiceMethod::Call.as_str(), serde_json::to_value(&spec).unwrap())
//!     .with_timeout(5000);
//!
//! let response = Response::ok(request.id, json!({"dcc_type": "maya"}));
//! ```

pub mod compression;
pub mod config;
pub mod protocol;
pub mod security;
pub mod serialization;
pub mod transfer;
pub mod transport;

pub use protocol::*;
