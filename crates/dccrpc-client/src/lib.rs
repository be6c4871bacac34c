//! dccrpc Client
//!
//! Blocking client side of dccrpc:
//!
//! - [`RpcClient`]: one server URI, retries transient failures with backoff
//! - [`ConnectionPool`]: per-URI pooled TCP connections shared between clients
//! - [`Connector`]: addresses servers by URI or by `(dcc_type, instance_name)`
//!   through the instance registry, and wraps the built-in remote functions
//!   (registration, introspection, tasks, file transfer)

pub mod api;
pub mod client;
pub mod pool;
pub mod retry;

pub use api::{Connector, GetFileResult, SendFileResult, Target};
pub use client::{ClientOptions, RpcClient};
pub use pool::{ConnectionGuard, ConnectionPool, PoolConfig, PooledConnection, UriStats};
pub use retry::RetryPolicy;
