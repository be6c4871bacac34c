//! dccrpc Server
//!
//! This crate hosts functions inside a DCC application and serves them over
//! the dccrpc transport.
//!
//! - [`FunctionRegistry`] / [`VersionRegistry`]: what `call` can reach
//! - [`EventBus`]: publish/subscribe with a bounded history
//! - [`TaskManager`]: long-running calls with status, progress and results
//! - [`ScriptFunction`]: functions shipped as JavaScript source and run in Boa
//! - [`RpcService`]: `call`, `batch_call`, `list_methods`, `get_globals`
//! - [`RpcServer`]: binds the transport on its own thread and keeps the
//!   instance registry up to date
//!
//! # Example
//!
//! ```no_run
//! use dccrpc_common::security::SecurityFlags;
//! use dccrpc_server::{RpcServer, ServerContext, ServerOptions};
//! use serde_json::json;
//!
//! let context = ServerContext::new(SecurityFlags::default()).into_shared();
//! context.functions.register("frame_range", |_| Ok(json!([1001, 1100])));
//!
//! let server = RpcServer::start(ServerOptions::new("maya"), context).unwrap();
//! println!("serving {} at {}", server.instance_name(), server.uri());
//! server.wait();
//! ```

pub mod builtins;
pub mod context;
pub mod events;
pub mod invocation;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod service;
pub mod task_manager;
pub mod versioning;

pub use context::{ServerContext, ServerIdentity};
pub use events::{Event, EventBus, Subscription};
pub use invocation::{FunctionSpec, Handler, Invocation, ProgressReporter};
pub use registry::{FunctionRegistry, RegisteredFunction};
pub use runtime::{ResourceLimits, ScriptEnv, ScriptFunction};
pub use server::{RpcServer, ServerHandle, ServerOptions};
pub use service::RpcService;
pub use task_manager::{TaskInfo, TaskManager, TaskManagerConfig, TaskStatus};
pub use versioning::{Version, VersionRegistry};
