//! High-level helpers addressing servers by URI or by registered instance.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::transfer::{self, TransferPackage, DEFAULT_CHUNK_SIZE};
use dccrpc_instances::InstanceRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::client::{ClientOptions, RpcClient};
use crate::pool::{ConnectionPool, PoolConfig};

/// Where a call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Uri(String),
    /// Resolved through the instance registry. `None` picks the most
    /// recently seen instance of that type.
    Instance {
        dcc_type: String,
        instance_name: Option<String>,
    },
}

impl Target {
    pub fn uri(uri: impl Into<String>) -> Self {
        Target::Uri(uri.into())
    }

    pub fn instance(dcc_type: impl Into<String>, instance_name: Option<&str>) -> Self {
        Target::Instance {
            dcc_type: dcc_type.into(),
            instance_name: instance_name.map(str::to_string),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Uri(uri) => f.write_str(uri),
            Target::Instance {
                dcc_type,
                instance_name,
            } => write!(
                f,
                "{}/{}",
                dcc_type,
                instance_name.as_deref().unwrap_or("[default]")
            ),
        }
    }
}

/// Task states that will not change any more.
const TERMINAL_TASK_STATES: [&str; 3] = ["done", "failed", "canceled"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFileResult {
    pub success: bool,
    pub remote_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFileResult {
    pub success: bool,
    pub local_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
}

/// Entry point for tools talking to running DCC servers.
///
/// Clients created by the connector share one connection pool when pooling
/// is enabled.
pub struct Connector {
    registry: Arc<InstanceRegistry>,
    pool: Option<ConnectionPool>,
    options: ClientOptions,
    chunk_size: usize,
}

impl Connector {
    pub fn new(registry: Arc<InstanceRegistry>, options: ClientOptions) -> Self {
        let pool = options.use_pooling.then(|| {
            ConnectionPool::new(PoolConfig {
                timeout: options.timeout,
                wire: options.wire,
                ..PoolConfig::default()
            })
        });
        Self {
            registry,
            pool,
            options,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_pool(registry: Arc<InstanceRegistry>, pool: ConnectionPool, options: ClientOptions) -> Self {
        Self {
            registry,
            pool: Some(pool),
            options,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Encoded packages larger than this are sent in chunks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Resolves a target to a server URI.
    pub fn resolve(&self, target: &Target) -> Result<String> {
        match target {
            Target::Uri(uri) => Ok(uri.clone()),
            Target::Instance {
                dcc_type,
                instance_name,
            } => {
                if dcc_type.is_empty() {
                    return Err(RpcError::Validation(
                        "You must provide either a URI or a DCC type".to_string(),
                    ));
                }
                self.registry
                    .get_uri(dcc_type, instance_name.as_deref())?
                    .ok_or_else(|| {
                        RpcError::InstanceNotFound(format!(
                            "{} / {}",
                            dcc_type,
                            instance_name.as_deref().unwrap_or("[default]")
                        ))
                    })
            }
        }
    }

    pub fn client(&self, target: &Target) -> Result<RpcClient> {
        let uri = self.resolve(target)?;
        RpcClient::new(&uri, self.options.clone(), self.pool.clone())
    }

    pub fn call_remote_function(
        &self,
        target: &Target,
        function: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        if function.is_empty() {
            return Err(RpcError::Validation("Function name is required".to_string()));
        }
        let client = self.client(target)?;
        let result = client.call(function, args, kwargs);
        client.close();
        result
    }

    /// Ships script source to the server and registers `name` there.
    ///
    /// A registration the server reports as failed becomes a
    /// [`RpcError::Script`] error.
    pub fn register_function_remotely(
        &self,
        target: &Target,
        name: &str,
        source_code: &str,
        client_paths: &[String],
        client_globals: Map<String, Value>,
    ) -> Result<Value> {
        tracing::debug!(function = name, target = %target, paths = client_paths.len(), "Registering function remotely");

        let kwargs = object(json!({
            "name": name,
            "source_code": source_code,
            "client_paths": client_paths,
            "client_globals": client_globals,
        }));
        let response = self.call_remote_function(target, "register_remote_function", vec![], kwargs)?;

        if response.get("status").and_then(Value::as_str) == Some("error") {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Remote registration failed");
            return Err(RpcError::Script(message.to_string()));
        }
        Ok(response)
    }

    /// Registers a function remotely and immediately calls it.
    pub fn remote_call(
        &self,
        target: &Target,
        name: &str,
        source_code: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        self.register_function_remotely(target, name, source_code, &[], Map::new())?;
        self.call_remote_function(target, name, args, kwargs)
    }

    pub fn ping_instance(&self, target: &Target) -> Result<Value> {
        self.call_remote_function(target, "ping", vec![], Map::new())
    }

    pub fn describe_remote_function(&self, target: &Target, name: &str) -> Result<Value> {
        self.call_remote_function(
            target,
            "describe_remote_function",
            vec![],
            object(json!({ "name": name })),
        )
    }

    /// Names of the remote functions, or `{name, signature, doc}` records when `verbose`.
    pub fn list_remote_functions(&self, target: &Target, verbose: bool) -> Result<Value> {
        self.call_remote_function(
            target,
            "list_registered_functions",
            vec![],
            object(json!({ "verbose": verbose })),
        )
    }

    /// Starts `function` as a background task on the server and returns its id.
    pub fn submit_task(
        &self,
        target: &Target,
        function: &str,
        mut args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<String> {
        args.insert(0, Value::String(function.to_string()));
        let id = self.call_remote_function(target, "submit_task", args, kwargs)?;
        id.as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::InvalidResponse(format!("Expected a task id, got {}", id)))
    }

    pub fn task_status(&self, target: &Target, task_id: &str) -> Result<String> {
        let status = self.call_remote_function(target, "get_task_status", vec![json!(task_id)], Map::new())?;
        status
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::InvalidResponse(format!("Expected a task status, got {}", status)))
    }

    /// Polls a task until it settles and returns its result.
    ///
    /// Failed and canceled tasks surface as the error the server reports for
    /// `get_task_result`.
    pub fn wait_task(&self, target: &Target, task_id: &str, poll: Duration, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.task_status(target, task_id)?;
            if TERMINAL_TASK_STATES.contains(&status.as_str()) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(RpcError::Timeout(timeout.as_millis() as u64));
            }
            thread::sleep(poll);
        }
        self.call_remote_function(target, "get_task_result", vec![json!(task_id)], Map::new())
    }

    /// Sends a local file to the server, which saves it in `remote_dir`
    /// (or its temp directory).
    pub fn send_file(
        &self,
        target: &Target,
        path: impl AsRef<Path>,
        remote_dir: Option<&str>,
        compress: bool,
    ) -> Result<SendFileResult> {
        let path = path.as_ref();
        let progress = |fraction: f64, message: &str| {
            tracing::debug!(progress = fraction, "{}", message);
        };
        let package = transfer::encode_file(path, compress, Some(&progress))
            .map_err(|e| RpcError::FileTransfer(format!("Failed to send file: {}", e)))?;

        let remote_path = if package.data.len() > self.chunk_size {
            self.send_chunked(target, &package, remote_dir)?
        } else {
            let kwargs = object(json!({
                "transfer_package": &package,
                "output_dir": remote_dir,
            }));
            self.call_remote_function(target, "receive_file", vec![], kwargs)?
        };

        let remote_path = remote_path
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::FileTransfer(format!("Unexpected receive_file result: {}", remote_path)))?;

        tracing::info!(file = %package.file_name, remote_path = %remote_path, "File sent");
        Ok(SendFileResult {
            success: true,
            remote_path,
            file_name: package.file_name,
            file_size: package.file_size,
            file_hash: package.file_hash,
        })
    }

    fn send_chunked(&self, target: &Target, package: &TransferPackage, remote_dir: Option<&str>) -> Result<Value> {
        let chunks = transfer::split_into_chunks(package, self.chunk_size);
        let client = self.client(target)?;

        let mut last = Value::Null;
        for chunk in chunks {
            tracing::debug!(index = chunk.index, total = chunk.total, "Sending chunk");
            let kwargs = object(json!({
                "chunk": chunk,
                "output_dir": remote_dir,
            }));
            last = client.call("receive_file_chunk", vec![], kwargs)?;
        }
        client.close();

        match last.get("path") {
            Some(path) if !path.is_null() => Ok(path.clone()),
            _ => Err(RpcError::FileTransfer(
                "Server did not complete the chunked transfer".to_string(),
            )),
        }
    }

    /// Fetches a file from the server.
    ///
    /// Saved to `output_file` when given, else into `output_dir`, else into
    /// the local temp directory.
    pub fn get_file(
        &self,
        target: &Target,
        remote_path: &str,
        output_dir: Option<&Path>,
        output_file: Option<&Path>,
    ) -> Result<GetFileResult> {
        let value = self.call_remote_function(
            target,
            "prepare_file_for_transfer",
            vec![],
            object(json!({ "file_path": remote_path })),
        )?;
        let package = TransferPackage::from_value(value)?;

        let local_path = transfer::decode_file(&package, output_dir, output_file, None)
            .map_err(|e| match e {
                RpcError::Integrity(_) => e,
                other => RpcError::FileTransfer(format!("Failed to get file: {}", other)),
            })?;

        Ok(GetFileResult {
            success: true,
            local_path,
            file_name: package.file_name,
            file_size: package.file_size,
            file_hash: package.file_hash,
        })
    }

    /// Shuts down the connector's pool.
    pub fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
