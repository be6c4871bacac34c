use std::net::TcpStream;
use std::time::Duration;

use dccrpc_common::config::Settings;
use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::protocol::{
    BatchResult, CallSpec, Request, Response, ServiceMethod, AUTH_TOKEN_KWARG, VERSION_KWARG,
};
use dccrpc_common::transport::{RpcUri, TcpTransport, WireOptions};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::pool::{ConnectionPool, PoolConfig};
use crate::retry::RetryPolicy;

/// Client behaviour knobs.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub retry_enabled: bool,
    pub retry: RetryPolicy,
    pub use_pooling: bool,
    /// Sent as `_auth_token` with every call.
    pub auth_token: Option<String>,
    pub wire: WireOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_enabled: true,
            retry: RetryPolicy::default(),
            use_pooling: true,
            auth_token: None,
            wire: WireOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.client.timeout_secs),
            retry_enabled: settings.client.retry_enabled,
            retry: RetryPolicy::from_settings(&settings.retry),
            use_pooling: settings.client.use_pooling,
            auth_token: None,
            wire: WireOptions {
                format: settings.serialization.format,
                compress: settings.serialization.compression,
                compression_threshold: settings.serialization.compression_threshold,
            },
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

enum Channel {
    Pooled {
        pool: ConnectionPool,
        /// Pools created by the client itself are shut down by `close`.
        owned: bool,
    },
    Dedicated {
        transport: TcpTransport,
        stream: Mutex<Option<TcpStream>>,
    },
}

/// Blocking RPC client bound to one server URI.
///
/// Every round trip runs under the retry policy when retries are enabled, so
/// connection failures and timeouts are retried with backoff while remote
/// errors (unknown function, permission denied, ...) surface immediately.
///
/// # Example
///
/// ```no_run
/// use dccrpc_client::{ClientOptions, RpcClient};
/// use serde_json::Map;
///
/// let client = RpcClient::new("dccrpc://127.0.0.1:7001", ClientOptions::default(), None).unwrap();
/// let pong = client.call("ping", vec![], Map::new()).unwrap();
/// println!("connected to {}", pong["instance_name"]);
/// ```
pub struct RpcClient {
    uri: RpcUri,
    options: ClientOptions,
    channel: Channel,
}

impl RpcClient {
    /// Creates a client for `uri`.
    ///
    /// With pooling enabled the client uses `pool` when given and otherwise
    /// creates its own. Without pooling `pool` is ignored and the client keeps
    /// one dedicated connection, reopened after failures.
    pub fn new(uri: &str, options: ClientOptions, pool: Option<ConnectionPool>) -> Result<Self> {
        let uri: RpcUri = uri.parse()?;

        let channel = if options.use_pooling {
            match pool {
                Some(pool) => Channel::Pooled { pool, owned: false },
                None => Channel::Pooled {
                    pool: ConnectionPool::new(PoolConfig {
                        timeout: options.timeout,
                        wire: options.wire,
                        ..PoolConfig::default()
                    }),
                    owned: true,
                },
            }
        } else {
            Channel::Dedicated {
                transport: TcpTransport::new(options.wire, options.timeout),
                stream: Mutex::new(None),
            }
        };

        Ok(Self {
            uri,
            options,
            channel,
        })
    }

    pub fn uri(&self) -> &RpcUri {
        &self.uri
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Calls a registered function.
    pub fn call(&self, function: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        let spec = self.authorize(CallSpec::new(function).with_args(args).with_kwargs(kwargs));
        self.invoke(ServiceMethod::Call, serde_json::to_value(&spec)?)
    }

    /// Calls a specific `MAJOR.MINOR.PATCH` version of a versioned function.
    pub fn call_versioned(
        &self,
        function: &str,
        version: &str,
        args: Vec<Value>,
        mut kwargs: Map<String, Value>,
    ) -> Result<Value> {
        kwargs.insert(VERSION_KWARG.to_string(), Value::String(version.to_string()));
        self.call(function, args, kwargs)
    }

    /// Sends all calls in one round trip. Per-call failures come back as
    /// [`BatchResult::Error`] entries in the same order as `calls`.
    pub fn batch_call(&self, calls: Vec<CallSpec>) -> Result<Vec<BatchResult>> {
        let expected = calls.len();
        let calls: Vec<CallSpec> = calls.into_iter().map(|c| self.authorize(c)).collect();

        let value = self.invoke(ServiceMethod::BatchCall, serde_json::to_value(&calls)?)?;
        let results: Vec<BatchResult> = serde_json::from_value(value)?;
        if results.len() != expected {
            return Err(RpcError::InvalidResponse(format!(
                "Batch returned {} results for {} calls",
                results.len(),
                expected
            )));
        }
        Ok(results)
    }

    pub fn list_methods(&self) -> Result<Vec<String>> {
        let value = self.invoke(ServiceMethod::ListMethods, self.service_args())?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn get_globals(&self) -> Result<Map<String, Value>> {
        let value = self.invoke(ServiceMethod::GetGlobals, self.service_args())?;
        Ok(serde_json::from_value(value)?)
    }

    /// Drops the dedicated connection. Shared pools are left alone.
    pub fn close(&self) {
        match &self.channel {
            Channel::Pooled { pool, owned } => {
                if *owned {
                    pool.shutdown();
                }
            }
            Channel::Dedicated { stream, .. } => {
                if let Some(stream) = stream.lock().take() {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
            }
        }
    }

    fn authorize(&self, mut spec: CallSpec) -> CallSpec {
        if let Some(token) = &self.options.auth_token {
            spec.kwargs
                .entry(AUTH_TOKEN_KWARG)
                .or_insert_with(|| Value::String(token.clone()));
        }
        spec
    }

    fn service_args(&self) -> Value {
        match &self.options.auth_token {
            Some(token) => {
                let mut args = Map::new();
                args.insert(AUTH_TOKEN_KWARG.to_string(), Value::String(token.clone()));
                Value::Object(args)
            }
            None => Value::Null,
        }
    }

    fn invoke(&self, method: ServiceMethod, args: Value) -> Result<Value> {
        let request = Request::new(method.as_str(), args).with_timeout(self.options.timeout.as_millis() as u64);

        let response = if self.options.retry_enabled {
            self.options.retry.run(|_| self.round_trip(&request))
        } else {
            self.round_trip(&request)
        }?;

        response.into_result()
    }

    fn round_trip(&self, request: &Request) -> Result<Response> {
        match &self.channel {
            Channel::Pooled { pool, .. } => {
                let mut conn = pool.scoped(&self.uri)?;
                let result = conn.send_request(request);
                if let Err(e) = &result {
                    tracing::debug!(uri = %self.uri, error = %e, "Dropping pooled connection after failure");
                    conn.mark_broken();
                }
                result
            }
            Channel::Dedicated { transport, stream } => {
                let mut slot = stream.lock();
                let mut conn = match slot.take() {
                    Some(conn) => conn,
                    None => transport.connect(&self.uri)?,
                };
                let result = transport.send_request(&mut conn, request);
                // A failed exchange leaves the stream in an unknown state
                if result.is_ok() {
                    *slot = Some(conn);
                }
                result
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}
