//! The server composition root.
//!
//! [`RpcServer::start`] binds the transport on a dedicated thread that owns a
//! tokio runtime, so the hosting application keeps its own main loop. Every
//! request runs on the runtime's blocking pool through [`RpcService`].

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dccrpc_common::config::Settings;
use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::transport::{RpcUri, TcpServer, WireOptions};
use dccrpc_common::Response;
use dccrpc_instances::{local_hostname, HeartbeatTask, InstanceRegistry};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::context::{ServerContext, ServerIdentity};
use crate::service::RpcService;

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How and where a server is started.
#[derive(Clone)]
pub struct ServerOptions {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    pub dcc_type: String,
    /// Generated by the instance registry when unset.
    pub instance_name: Option<String>,
    pub heartbeat_interval: Duration,
    /// Registry the server records itself in while running.
    pub registry: Option<Arc<InstanceRegistry>>,
    /// Announce over the context's service discovery.
    pub announce: bool,
    pub wire: WireOptions,
}

impl ServerOptions {
    pub fn new(dcc_type: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            dcc_type: dcc_type.into(),
            instance_name: None,
            heartbeat_interval: Duration::from_secs(30),
            registry: None,
            announce: false,
            wire: WireOptions::default(),
        }
    }

    pub fn from_settings(dcc_type: impl Into<String>, settings: &Settings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            heartbeat_interval: Duration::from_secs(settings.server.heartbeat_interval_secs.max(1)),
            announce: settings.discovery.enabled,
            wire: WireOptions {
                format: settings.serialization.format,
                compress: settings.serialization.compression,
                compression_threshold: settings.serialization.compression_threshold,
            },
            ..Self::new(dcc_type)
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn with_registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }

    pub fn with_wire(mut self, wire: WireOptions) -> Self {
        self.wire = wire;
        self
    }

    /// Host written into the advertised URI. Wildcard binds advertise the
    /// machine's hostname.
    fn advertised_host(&self) -> String {
        match self.host.as_str() {
            "0.0.0.0" | "::" | "[::]" | "" => local_hostname(),
            host => host.to_string(),
        }
    }
}

pub struct RpcServer;

impl RpcServer {
    /// Starts a server and returns once it is accepting connections.
    ///
    /// Bind and registry failures are returned here; anything after that is
    /// logged by the server thread.
    pub fn start(options: ServerOptions, context: Arc<ServerContext>) -> Result<ServerHandle> {
        if options.dcc_type.is_empty() {
            return Err(RpcError::Validation("dcc_type must not be empty".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("dccrpc-server-{}", options.dcc_type))
            .spawn({
                let shutdown_tx = shutdown_tx.clone();
                move || serve(options, context, shutdown_tx, shutdown_rx, ready_tx)
            })?;

        match ready_rx.recv() {
            Ok(Ok((local_addr, identity))) => Ok(ServerHandle {
                inner: Arc::new(HandleInner {
                    identity,
                    local_addr,
                    shutdown: shutdown_tx,
                    thread: Mutex::new(Some(thread)),
                }),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(RpcError::Transport("Server thread exited before binding".to_string()))
            }
        }
    }
}

type Ready = mpsc::Sender<Result<(SocketAddr, ServerIdentity)>>;

fn serve(
    options: ServerOptions,
    context: Arc<ServerContext>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    ready: Ready,
) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dccrpc-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    runtime.block_on(run(options, context, shutdown_tx, shutdown_rx, ready));

    // Handlers still running on the blocking pool are abandoned after this
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
}

async fn run(
    options: ServerOptions,
    context: Arc<ServerContext>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    ready: Ready,
) {
    let bind_addr = format!("{}:{}", options.host, options.port);
    let bound = match TcpServer::bind(&bind_addr, options.wire).await {
        Ok(server) => server.local_addr().map(|addr| (server, addr)),
        Err(e) => Err(e),
    };
    let (server, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let uri = RpcUri::new(options.advertised_host(), local_addr.port()).to_string();
    let instance_name = match &options.registry {
        Some(registry) => match registry.register(&options.dcc_type, &uri, options.instance_name.as_deref()) {
            Ok(name) => name,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        },
        None => options
            .instance_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", options.dcc_type, local_addr.port())),
    };

    let identity = ServerIdentity {
        dcc_type: options.dcc_type.clone(),
        instance_name: instance_name.clone(),
        uri: uri.clone(),
    };
    context.set_identity(Some(identity.clone()));
    context.attach_shutdown(Some(shutdown_tx));

    let heartbeat = options.registry.as_ref().map(|registry| {
        HeartbeatTask::start(
            registry.clone(),
            options.dcc_type.clone(),
            instance_name.clone(),
            options.heartbeat_interval,
        )
    });

    let announcer = match (options.announce, context.discovery()) {
        (true, Some(discovery)) => match discovery.start_announcer(&uri, &options.dcc_type, &instance_name) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start discovery announcer");
                None
            }
        },
        (true, None) => {
            tracing::warn!("Announcing requested but no service discovery is configured");
            None
        }
        _ => None,
    };

    tracing::info!(
        dcc_type = %options.dcc_type,
        instance = %instance_name,
        uri = %uri,
        addr = %local_addr,
        "RPC server listening"
    );
    let _ = ready.send(Ok((local_addr, identity)));

    let service = RpcService::new(context.clone());
    let result = server
        .run_until(
            move |request, peer| {
                let service = service.clone();
                async move {
                    let id = request.id;
                    match tokio::task::spawn_blocking(move || service.handle(&request, Some(peer))).await {
                        Ok(response) => response,
                        Err(e) => Response::from_error(
                            id,
                            &RpcError::Transport(format!("Request handler failed: {}", e)),
                        ),
                    }
                }
            },
            shutdown_rx,
        )
        .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "RPC server loop failed");
    }

    if let Some(announcer) = announcer {
        announcer.stop();
    }
    if let Some(heartbeat) = heartbeat {
        heartbeat.stop();
    }
    if let Some(registry) = &options.registry {
        if let Err(e) = registry.unregister(&options.dcc_type, &instance_name) {
            tracing::warn!(instance = %instance_name, error = %e, "Failed to unregister instance");
        }
    }
    context.set_identity(None);
    context.attach_shutdown(None);

    tracing::info!(instance = %instance_name, "RPC server stopped");
}

/// Handle to a running server.
///
/// Clones share the server. Dropping the last clone stops it.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    identity: ServerIdentity,
    local_addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn dcc_type(&self) -> &str {
        &self.inner.identity.dcc_type
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.identity.instance_name
    }

    /// The advertised `dccrpc://host:port` URI.
    pub fn uri(&self) -> &str {
        &self.inner.identity.uri
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .thread
            .lock()
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stops the server and waits for it to unregister. Calling it on a
    /// stopped server only logs a warning.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            tracing::warn!(instance = %self.instance_name(), "RPC server is already stopped");
        } else {
            tracing::info!(instance = %self.instance_name(), "Stopping RPC server");
        }
        self.inner.join();
    }

    /// Blocks until the server stops, e.g. through `stop_rpc_server`.
    pub fn wait(&self) {
        self.inner.join();
    }
}

impl HandleInner {
    fn join(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                tracing::error!(instance = %self.identity.instance_name, "RPC server thread panicked");
            }
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dccrpc_common::security::SecurityFlags;
    use tempfile::TempDir;

    #[test]
    fn test_start_registers_and_shutdown_unregisters() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(InstanceRegistry::new(dir.path().join("instances.json")));
        let context = ServerContext::new(SecurityFlags::default()).into_shared();

        let options = ServerOptions::new("maya").with_registry(registry.clone());
        let handle = RpcServer::start(options, context.clone()).unwrap();

        assert_eq!(handle.instance_name(), "maya-1");
        assert!(handle.uri().starts_with("dccrpc://127.0.0.1:"));
        assert!(handle.is_running());
        assert_eq!(
            registry.get_uri("maya", Some("maya-1")).unwrap().as_deref(),
            Some(handle.uri())
        );
        assert_eq!(context.identity().unwrap().instance_name, "maya-1");

        handle.shutdown();
        assert!(!handle.is_running());
        assert!(registry.get_uri("maya", Some("maya-1")).unwrap().is_none());
        assert!(context.identity().is_none());

        // second shutdown only warns
        handle.shutdown();
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let context = ServerContext::new(SecurityFlags::default()).into_shared();
        let options = ServerOptions::new("houdini").with_host("256.0.0.1");
        assert!(RpcServer::start(options, context).is_err());
    }

    #[test]
    fn test_empty_dcc_type_rejected() {
        let context = ServerContext::new(SecurityFlags::default()).into_shared();
        assert!(matches!(
            RpcServer::start(ServerOptions::new(""), context),
            Err(RpcError::Validation(_))
        ));
    }

    #[test]
    fn test_request_shutdown_stops_server() {
        let context = ServerContext::new(SecurityFlags::default()).into_shared();
        let handle = RpcServer::start(ServerOptions::new("nuke").with_instance_name("comp"), context.clone()).unwrap();
        assert_eq!(handle.instance_name(), "comp");

        assert!(context.request_shutdown());
        handle.wait();
        assert!(!handle.is_running());
    }
}
