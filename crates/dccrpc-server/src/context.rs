use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dccrpc_common::config::Settings;
use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::security::{SecurityFlags, TokenAuthority};
use dccrpc_common::transfer::{ChunkAssembler, TransferChunk};
use dccrpc_instances::ServiceDiscovery;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::builtins;
use crate::events::{EventBus, DEFAULT_HISTORY_SIZE};
use crate::registry::FunctionRegistry;
use crate::runtime::{ResourceLimits, ScriptEnv};
use crate::task_manager::{TaskManager, TaskManagerConfig};
use crate::versioning::VersionRegistry;

/// Chunked uploads idle for longer than this are dropped.
pub const DEFAULT_TRANSFER_TTL: Duration = Duration::from_secs(10 * 60);

/// A chunked upload waiting for the rest of its chunks.
struct StagedTransfer {
    assembler: ChunkAssembler,
    last_chunk_at: Instant,
}

/// Outcome of staging one chunk.
pub(crate) struct StagedChunk {
    /// Set once the last chunk arrived; the upload is no longer staged.
    pub finished: Option<ChunkAssembler>,
    pub received: usize,
    pub total: u32,
}

/// Where a running server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub dcc_type: String,
    pub instance_name: String,
    pub uri: String,
}

/// Everything a server shares between requests.
///
/// Built once, turned into an `Arc` with [`ServerContext::into_shared`]
/// (which also installs the built-in functions) and handed to
/// [`RpcServer::start`](crate::RpcServer::start).
pub struct ServerContext {
    pub functions: FunctionRegistry,
    pub versions: VersionRegistry,
    pub events: EventBus,
    pub tasks: TaskManager,
    flags: SecurityFlags,
    auth: Option<TokenAuthority>,
    globals: Map<String, Value>,
    discovery: Option<ServiceDiscovery>,
    limits: ResourceLimits,
    transfers: Mutex<HashMap<String, StagedTransfer>>,
    transfer_ttl: Duration,
    identity: RwLock<Option<ServerIdentity>>,
    shutdown: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

impl ServerContext {
    pub fn new(flags: SecurityFlags) -> Self {
        Self::configured(flags, DEFAULT_HISTORY_SIZE, TaskManagerConfig::default())
    }

    pub fn configured(flags: SecurityFlags, history_size: usize, tasks: TaskManagerConfig) -> Self {
        let events = EventBus::new(history_size);
        Self {
            functions: FunctionRegistry::new(),
            versions: VersionRegistry::new(),
            tasks: TaskManager::new(tasks, Some(events.clone())),
            events,
            flags,
            auth: None,
            globals: Map::new(),
            discovery: None,
            limits: ResourceLimits::default(),
            transfers: Mutex::new(HashMap::new()),
            transfer_ttl: DEFAULT_TRANSFER_TTL,
            identity: RwLock::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// Event history and task workers from the config file; capability
    /// flags and the token secret from the environment.
    pub fn from_settings(settings: &Settings) -> Self {
        let context = Self::configured(
            SecurityFlags::from_env(),
            settings.events.history_size,
            TaskManagerConfig::from_settings(&settings.tasks),
        );
        match TokenAuthority::from_env() {
            Some(auth) => context.with_auth(auth),
            None => context,
        }
    }

    pub fn with_auth(mut self, auth: TokenAuthority) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Globals injected into every remotely registered script and returned
    /// by `get_globals`.
    pub fn with_globals(mut self, globals: Map<String, Value>) -> Self {
        self.globals = globals;
        self
    }

    pub fn with_discovery(mut self, discovery: ServiceDiscovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// How long a chunked upload may sit without a new chunk.
    pub fn with_transfer_ttl(mut self, ttl: Duration) -> Self {
        self.transfer_ttl = ttl;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Shares the context and registers the built-in functions.
    pub fn into_shared(self) -> Arc<Self> {
        let context = Arc::new(self);
        builtins::register_builtins(&context);
        context
    }

    pub fn flags(&self) -> &SecurityFlags {
        &self.flags
    }

    pub fn globals(&self) -> &Map<String, Value> {
        &self.globals
    }

    pub fn discovery(&self) -> Option<&ServiceDiscovery> {
        self.discovery.as_ref()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn identity(&self) -> Option<ServerIdentity> {
        self.identity.read().clone()
    }

    pub(crate) fn set_identity(&self, identity: Option<ServerIdentity>) {
        *self.identity.write() = identity;
    }

    /// Checks an auth token against the server secret.
    pub fn authenticate(&self, token: Option<&str>) -> Result<()> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            RpcError::PermissionDenied("Authentication is required but no secret is configured".to_string())
        })?;
        let token = token.ok_or_else(|| RpcError::PermissionDenied("Missing auth token".to_string()))?;
        auth.verify(token).map(|_| ())
    }

    /// Server globals overlaid with the caller's.
    pub(crate) fn script_env(&self, paths: Vec<String>, client_globals: Map<String, Value>) -> ScriptEnv {
        let mut globals = self.globals.clone();
        globals.extend(client_globals);
        let identity = self.identity();

        ScriptEnv {
            globals,
            paths,
            dcc_type: identity.as_ref().map(|i| i.dcc_type.clone()),
            instance_name: identity.map(|i| i.instance_name),
        }
    }

    /// Chunked uploads that have not received every chunk yet.
    pub fn transfers_in_flight(&self) -> usize {
        self.transfers.lock().len()
    }

    /// Adds a chunk to its upload, evicting uploads that went idle first.
    pub(crate) fn stage_chunk(&self, chunk: TransferChunk) -> Result<StagedChunk> {
        let now = Instant::now();
        let mut transfers = self.transfers.lock();
        transfers.retain(|id, staged| {
            let idle = now.duration_since(staged.last_chunk_at);
            if idle > self.transfer_ttl {
                tracing::warn!(
                    transfer_id = %id,
                    received = staged.assembler.received(),
                    total = staged.assembler.total(),
                    "Dropping abandoned chunked transfer"
                );
                return false;
            }
            true
        });

        let transfer_id = chunk.transfer_id.clone();
        let staged = transfers
            .entry(transfer_id.clone())
            .or_insert_with(|| StagedTransfer {
                assembler: ChunkAssembler::new(transfer_id.clone(), chunk.total),
                last_chunk_at: now,
            });
        staged.assembler.add(chunk)?;
        staged.last_chunk_at = now;

        let (received, total) = (staged.assembler.received(), staged.assembler.total());
        let finished = if staged.assembler.is_complete() {
            transfers.remove(&transfer_id).map(|staged| staged.assembler)
        } else {
            None
        };
        Ok(StagedChunk {
            finished,
            received,
            total,
        })
    }

    pub(crate) fn attach_shutdown(&self, sender: Option<Arc<watch::Sender<bool>>>) {
        *self.shutdown.lock() = sender;
    }

    /// Asks the running server to stop. Returns false when no server is attached
    /// or it was already asked.
    pub fn request_shutdown(&self) -> bool {
        let sender = self.shutdown.lock().clone();
        match sender {
            Some(sender) => !sender.send_replace(true),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunks(len: usize) -> Vec<TransferChunk> {
        let data = "A".repeat(len);
        let package = dccrpc_common::transfer::TransferPackage {
            file_name: "plate.exr".into(),
            file_size: len as u64,
            // only checked when the upload is decoded
            file_hash: String::new(),
            is_compressed: false,
            data,
        };
        dccrpc_common::transfer::split_into_chunks(&package, 10)
    }

    #[test]
    fn test_idle_chunked_transfers_are_evicted() {
        let context = ServerContext::new(SecurityFlags::default()).with_transfer_ttl(Duration::from_millis(50));
        let abandoned = chunks(40);
        let live = chunks(20);

        let staged = context.stage_chunk(abandoned[0].clone()).unwrap();
        assert!(staged.finished.is_none());
        assert_eq!((staged.received, staged.total), (1, 4));
        assert_eq!(context.transfers_in_flight(), 1);

        std::thread::sleep(Duration::from_millis(120));
        context.stage_chunk(live[0].clone()).unwrap();
        assert_eq!(context.transfers_in_flight(), 1);
        assert!(!context.transfers.lock().contains_key(&abandoned[0].transfer_id));

        let staged = context.stage_chunk(live[1].clone()).unwrap();
        assert!(staged.finished.is_some());
        assert_eq!(context.transfers_in_flight(), 0);
    }

    #[test]
    fn test_authenticate() {
        let context = ServerContext::new(SecurityFlags::default());
        assert!(matches!(context.authenticate(Some("x")), Err(RpcError::PermissionDenied(_))));

        let authority = TokenAuthority::new("s3cret");
        let token = authority.issue("pipeline", chrono::Duration::minutes(5)).unwrap();
        let context = context.with_auth(authority);
        assert!(context.authenticate(Some(&token)).is_ok());
        assert!(context.authenticate(None).is_err());
        assert!(context.authenticate(Some("forged.00")).is_err());
    }

    #[test]
    fn test_client_globals_override_server_globals() {
        let mut globals = Map::new();
        globals.insert("project".into(), json!("server"));
        globals.insert("fps".into(), json!(24));
        let context = ServerContext::new(SecurityFlags::default()).with_globals(globals);

        let mut client = Map::new();
        client.insert("project".into(), json!("client"));
        let env = context.script_env(vec![], client);
        assert_eq!(env.globals["project"], json!("client"));
        assert_eq!(env.globals["fps"], json!(24));
        assert!(env.dcc_type.is_none());
    }

    #[test]
    fn test_request_shutdown_once() {
        let context = ServerContext::new(SecurityFlags::default());
        assert!(!context.request_shutdown());

        let (tx, rx) = watch::channel(false);
        context.attach_shutdown(Some(Arc::new(tx)));
        assert!(context.request_shutdown());
        assert!(!context.request_shutdown());
        assert!(*rx.borrow());
    }
}
