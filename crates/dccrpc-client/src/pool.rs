//! Per-URI connection pool.
//!
//! # Sharing policy
//!
//! [`ConnectionPool::get_connection`] never blocks waiting for a connection to
//! be released. It hands out an idle connection when there is one, opens a new
//! one while the URI is below `max_connections`, and otherwise returns the
//! least recently used connection even though it is in use. Callers sharing a
//! connection take turns on its stream, one request/response at a time.
//!
//! A background thread closes connections that stayed idle longer than
//! `idle_timeout` and forgets URIs left without connections.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dccrpc_common::config::PoolSettings;
use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::protocol::{Request, Response};
use dccrpc_common::transport::{RpcUri, TcpTransport, WireOptions};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    /// Zero disables the sweep thread.
    pub sweep_interval: Duration,
    pub timeout: Duration,
    pub wire: WireOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            wire: WireOptions::default(),
        }
    }
}

impl PoolConfig {
    pub fn from_settings(settings: &PoolSettings, timeout: Duration, wire: WireOptions) -> Self {
        Self {
            max_connections: settings.max_connections.max(1),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            timeout,
            wire,
        }
    }
}

/// One pooled TCP connection to a server.
pub struct PooledConnection {
    id: u64,
    uri: RpcUri,
    transport: TcpTransport,
    stream: Mutex<TcpStream>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &RpcUri {
        &self.uri
    }

    /// Sends a request and waits for its response.
    ///
    /// Concurrent users of a shared connection are serialized here.
    pub fn send_request(&self, request: &Request) -> Result<Response> {
        let mut stream = self.stream.lock();
        self.transport.send_request(&mut stream, request)
    }

    fn close(&self) {
        let _ = self.stream.lock().shutdown(Shutdown::Both);
    }
}

struct Entry {
    conn: Arc<PooledConnection>,
    users: usize,
    last_used: Instant,
}

#[derive(Default)]
struct UriSlots {
    entries: Vec<Entry>,
    /// Connections being opened outside the lock.
    pending: usize,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<RpcUri, UriSlots>,
    shut_down: bool,
}

/// Connection counts for one URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UriStats {
    pub total: usize,
    pub in_use: usize,
    pub pending: usize,
}

struct PoolInner {
    config: PoolConfig,
    transport: TcpTransport,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    sweeper: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

enum Acquire {
    Ready(Arc<PooledConnection>),
    Create,
    Wait,
}

/// Thread-safe connection pool. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let transport = TcpTransport::new(config.wire, config.timeout);
        let sweep_interval = config.sweep_interval;

        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                transport,
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
                sweeper: Mutex::new(None),
            }),
        };

        if !sweep_interval.is_zero() {
            pool.start_sweeper(sweep_interval);
        }
        pool
    }

    fn start_sweeper(&self, interval: Duration) {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);

        let spawned = thread::Builder::new()
            .name("dccrpc-pool-sweep".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                        Some(inner) => {
                            let closed = ConnectionPool { inner }.sweep_idle();
                            if closed > 0 {
                                tracing::debug!(closed, "Closed idle connections");
                            }
                        }
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => *self.inner.sweeper.lock() = Some((stop_tx, handle)),
            Err(e) => tracing::error!(error = %e, "Failed to spawn pool sweep thread"),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns a connection to `uri`, following the sharing policy above.
    pub fn get_connection(&self, uri: &RpcUri) -> Result<Arc<PooledConnection>> {
        let max = self.inner.config.max_connections.max(1);
        let deadline = Instant::now() + self.inner.config.timeout;

        loop {
            let decision = {
                let mut state = self.inner.state.lock();
                if state.shut_down {
                    return Err(RpcError::Connection("Connection pool is shut down".to_string()));
                }

                let slots = state.slots.entry(uri.clone()).or_default();
                let now = Instant::now();

                if let Some(entry) = slots.entries.iter_mut().find(|e| e.users == 0) {
                    entry.users = 1;
                    entry.last_used = now;
                    Acquire::Ready(entry.conn.clone())
                } else if slots.entries.len() + slots.pending < max {
                    slots.pending += 1;
                    Acquire::Create
                } else if let Some(entry) = slots.entries.iter_mut().min_by_key(|e| e.last_used) {
                    entry.users += 1;
                    entry.last_used = now;
                    tracing::debug!(uri = %uri, users = entry.users, "Sharing busy connection");
                    Acquire::Ready(entry.conn.clone())
                } else {
                    // Every slot is still being opened
                    Acquire::Wait
                }
            };

            match decision {
                Acquire::Ready(conn) => return Ok(conn),
                Acquire::Create => break,
                Acquire::Wait => {
                    if Instant::now() >= deadline {
                        return Err(RpcError::Timeout(self.inner.config.timeout.as_millis() as u64));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        let connected = self.inner.transport.connect(uri);

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let slots = state.slots.entry(uri.clone()).or_default();
        slots.pending = slots.pending.saturating_sub(1);

        let stream = connected?;
        let conn = Arc::new(PooledConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            uri: uri.clone(),
            transport: self.inner.transport.clone(),
            stream: Mutex::new(stream),
        });

        if state.shut_down {
            drop(guard);
            conn.close();
            return Err(RpcError::Connection("Connection pool is shut down".to_string()));
        }

        slots.entries.push(Entry {
            conn: conn.clone(),
            users: 1,
            last_used: Instant::now(),
        });
        tracing::debug!(uri = %uri, id = conn.id, "Opened pooled connection");
        Ok(conn)
    }

    /// Marks one use of `conn` as finished.
    pub fn release_connection(&self, conn: &PooledConnection) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state
            .slots
            .get_mut(&conn.uri)
            .and_then(|slots| slots.entries.iter_mut().find(|e| e.conn.id == conn.id))
        {
            entry.users = entry.users.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }

    /// Drops a broken connection from the pool and closes it.
    pub fn discard(&self, conn: &PooledConnection) {
        {
            let mut state = self.inner.state.lock();
            if let Some(slots) = state.slots.get_mut(&conn.uri) {
                slots.entries.retain(|e| e.conn.id != conn.id);
            }
        }
        conn.close();
        tracing::debug!(uri = %conn.uri, id = conn.id, "Discarded connection");
    }

    /// Closes idle connections older than `idle_timeout`. Returns how many were closed.
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut closed = Vec::new();

        {
            let mut state = self.inner.state.lock();
            for slots in state.slots.values_mut() {
                let mut kept = Vec::with_capacity(slots.entries.len());
                for entry in slots.entries.drain(..) {
                    if entry.users == 0 && entry.last_used.elapsed() > idle_timeout {
                        closed.push(entry.conn);
                    } else {
                        kept.push(entry);
                    }
                }
                slots.entries = kept;
            }
            state
                .slots
                .retain(|_, slots| !slots.entries.is_empty() || slots.pending > 0);
        }

        for conn in &closed {
            conn.close();
        }
        closed.len()
    }

    /// Acquires a connection released automatically when the guard drops.
    pub fn scoped(&self, uri: &RpcUri) -> Result<ConnectionGuard> {
        let conn = self.get_connection(uri)?;
        Ok(ConnectionGuard {
            pool: self.clone(),
            conn,
            broken: false,
        })
    }

    pub fn stats(&self) -> HashMap<String, UriStats> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .map(|(uri, slots)| {
                (
                    uri.to_string(),
                    UriStats {
                        total: slots.entries.len(),
                        in_use: slots.entries.iter().filter(|e| e.users > 0).count(),
                        pending: slots.pending,
                    },
                )
            })
            .collect()
    }

    /// Stops the sweep thread and closes every connection. Idempotent.
    pub fn shutdown(&self) {
        let closed: Vec<Arc<PooledConnection>> = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state
                .slots
                .drain()
                .flat_map(|(_, slots)| slots.entries.into_iter().map(|e| e.conn))
                .collect()
        };

        if let Some((stop_tx, handle)) = self.inner.sweeper.lock().take() {
            let _ = stop_tx.send(());
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        for conn in &closed {
            conn.close();
        }
        tracing::debug!(closed = closed.len(), "Connection pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }
}

/// A pooled connection held for the guard's lifetime.
pub struct ConnectionGuard {
    pool: ConnectionPool,
    conn: Arc<PooledConnection>,
    broken: bool,
}

impl ConnectionGuard {
    /// Discard the connection on drop instead of returning it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for ConnectionGuard {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.broken {
            self.pool.discard(&self.conn);
        } else {
            self.pool.release_connection(&self.conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Accepts connections forever and holds them open.
    fn listener() -> (RpcUri, Arc<Mutex<Vec<TcpStream>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                sink.lock().push(stream);
            }
        });
        (RpcUri::new("127.0.0.1", port), accepted)
    }

    fn config(max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            idle_timeout: Duration::from_millis(50),
            sweep_interval: Duration::ZERO,
            timeout: Duration::from_secs(2),
            wire: WireOptions::default(),
        }
    }

    #[test]
    fn test_never_exceeds_max_connections() {
        let (uri, _accepted) = listener();
        let pool = ConnectionPool::new(config(3));

        let held: Vec<_> = (0..10).map(|_| pool.get_connection(&uri).unwrap()).collect();
        let mut ids: Vec<u64> = held.iter().map(|c| c.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        let stats = pool.stats()[&uri.to_string()];
        assert_eq!(stats.total, 3);
        assert_eq!(stats.in_use, 3);
    }

    #[test]
    fn test_released_connection_is_reused() {
        let (uri, _accepted) = listener();
        let pool = ConnectionPool::new(config(3));

        let first = pool.get_connection(&uri).unwrap();
        let first_id = first.id();
        pool.release_connection(&first);

        let second = pool.get_connection(&uri).unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.stats()[&uri.to_string()].total, 1);
    }

    #[test]
    fn test_sweep_closes_idle_connections_and_prunes_uri() {
        let (uri, _accepted) = listener();
        let pool = ConnectionPool::new(config(3));

        {
            let _a = pool.scoped(&uri).unwrap();
            let _b = pool.scoped(&uri).unwrap();
        }
        let busy = pool.get_connection(&uri).unwrap();

        thread::sleep(Duration::from_millis(80));
        assert_eq!(pool.sweep_idle(), 1);
        assert_eq!(pool.stats()[&uri.to_string()].total, 1);

        pool.release_connection(&busy);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(pool.sweep_idle(), 1);
        assert!(pool.stats().is_empty());
    }

    #[test]
    fn test_background_sweep() {
        let (uri, _accepted) = listener();
        let pool = ConnectionPool::new(PoolConfig {
            sweep_interval: Duration::from_millis(20),
            ..config(2)
        });

        drop(pool.scoped(&uri).unwrap());
        thread::sleep(Duration::from_millis(300));
        assert!(pool.stats().is_empty());
        pool.shutdown();
    }

    #[test]
    fn test_guard_releases_and_discards() {
        let (uri, _accepted) = listener();
        let pool = ConnectionPool::new(config(2));

        {
            let _guard = pool.scoped(&uri).unwrap();
            assert_eq!(pool.stats()[&uri.to_string()].in_use, 1);
        }
        assert_eq!(pool.stats()[&uri.to_string()].in_use, 0);

        {
            let mut guard = pool.scoped(&uri).unwrap();
            guard.mark_broken();
        }
        assert_eq!(pool.stats()[&uri.to_string()].total, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_final() {
        let (uri, _accepted) = listener();
        let pool = ConnectionPool::new(PoolConfig {
            sweep_interval: Duration::from_millis(10),
            ..config(2)
        });
        let _conn = pool.get_connection(&uri).unwrap();

        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(pool.stats().is_empty());
        assert!(pool.get_connection(&uri).is_err());
    }

    #[test]
    fn test_connect_failure_frees_the_slot() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let uri = RpcUri::new("127.0.0.1", port);
        let pool = ConnectionPool::new(config(1));

        assert!(pool.get_connection(&uri).is_err());
        assert_eq!(pool.stats()[&uri.to_string()].pending, 0);
    }
}
