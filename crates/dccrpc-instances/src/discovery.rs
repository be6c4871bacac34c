//! Best-effort service discovery over UDP multicast.
//!
//! Servers announce `{uri, dcc_type, instance_name, hostname}` on a multicast
//! group at a fixed interval. Listeners keep the announcements they hear in a
//! service table keyed by `hostname/dcc_type/instance_name` and forward local
//! ones (or all of them, when `register_remote` is set) into the
//! [`InstanceRegistry`]. Records not refreshed within `service_timeout` are
//! purged on the next [`ServiceDiscovery::get_services`].
//!
//! Nothing here is fatal: socket and parse failures are logged and skipped.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dccrpc_common::config::DiscoverySettings;
use dccrpc_common::protocol::error::{Result, RpcError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};

use crate::local_hostname;
use crate::registry::InstanceRegistry;

/// Lower bound for the announce and poll intervals.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub port: u16,
    pub announce_interval: Duration,
    pub service_timeout: Duration,
    /// Also register announcements from other hosts.
    pub register_remote: bool,
    /// How often the listener wakes up to check for a stop request.
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(239, 0, 0, 1),
            port: 9999,
            announce_interval: Duration::from_secs(30),
            service_timeout: Duration::from_secs(90),
            register_remote: false,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_settings(settings: &DiscoverySettings) -> Result<Self> {
        let multicast_group = settings.multicast_group.parse::<Ipv4Addr>().map_err(|e| {
            RpcError::Config(format!(
                "Invalid multicast group '{}': {}",
                settings.multicast_group, e
            ))
        })?;
        Ok(Self {
            multicast_group,
            port: settings.port,
            announce_interval: Duration::from_secs(settings.announce_interval_secs),
            service_timeout: Duration::from_secs(settings.service_timeout_secs),
            register_remote: settings.register_remote,
            ..Self::default()
        })
    }
}

/// The datagram a server multicasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub uri: String,
    pub dcc_type: String,
    pub instance_name: String,
    pub hostname: String,
}

impl Announcement {
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.hostname, self.dcc_type, self.instance_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub uri: String,
    pub dcc_type: String,
    pub instance_name: String,
    pub hostname: String,
    pub last_seen: DateTime<Utc>,
}

struct Inner {
    config: DiscoveryConfig,
    hostname: String,
    registry: Option<Arc<InstanceRegistry>>,
    services: Mutex<HashMap<String, ServiceRecord>>,
    listening: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    announcers: Mutex<Vec<AnnouncerHandle>>,
}

/// Service discovery front end. Cheap to clone.
#[derive(Clone)]
pub struct ServiceDiscovery {
    inner: Arc<Inner>,
}

impl ServiceDiscovery {
    pub fn new(config: DiscoveryConfig, registry: Option<Arc<InstanceRegistry>>) -> Self {
        Self::with_hostname(config, registry, local_hostname())
    }

    /// Like [`ServiceDiscovery::new`] with an explicit local host name.
    pub fn with_hostname(
        config: DiscoveryConfig,
        registry: Option<Arc<InstanceRegistry>>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                hostname: hostname.into(),
                registry,
                services: Mutex::new(HashMap::new()),
                listening: AtomicBool::new(false),
                listener: Mutex::new(None),
                announcers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Starts the listener thread. Calling it while listening is a no-op.
    pub fn start_listener(&self) -> Result<()> {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = match self.bind_listener_socket() {
            Ok(socket) => socket,
            Err(e) => {
                self.inner.listening.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let discovery = self.clone();
        let spawned = thread::Builder::new()
            .name("dccrpc-discovery".to_string())
            .spawn(move || discovery.listen(socket));

        match spawned {
            Ok(handle) => {
                *self.inner.listener.lock() = Some(handle);
                tracing::info!(
                    group = %self.inner.config.multicast_group,
                    port = self.inner.config.port,
                    "Discovery listener started"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.listening.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Every DCC session and tool on a host listens on the same group port,
    /// so the socket is bound with address (and on unix, port) reuse.
    fn bind_listener_socket(&self) -> Result<UdpSocket> {
        let config = &self.inner.config;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_read_timeout(Some(config.poll_interval.max(MIN_INTERVAL)))?;
        Ok(socket)
    }

    fn listen(&self, socket: UdpSocket) {
        let mut buf = [0u8; 4096];
        while self.inner.listening.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if let Err(e) = self.handle_announcement(&buf[..len]) {
                        tracing::debug!(from = %from, error = %e, "Ignoring discovery datagram");
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery receive failed");
                    thread::sleep(self.inner.config.poll_interval.max(MIN_INTERVAL));
                }
            }
        }
        let _ = socket.leave_multicast_v4(&self.inner.config.multicast_group, &Ipv4Addr::UNSPECIFIED);
        tracing::debug!("Discovery listener stopped");
    }

    /// Records one announcement and returns its service key.
    pub fn handle_announcement(&self, payload: &[u8]) -> Result<String> {
        let announcement: Announcement = serde_json::from_slice(payload)?;
        let key = announcement.key();
        let is_local = announcement.hostname == self.inner.hostname;

        self.inner.services.lock().insert(
            key.clone(),
            ServiceRecord {
                uri: announcement.uri.clone(),
                dcc_type: announcement.dcc_type.clone(),
                instance_name: announcement.instance_name.clone(),
                hostname: announcement.hostname.clone(),
                last_seen: Utc::now(),
            },
        );

        if is_local || self.inner.config.register_remote {
            if let Some(registry) = &self.inner.registry {
                if let Err(e) = registry.register(
                    &announcement.dcc_type,
                    &announcement.uri,
                    Some(&announcement.instance_name),
                ) {
                    tracing::warn!(service = %key, error = %e, "Failed to register discovered service");
                }
            }
        }

        Ok(key)
    }

    /// Known services, optionally of one DCC type. Expired records are purged first.
    pub fn get_services(&self, dcc_type: Option<&str>) -> Vec<ServiceRecord> {
        let timeout = chrono::Duration::from_std(self.inner.config.service_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let cutoff = Utc::now() - timeout;

        let mut services = self.inner.services.lock();
        services.retain(|key, record| {
            let fresh = record.last_seen >= cutoff;
            if !fresh {
                tracing::debug!(service = %key, "Purging expired service");
            }
            fresh
        });

        let mut found: Vec<ServiceRecord> = services
            .values()
            .filter(|r| dcc_type.map_or(true, |wanted| r.dcc_type == wanted))
            .cloned()
            .collect();
        found.sort_by(|a, b| (&a.hostname, &a.dcc_type, &a.instance_name).cmp(&(&b.hostname, &b.dcc_type, &b.instance_name)));
        found
    }

    /// Starts announcing a server. The announcer runs until stopped, either
    /// through the returned handle or by [`ServiceDiscovery::stop`].
    pub fn start_announcer(&self, uri: &str, dcc_type: &str, instance_name: &str) -> Result<AnnouncerHandle> {
        let announcement = Announcement {
            uri: uri.to_string(),
            dcc_type: dcc_type.to_string(),
            instance_name: instance_name.to_string(),
            hostname: self.inner.hostname.clone(),
        };
        let handle = AnnouncerHandle::spawn(
            announcement,
            SocketAddrV4::new(self.inner.config.multicast_group, self.inner.config.port),
            self.inner.config.announce_interval,
        )?;

        let mut announcers = self.inner.announcers.lock();
        announcers.retain(|a| !a.is_stopped());
        announcers.push(handle.clone());
        Ok(handle)
    }

    /// Stops the listener and every announcer started here.
    pub fn stop(&self) {
        self.inner.listening.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.listener.lock().take() {
            let _ = handle.join();
        }

        let announcers: Vec<AnnouncerHandle> = self.inner.announcers.lock().drain(..).collect();
        for announcer in announcers {
            announcer.stop();
        }
    }
}

/// Handle to a running announcer thread.
#[derive(Clone)]
pub struct AnnouncerHandle {
    key: String,
    stop_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl AnnouncerHandle {
    fn spawn(announcement: Announcement, target: SocketAddrV4, interval: Duration) -> Result<Self> {
        let interval = interval.max(MIN_INTERVAL);
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(1)?;
        let payload = serde_json::to_vec(&announcement)?;
        let key = announcement.key();

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_key = key.clone();
        thread::Builder::new()
            .name(format!("dccrpc-announce-{}", announcement.instance_name))
            .spawn(move || loop {
                if let Err(e) = socket.send_to(&payload, target) {
                    tracing::debug!(service = %thread_key, error = %e, "Announcement failed");
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| RpcError::Transport(format!("Failed to spawn announcer: {}", e)))?;

        tracing::info!(service = %key, "Announcer started");
        Ok(Self {
            key,
            stop_tx: Arc::new(Mutex::new(Some(stop_tx))),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_tx.lock().is_none()
    }

    /// Stops announcing. Further calls do nothing.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}
