//! dccrpc Instances
//!
//! Bookkeeping of running dccrpc servers.
//!
//! - [`InstanceRegistry`]: the authoritative on-disk map of
//!   `dcc_type -> instance_name -> {uri, last_heartbeat}`
//! - [`TcpProbe`]: reachability check used to prune dead entries
//! - [`HeartbeatTask`]: keeps a server's `last_heartbeat` fresh
//! - [`ServiceDiscovery`]: optional best-effort UDP multicast announcements
//!
//! Discovery only ever feeds the registry; everything works with it disabled.

pub mod discovery;
pub mod heartbeat;
pub mod probe;
pub mod registry;

pub use discovery::{Announcement, AnnouncerHandle, DiscoveryConfig, ServiceDiscovery, ServiceRecord};
pub use heartbeat::HeartbeatTask;
pub use probe::{Probe, TcpProbe};
pub use registry::{InstanceInfo, InstanceRecord, InstanceRegistry, InstanceStatus};

/// Name of this machine, or `localhost` when it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
