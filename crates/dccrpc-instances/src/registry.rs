//! On-disk instance registry.
//!
//! The registry file is a JSON object
//! `{dcc_type: {instance_name: {"uri": str, "last_heartbeat": iso8601}}}`.
//! Every mutation loads the file, changes it and writes it back while holding
//! the registry's lock, so writers in one process never interleave. Writers in
//! different processes are not coordinated.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dccrpc_common::config::app_config_dir;
use dccrpc_common::protocol::error::{Result, RpcError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::probe::Probe;

const REGISTRY_FILE_NAME: &str = "registry.json";

/// Name used by callers to mean "any instance of this type".
pub const DEFAULT_INSTANCE: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub uri: String,
    pub last_heartbeat: DateTime<Utc>,
}

type RegistryData = BTreeMap<String, BTreeMap<String, InstanceRecord>>;

/// A registry entry together with its keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub dcc_type: String,
    pub instance_name: String,
    pub uri: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl InstanceInfo {
    /// `dcc_type/instance_name`
    pub fn path(&self) -> String {
        format!("{}/{}", self.dcc_type, self.instance_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(flatten)]
    pub info: InstanceInfo,
    /// Seconds since the last heartbeat.
    pub age_secs: i64,
    pub alive: bool,
}

pub struct InstanceRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(app_config_dir()?.join(REGISTRY_FILE_NAME))
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a server and returns its instance name.
    ///
    /// Without a name, `{dcc_type}-{n}` is generated with the smallest free
    /// `n >= 1`. An explicit name replaces any existing entry of that name.
    pub fn register(&self, dcc_type: &str, uri: &str, instance_name: Option<&str>) -> Result<String> {
        if dcc_type.is_empty() {
            return Err(RpcError::Validation("dcc_type must not be empty".to_string()));
        }

        let name = self.update(|data| {
            let instances = data.entry(dcc_type.to_string()).or_default();
            let name = match instance_name {
                Some(name) if !name.is_empty() && name != DEFAULT_INSTANCE => name.to_string(),
                _ => (1..)
                    .map(|n| format!("{}-{}", dcc_type, n))
                    .find(|candidate| !instances.contains_key(candidate))
                    .unwrap_or_else(|| format!("{}-{}", dcc_type, instances.len() + 1)),
            };
            instances.insert(
                name.clone(),
                InstanceRecord {
                    uri: uri.to_string(),
                    last_heartbeat: Utc::now(),
                },
            );
            Ok(name)
        })?;

        tracing::info!(dcc_type, instance = %name, uri, "Registered instance");
        Ok(name)
    }

    /// Removes an entry. Returns whether it existed.
    pub fn unregister(&self, dcc_type: &str, instance_name: &str) -> Result<bool> {
        let removed = self.update(|data| {
            let removed = match data.get_mut(dcc_type) {
                Some(instances) => instances.remove(instance_name).is_some(),
                None => false,
            };
            data.retain(|_, instances| !instances.is_empty());
            Ok(removed)
        })?;

        if removed {
            tracing::info!(dcc_type, instance = instance_name, "Unregistered instance");
        }
        Ok(removed)
    }

    /// Refreshes `last_heartbeat`. Returns `false` when the entry is gone.
    pub fn update_heartbeat(&self, dcc_type: &str, instance_name: &str) -> Result<bool> {
        self.update(|data| {
            match data
                .get_mut(dcc_type)
                .and_then(|instances| instances.get_mut(instance_name))
            {
                Some(record) => {
                    record.last_heartbeat = Utc::now();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Looks up a URI.
    ///
    /// `None` or `"default"` picks the instance of that type with the most
    /// recent heartbeat.
    pub fn get_uri(&self, dcc_type: &str, instance_name: Option<&str>) -> Result<Option<String>> {
        let data = self.read()?;
        let Some(instances) = data.get(dcc_type) else {
            return Ok(None);
        };

        Ok(match instance_name {
            Some(name) if name != DEFAULT_INSTANCE => instances.get(name).map(|r| r.uri.clone()),
            _ => instances
                .values()
                .max_by_key(|r| r.last_heartbeat)
                .map(|r| r.uri.clone()),
        })
    }

    pub fn list_instances(&self, dcc_type: Option<&str>) -> Result<Vec<InstanceInfo>> {
        let data = self.read()?;
        Ok(data
            .into_iter()
            .filter(|(dcc, _)| dcc_type.map_or(true, |wanted| wanted == dcc))
            .flat_map(|(dcc, instances)| {
                instances.into_iter().map(move |(name, record)| InstanceInfo {
                    dcc_type: dcc.clone(),
                    instance_name: name,
                    uri: record.uri,
                    last_heartbeat: record.last_heartbeat,
                })
            })
            .collect())
    }

    /// Probes every entry and removes the unreachable ones.
    ///
    /// Probing happens without the lock. Only transient failures (connection
    /// refused, timeout) count as unreachable; an entry whose URI changed
    /// while probing is kept. Returns the removed `dcc_type/instance_name` paths.
    pub fn cleanup(&self, prober: &dyn Probe) -> Result<Vec<String>> {
        let snapshot = self.list_instances(None)?;

        let dead: Vec<InstanceInfo> = snapshot
            .into_iter()
            .filter(|info| match prober.probe(&info.uri) {
                Ok(()) => false,
                Err(e) if e.is_transient() => {
                    tracing::debug!(instance = %info.path(), error = %e, "Instance unreachable");
                    true
                }
                Err(e) => {
                    tracing::debug!(instance = %info.path(), error = %e, "Instance answered with an error");
                    false
                }
            })
            .collect();

        if dead.is_empty() {
            return Ok(Vec::new());
        }

        let removed = self.update(|data| {
            let mut removed = Vec::new();
            for info in &dead {
                if let Some(instances) = data.get_mut(&info.dcc_type) {
                    let unchanged = instances
                        .get(&info.instance_name)
                        .is_some_and(|r| r.uri == info.uri);
                    if unchanged {
                        instances.remove(&info.instance_name);
                        removed.push(info.path());
                    }
                }
            }
            data.retain(|_, instances| !instances.is_empty());
            Ok(removed)
        })?;

        for path in &removed {
            tracing::info!(instance = %path, "Removed stale instance");
        }
        Ok(removed)
    }

    /// Reports every entry as alive or offline by heartbeat age.
    pub fn status(&self, max_age: Duration) -> Result<Vec<InstanceStatus>> {
        let now = Utc::now();
        let max_age = max_age.as_secs() as i64;
        Ok(self
            .list_instances(None)?
            .into_iter()
            .map(|info| {
                let age_secs = (now - info.last_heartbeat).num_seconds().max(0);
                InstanceStatus {
                    info,
                    age_secs,
                    alive: age_secs <= max_age,
                }
            })
            .collect())
    }

    /// Removes entries whose heartbeat is older than `max_age`.
    pub fn remove_stale(&self, max_age: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age.as_secs() as i64);
        self.update(|data| {
            let mut removed = Vec::new();
            for (dcc, instances) in data.iter_mut() {
                instances.retain(|name, record| {
                    let keep = record.last_heartbeat >= cutoff;
                    if !keep {
                        removed.push(format!("{}/{}", dcc, name));
                    }
                    keep
                });
            }
            data.retain(|_, instances| !instances.is_empty());
            Ok(removed)
        })
    }

    fn read(&self) -> Result<RegistryData> {
        let _guard = self.lock.lock();
        self.load()
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut RegistryData) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock();
        let mut data = self.load()?;
        let result = mutate(&mut data)?;
        self.save(&data)?;
        Ok(result)
    }

    /// Reads the file. A missing file is empty; an unreadable one is logged and treated as empty.
    fn load(&self) -> Result<RegistryData> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(RegistryData::new()),
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => Ok(data),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Corrupt instance registry, starting empty");
                    Ok(RegistryData::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryData::new()),
            Err(e) => Err(RpcError::Registry(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, data: &RegistryData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| RpcError::Registry(format!("Failed to write {}: {}", self.path.display(), e)))
    }
}
