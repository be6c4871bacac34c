//! Persisted configuration.
//!
//! The config file lives next to the instance registry in
//! `<config_dir>/tp_dcc_rpc/config.json` and holds nested
//! `section -> key -> value` maps. On load the file is deep-merged over the
//! built-in defaults, so missing keys get defaults and unknown keys survive a
//! save. [`Settings`] is the typed view used by the rest of the workspace.
//!
//! # Example
//!
//! ```no_run
//! use dccrpc_common::config::ConfigManager;
//! use serde_json::json;
//!
//! let config = ConfigManager::load_default().unwrap();
//! config.set("pool", "max_connections", json!(8));
//! config.save().unwrap();
//!
//! let settings = config.settings().unwrap();
//! assert_eq!(settings.pool.max_connections, 8);
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::protocol::error::{Result, RpcError};
use crate::serialization::SerializationFormat;

/// Bumped whenever the default layout changes.
pub const CONFIG_SCHEMA_VERSION: u64 = 1;

const APP_DIR_NAME: &str = "tp_dcc_rpc";
const CONFIG_FILE_NAME: &str = "config.json";
const VERSION_KEY: &str = "version";

/// Directory holding the config file and the instance registry.
pub fn app_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| RpcError::Config("Could not determine the user config directory".to_string()))
}

pub fn default_config() -> Value {
    json!({
        "version": CONFIG_SCHEMA_VERSION,
        "server": {
            "host": "127.0.0.1",
            "port": 0,
            "heartbeat_interval_secs": 30
        },
        "client": {
            "timeout_secs": 30,
            "retry_enabled": true,
            "use_pooling": true
        },
        "retry": {
            "max_attempts": 3,
            "initial_delay_ms": 500,
            "max_delay_ms": 10000,
            "backoff_factor": 2.0,
            "jitter": 0.1
        },
        "pool": {
            "max_connections": 5,
            "idle_timeout_secs": 300,
            "sweep_interval_secs": 60
        },
        "discovery": {
            "enabled": false,
            "multicast_group": "239.0.0.1",
            "port": 9999,
            "announce_interval_secs": 30,
            "service_timeout_secs": 90,
            "register_remote": false
        },
        "events": {
            "history_size": 100
        },
        "tasks": {
            "max_workers": null
        },
        "serialization": {
            "format": "json",
            "compression": true,
            "compression_threshold": 1024
        }
    })
}

/// Recursively merges `overlay` into `base`.
///
/// Objects merge key by key; any other overlay value replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

pub struct ConfigManager {
    path: PathBuf,
    data: RwLock<Value>,
}

impl ConfigManager {
    pub fn default_path() -> Result<PathBuf> {
        Ok(app_config_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path()?)
    }

    /// Loads the config file at `path`, merged over the defaults.
    ///
    /// A missing file yields the defaults. A file that is not valid JSON is
    /// logged and ignored rather than failing startup.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut data = default_config();

        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(stored)) => {
                    let stored_version = stored.get(VERSION_KEY).and_then(Value::as_u64).unwrap_or(0);
                    if stored_version < CONFIG_SCHEMA_VERSION {
                        tracing::info!(
                            from = stored_version,
                            to = CONFIG_SCHEMA_VERSION,
                            "Upgrading config schema"
                        );
                    }
                    deep_merge(&mut data, Value::Object(stored));
                    if stored_version < CONFIG_SCHEMA_VERSION {
                        data[VERSION_KEY] = json!(CONFIG_SCHEMA_VERSION);
                    }
                }
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "Config file is not an object, using defaults");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, section: &str, key: &str) -> Option<Value> {
        self.data.read().get(section)?.get(key).cloned()
    }

    pub fn section(&self, section: &str) -> Option<Value> {
        self.data.read().get(section).cloned()
    }

    /// Sets `section.key`, creating the section when needed.
    pub fn set(&self, section: &str, key: &str, value: Value) {
        let mut data = self.data.write();
        let Some(root) = data.as_object_mut() else {
            return;
        };
        let entry = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Some(map) = entry.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Writes the config atomically: a sibling temp file renamed over the target.
    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&*self.data.read())?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn settings(&self) -> Result<Settings> {
        serde_json::from_value(self.data.read().clone())
            .map_err(|e| RpcError::Config(format!("Invalid configuration: {}", e)))
    }

    pub fn to_value(&self) -> Value {
        self.data.read().clone()
    }
}

/// Typed view of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub retry: RetrySettings,
    pub pool: PoolSettings,
    pub discovery: DiscoverySettings,
    pub events: EventSettings,
    pub tasks: TaskSettings,
    pub serialization: SerializationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub timeout_secs: u64,
    pub retry_enabled: bool,
    pub use_pooling: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_enabled: true,
            use_pooling: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub multicast_group: String,
    pub port: u16,
    pub announce_interval_secs: u64,
    pub service_timeout_secs: u64,
    pub register_remote: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            multicast_group: "239.0.0.1".to_string(),
            port: 9999,
            announce_interval_secs: 30,
            service_timeout_secs: 90,
            register_remote: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub history_size: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { history_size: 100 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// `None` runs every task on its own thread.
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationSettings {
    pub format: SerializationFormat,
    pub compression: bool,
    pub compression_threshold: usize,
}

impl Default for SerializationSettings {
    fn default() -> Self {
        Self {
            format: SerializationFormat::Json,
            compression: true,
            compression_threshold: crate::compression::DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ConfigManager::load(dir.path().join("config.json")).unwrap();
        assert_eq!(config.settings().unwrap(), Settings::default());
        assert_eq!(config.get("discovery", "port"), Some(json!(9999)));
    }

    #[test]
    fn test_file_is_merged_over_defaults_and_unknown_keys_survive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"version": 1, "pool": {"max_connections": 2}, "studio": {"site": "lon"}}"#,
        )
        .unwrap();

        let config = ConfigManager::load(&path).unwrap();
        let settings = config.settings().unwrap();
        assert_eq!(settings.pool.max_connections, 2);
        assert_eq!(settings.pool.idle_timeout_secs, 300);

        config.set("events", "history_size", json!(10));
        config.save().unwrap();

        let reloaded = ConfigManager::load(&path).unwrap();
        assert_eq!(reloaded.get("studio", "site"), Some(json!("lon")));
        assert_eq!(reloaded.settings().unwrap().events.history_size, 10);
    }

    #[test]
    fn test_old_schema_is_upgraded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"client": {"timeout_secs": 5}}"#).unwrap();

        let config = ConfigManager::load(&path).unwrap();
        assert_eq!(config.to_value()["version"], json!(CONFIG_SCHEMA_VERSION));
        assert_eq!(config.settings().unwrap().client.timeout_secs, 5);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let config = ConfigManager::load(&path).unwrap();
        assert_eq!(config.settings().unwrap(), Settings::default());
    }

    #[test]
    fn test_deep_merge_replaces_non_objects() {
        let mut base = json!({"a": {"b": 1, "c": [1, 2]}, "d": 1});
        deep_merge(&mut base, json!({"a": {"c": [3]}, "d": {"e": true}}));
        assert_eq!(base, json!({"a": {"b": 1, "c": [3]}, "d": {"e": true}}));
    }

    #[test]
    fn test_set_creates_section() {
        let dir = TempDir::new().unwrap();
        let config = ConfigManager::load(dir.path().join("c.json")).unwrap();
        config.set("custom", "flag", json!(true));
        assert_eq!(config.section("custom"), Some(json!({"flag": true})));
    }
}
