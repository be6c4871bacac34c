use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use dccrpc_common::protocol::error::{Result, RpcError};
use parking_lot::RwLock;

use crate::invocation::Handler;

/// `MAJOR.MINOR.PATCH`, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for Version {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RpcError::InvalidVersion(s.to_string());
        let mut parts = s.split('.');
        let mut next = || -> Result<u64> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let version = Version {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Functions registered under several versions.
///
/// Calls without an explicit version go to the highest registered version.
#[derive(Default)]
pub struct VersionRegistry {
    functions: RwLock<HashMap<String, BTreeMap<Version, Handler>>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, version: &str, handler: Handler) -> Result<()> {
        let version: Version = version.parse()?;
        let mut functions = self.functions.write();
        let versions = functions.entry(name.to_string()).or_default();
        if versions.insert(version, handler).is_some() {
            tracing::warn!(function = name, %version, "Overwriting versioned function");
        }
        Ok(())
    }

    /// The exact version when given, the latest otherwise.
    ///
    /// An unparseable version resolves to nothing.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Option<Handler> {
        let functions = self.functions.read();
        let versions = functions.get(name)?;
        match version {
            Some(v) => versions.get(&v.parse::<Version>().ok()?).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    /// Versions of `name`, oldest first.
    pub fn list_versions(&self, name: &str) -> Vec<String> {
        self.functions
            .read()
            .get(name)
            .map(|versions| versions.keys().map(Version::to_string).collect())
            .unwrap_or_default()
    }

    pub fn get_latest_version(&self, name: &str) -> Option<String> {
        self.functions
            .read()
            .get(name)
            .and_then(|versions| versions.keys().next_back())
            .map(Version::to_string)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Invocation;
    use serde_json::json;
    use std::sync::Arc;

    fn returning(tag: &'static str) -> Handler {
        Arc::new(move |_: &Invocation| Ok(json!(tag)))
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(
            "1.10.3".parse::<Version>().unwrap(),
            Version { major: 1, minor: 10, patch: 3 }
        );
        for bad in ["1.0", "1.0.0.0", "a.b.c", "1..0", "", "1.0.-1", " 1.0.0"] {
            assert!(
                matches!(bad.parse::<Version>(), Err(RpcError::InvalidVersion(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_numeric_ordering() {
        let v = |s: &str| s.parse::<Version>().unwrap();
        assert!(v("1.10.0") > v("1.9.9"));
        assert!(v("2.0.0") > v("1.99.99"));
    }

    #[test]
    fn test_latest_tracks_highest_version() {
        let registry = VersionRegistry::new();
        registry.register("export", "1.2.0", returning("1.2.0")).unwrap();
        registry.register("export", "1.10.0", returning("1.10.0")).unwrap();
        registry.register("export", "1.9.0", returning("1.9.0")).unwrap();

        assert_eq!(registry.get_latest_version("export").as_deref(), Some("1.10.0"));
        assert_eq!(registry.list_versions("export"), vec!["1.2.0", "1.9.0", "1.10.0"]);

        let latest = registry.resolve("export", None).unwrap();
        assert_eq!(latest(&Invocation::default()).unwrap(), json!("1.10.0"));

        let exact = registry.resolve("export", Some("1.2.0")).unwrap();
        assert_eq!(exact(&Invocation::default()).unwrap(), json!("1.2.0"));
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = VersionRegistry::new();
        registry.register("export", "1.0.0", returning("x")).unwrap();

        assert!(registry.resolve("import", None).is_none());
        assert!(registry.resolve("export", Some("2.0.0")).is_none());
        assert!(registry.resolve("export", Some("garbage")).is_none());
        assert!(registry.list_versions("import").is_empty());
        assert!(registry.get_latest_version("import").is_none());
    }

    #[test]
    fn test_invalid_version_is_rejected() {
        let registry = VersionRegistry::new();
        let err = registry.register("export", "v1", returning("x")).unwrap_err();
        assert!(matches!(err, RpcError::InvalidVersion(_)));
        assert!(!registry.contains("export"));
    }
}
