//! Calling convention shared by registered functions, tasks and scripts.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::security::acl::AccessControlList;
use serde::Serialize;
use serde_json::{Map, Value};

/// A registered function body.
pub type Handler = Arc<dyn Fn(&Invocation) -> Result<Value> + Send + Sync>;

/// Progress sink handed to functions running as tasks.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(f64, &str) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        Self { sink: Arc::new(sink) }
    }

    /// Reports progress in `[0, 1]`; out-of-range values are clamped.
    pub fn report(&self, progress: f64, message: &str) {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
        (self.sink)(progress, message);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// Arguments of one call.
///
/// Parameters can be passed positionally or by keyword; the accessors look
/// at the keyword first and then at the positional slot.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Set when the call runs as a task.
    pub progress: Option<ProgressReporter>,
    pub peer: Option<SocketAddr>,
    /// The caller presented a valid auth token.
    pub authenticated: bool,
}

impl Invocation {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            args,
            kwargs,
            progress: None,
            peer: None,
            authenticated: false,
        }
    }

    /// Keyword `name`, else positional `index`. JSON `null` counts as absent.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs
            .get(name)
            .or_else(|| self.args.get(index))
            .filter(|v| !v.is_null())
    }

    pub fn require(&self, index: usize, name: &str) -> Result<&Value> {
        self.get(index, name)
            .ok_or_else(|| RpcError::Validation(format!("Missing required argument '{}'", name)))
    }

    pub fn str_arg(&self, index: usize, name: &str) -> Result<String> {
        match self.require(index, name)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(RpcError::Validation(format!(
                "Argument '{}' must be a string, got {}",
                name, other
            ))),
        }
    }

    pub fn opt_str(&self, index: usize, name: &str) -> Result<Option<String>> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(RpcError::Validation(format!(
                "Argument '{}' must be a string, got {}",
                name, other
            ))),
        }
    }

    pub fn bool_or(&self, index: usize, name: &str, default: bool) -> Result<bool> {
        match self.get(index, name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(RpcError::Validation(format!(
                "Argument '{}' must be a boolean, got {}",
                name, other
            ))),
        }
    }

    pub fn u64_or(&self, index: usize, name: &str, default: u64) -> Result<u64> {
        match self.get(index, name) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| {
                RpcError::Validation(format!("Argument '{}' must be a non-negative integer, got {}", name, value))
            }),
        }
    }

    /// No-op unless the call runs as a task.
    pub fn report_progress(&self, progress: f64, message: &str) {
        if let Some(reporter) = &self.progress {
            reporter.report(progress, message);
        }
    }
}

/// One documented parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Option<String>,
    pub default: Option<Value>,
}

/// Introspection and access metadata of a registered function.
#[derive(Debug, Clone, Default)]
pub struct FunctionMeta {
    pub doc: Option<String>,
    pub params: Vec<ParamSpec>,
    pub return_type: Option<String>,
    pub category: Option<String>,
    pub acl: Option<AccessControlList>,
    /// Calls must carry a valid auth token.
    pub requires_auth: bool,
}

impl FunctionMeta {
    /// `name(a: str, b: int = 1) -> dict`
    pub fn signature(&self, name: &str) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let mut s = p.name.clone();
                if let Some(ty) = &p.ty {
                    s.push_str(": ");
                    s.push_str(ty);
                }
                if let Some(default) = &p.default {
                    s.push_str(" = ");
                    s.push_str(&default.to_string());
                }
                s
            })
            .collect();

        let mut signature = format!("{}({})", name, params.join(", "));
        if let Some(ret) = &self.return_type {
            signature.push_str(" -> ");
            signature.push_str(ret);
        }
        signature
    }
}

/// A function ready to be registered.
///
/// # Example
///
/// ```
/// use dccrpc_server::{FunctionSpec, Invocation};
/// use serde_json::json;
///
/// let spec = FunctionSpec::new("add", |inv: &Invocation| {
///     let a = inv.u64_or(0, "a", 0)?;
///     let b = inv.u64_or(1, "b", 0)?;
///     Ok(json!(a + b))
/// })
/// .doc("Adds two numbers.")
/// .param("a", "int", None)
/// .param("b", "int", Some(json!(0)))
/// .returns("int");
///
/// assert_eq!(spec.meta.signature(&spec.name), "add(a: int, b: int = 0) -> int");
/// ```
#[derive(Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub handler: Handler,
    pub meta: FunctionMeta,
}

impl FunctionSpec {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Invocation) -> Result<Value> + Send + Sync + 'static,
    {
        Self::from_handler(name, Arc::new(handler))
    }

    pub fn from_handler(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            handler,
            meta: FunctionMeta::default(),
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.meta.doc = Some(doc.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, ty: impl Into<String>, default: Option<Value>) -> Self {
        self.meta.params.push(ParamSpec {
            name: name.into(),
            ty: Some(ty.into()),
            default,
        });
        self
    }

    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.meta.return_type = Some(ty.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.meta.category = Some(category.into());
        self
    }

    pub fn acl<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.acl = Some(AccessControlList::new(patterns));
        self
    }

    pub fn requires_auth(mut self) -> Self {
        self.meta.requires_auth = true;
        self
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_keyword_wins_over_positional() {
        let mut kwargs = Map::new();
        kwargs.insert("name".into(), json!("from-kwarg"));
        let inv = Invocation::new(vec![json!("from-arg")], kwargs);
        assert_eq!(inv.str_arg(0, "name").unwrap(), "from-kwarg");
    }

    #[test]
    fn test_null_is_absent() {
        let inv = Invocation::new(vec![Value::Null], Map::new());
        assert_eq!(inv.opt_str(0, "prefix").unwrap(), None);
        assert!(matches!(inv.str_arg(0, "prefix"), Err(RpcError::Validation(_))));
        assert!(inv.bool_or(0, "verbose", true).unwrap());
    }

    #[test]
    fn test_type_mismatch_is_validation_error() {
        let inv = Invocation::new(vec![json!(5)], Map::new());
        let err = inv.str_arg(0, "name").unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[test]
    fn test_progress_is_clamped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut inv = Invocation::default();
        inv.report_progress(0.5, "ignored without reporter");

        inv.progress = Some(ProgressReporter::new(move |p, m| sink.lock().push((p, m.to_string()))));
        inv.report_progress(1.7, "over");
        inv.report_progress(-1.0, "under");

        assert_eq!(
            *seen.lock(),
            vec![(1.0, "over".to_string()), (0.0, "under".to_string())]
        );
    }

    #[test]
    fn test_signature_without_metadata() {
        let meta = FunctionMeta::default();
        assert_eq!(meta.signature("ping"), "ping()");
    }
}
