use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::invocation::{FunctionMeta, FunctionSpec, Handler, Invocation};
use dccrpc_common::protocol::error::{Result, RpcError};

/// A function as stored in the registry.
pub struct RegisteredFunction {
    pub name: String,
    pub handler: Handler,
    pub meta: FunctionMeta,
}

impl RegisteredFunction {
    pub fn call(&self, invocation: &Invocation) -> Result<Value> {
        (self.handler)(invocation)
    }

    pub fn signature(&self) -> String {
        self.meta.signature(&self.name)
    }

    /// Applies the access list to the caller's IP and the `requires_auth` flag.
    ///
    /// In-process invocations have no peer and skip the access list.
    pub fn check_access(&self, invocation: &Invocation) -> Result<()> {
        if let (Some(acl), Some(peer)) = (&self.meta.acl, invocation.peer) {
            acl.check(&self.name, &peer.ip().to_string())?;
        }
        if self.meta.requires_auth && !invocation.authenticated {
            return Err(RpcError::PermissionDenied(format!(
                "Function '{}' requires a valid auth token",
                self.name
            )));
        }
        Ok(())
    }
}

/// Name → function map of everything callable through `call`.
///
/// Registering an existing name replaces the previous function.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<RegisteredFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Invocation) -> Result<Value> + Send + Sync + 'static,
    {
        self.register_function(FunctionSpec::new(name, handler));
    }

    pub fn register_function(&self, spec: FunctionSpec) {
        let FunctionSpec { name, handler, meta } = spec;
        let function = Arc::new(RegisteredFunction {
            name: name.clone(),
            handler,
            meta,
        });

        if self.functions.write().insert(name.clone(), function).is_some() {
            tracing::warn!(function = %name, "Overwriting registered function");
        } else {
            tracing::debug!(function = %name, "Registered function");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredFunction>> {
        self.functions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_by_category(&self, category: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .values()
            .filter(|f| f.meta.category.as_deref() == Some(category))
            .map(|f| f.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Sorted names, or `[{name, signature, doc}]` when `verbose`.
    pub fn list(&self, verbose: bool) -> Value {
        if !verbose {
            return json!(self.names());
        }

        let mut functions: Vec<Arc<RegisteredFunction>> = self.functions.read().values().cloned().collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        Value::Array(
            functions
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "signature": f.signature(),
                        "doc": f.meta.doc.clone().unwrap_or_default(),
                    })
                })
                .collect(),
        )
    }

    pub fn describe(&self, name: &str) -> Value {
        let Some(function) = self.get(name) else {
            return json!({
                "found": false,
                "name": name,
                "message": format!("Function '{}' is not registered", name),
            });
        };

        json!({
            "found": true,
            "name": function.name,
            "signature": function.signature(),
            "doc": function.meta.doc.clone().unwrap_or_default(),
            "args": function.meta.params,
            "return_type": function.meta.return_type,
            "category": function.meta.category,
        })
    }
}
