use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::{
    BatchResult, CallSpec, Request, Response, ServiceMethod, AUTH_TOKEN_KWARG, VERSION_KWARG,
};
use serde_json::{json, Value};

use crate::context::ServerContext;
use crate::invocation::{Handler, Invocation};
use crate::registry::RegisteredFunction;
use crate::task_manager::panic_message;
use crate::versioning::Version;

/// The service object behind every server URI.
///
/// Exposes `call`, `batch_call`, `list_methods` and `get_globals`. Failures
/// never escape as transport errors: every request gets a response, with
/// `error_type` naming the error kind.
#[derive(Clone)]
pub struct RpcService {
    context: Arc<ServerContext>,
}

impl RpcService {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn handle(&self, request: &Request, peer: Option<SocketAddr>) -> Response {
        tracing::debug!(method = %request.method, id = request.id, "Handling request");

        let outcome = request
            .method
            .parse::<ServiceMethod>()
            .and_then(|method| self.dispatch(method, &request.args, peer));

        match outcome {
            Ok(result) => Response::ok(request.id, result),
            Err(e) => {
                tracing::warn!(method = %request.method, kind = e.kind(), error = %e, "Request failed");
                Response::from_error(request.id, &e)
            }
        }
    }

    fn dispatch(&self, method: ServiceMethod, args: &Value, peer: Option<SocketAddr>) -> Result<Value> {
        match method {
            ServiceMethod::Call => {
                let spec: CallSpec = serde_json::from_value(args.clone())
                    .map_err(|e| RpcError::InvalidRequest(format!("Invalid call: {}", e)))?;
                self.call(spec, peer)
            }
            ServiceMethod::BatchCall => {
                let specs: Vec<CallSpec> = serde_json::from_value(args.clone())
                    .map_err(|e| RpcError::InvalidRequest(format!("Invalid batch call: {}", e)))?;
                let results: Vec<BatchResult> = specs
                    .into_iter()
                    .map(|spec| BatchResult::from_outcome(self.call(spec, peer)))
                    .collect();
                Ok(serde_json::to_value(results)?)
            }
            ServiceMethod::ListMethods => {
                self.authorize_service(args)?;
                let mut names = self.context.functions.names();
                names.extend(
                    self.context
                        .versions
                        .names()
                        .into_iter()
                        .filter(|name| !self.context.functions.contains(name)),
                );
                names.sort();
                Ok(json!(names))
            }
            ServiceMethod::GetGlobals => {
                self.authorize_service(args)?;
                Ok(Value::Object(self.context.globals().clone()))
            }
        }
    }

    /// Invokes one registered function.
    ///
    /// `_version` selects a versioned implementation and `_auth_token` carries
    /// the caller's token; neither reaches the function. A versioned
    /// implementation wins over a plain registration of the same name.
    pub fn call(&self, mut spec: CallSpec, peer: Option<SocketAddr>) -> Result<Value> {
        let version = spec.take_reserved(VERSION_KWARG);
        let token = spec.take_reserved(AUTH_TOKEN_KWARG);

        let (handler, function) = self.resolve(&spec.function, version.as_deref())?;

        let mut invocation = Invocation::new(spec.args, spec.kwargs);
        invocation.peer = peer;
        let authenticated = self.context.authenticate(token.as_deref());
        invocation.authenticated = authenticated.is_ok();
        if self.context.flags().encryption {
            authenticated?;
        }
        if let Some(function) = &function {
            function.check_access(&invocation)?;
        }

        tracing::debug!(function = %spec.function, version = ?version, "Calling function");
        match panic::catch_unwind(AssertUnwindSafe(|| handler(&invocation))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(function = %spec.function, panic = %message, "Function panicked");
                Err(RpcError::remote("Panic", message))
            }
        }
    }

    /// A malformed `_version` is rejected; a well-formed but unknown one
    /// falls back to the plain registration.
    fn resolve(&self, name: &str, version: Option<&str>) -> Result<(Handler, Option<Arc<RegisteredFunction>>)> {
        if let Some(version) = version {
            version.parse::<Version>()?;
        }
        if let Some(handler) = self.context.versions.resolve(name, version) {
            return Ok((handler, None));
        }
        if let Some(function) = self.context.functions.get(name) {
            return Ok((function.handler.clone(), Some(function)));
        }
        Err(match version {
            Some(version) if self.context.versions.contains(name) => {
                RpcError::FunctionNotFound(format!("{}@{}", name, version))
            }
            _ => RpcError::FunctionNotFound(name.to_string()),
        })
    }

    /// `list_methods`/`get_globals` carry `null` or `{"_auth_token": ...}`.
    fn authorize_service(&self, args: &Value) -> Result<()> {
        if !self.context.flags().encryption {
            return Ok(());
        }
        let token = args.get(AUTH_TOKEN_KWARG).and_then(Value::as_str);
        self.context.authenticate(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::FunctionSpec;
    use dccrpc_common::security::{SecurityFlags, TokenAuthority};
    use serde_json::Map;

    fn service(flags: SecurityFlags) -> RpcService {
        let context = ServerContext::new(flags).into_shared();
        context.functions.register("echo", |inv| Ok(json!({"args": inv.args, "kwargs": inv.kwargs})));
        context.functions.register("explode", |_| panic!("scene graph corrupted"));
        RpcService::new(context)
    }

    fn call_request(spec: CallSpec) -> Request {
        Request::new("call", serde_json::to_value(spec).unwrap())
    }

    #[test]
    fn test_call_strips_reserved_kwargs() {
        let service = service(SecurityFlags::default());
        let spec = CallSpec::new("echo")
            .arg(1)
            .kwarg("mode", "fast")
            .kwarg(AUTH_TOKEN_KWARG, "ignored");

        let response = service.handle(&call_request(spec), None);
        assert!(response.success, "{:?}", response.error);
        assert_eq!(
            response.result.unwrap(),
            json!({"args": [1], "kwargs": {"mode": "fast"}})
        );
    }

    #[test]
    fn test_unknown_function_and_method() {
        let service = service(SecurityFlags::default());
        let response = service.handle(&call_request(CallSpec::new("missing")), None);
        assert!(!response.success);
        assert_eq!(response.error_type.as_deref(), Some("FunctionNotFound"));

        let response = service.handle(&Request::new("exposed_call", Value::Null), None);
        assert_eq!(response.error_type.as_deref(), Some("InvalidRequest"));
    }

    #[test]
    fn test_panics_become_error_responses() {
        let service = service(SecurityFlags::default());
        let response = service.handle(&call_request(CallSpec::new("explode")), None);
        assert!(!response.success);
        assert_eq!(response.error_type.as_deref(), Some("Panic"));
        assert_eq!(response.error.as_deref(), Some("scene graph corrupted"));
    }

    #[test]
    fn test_versioned_resolution() {
        let service = service(SecurityFlags::default());
        let versions = &service.context().versions;
        versions
            .register("export", "1.0.0", Arc::new(|_: &Invocation| Ok(json!("v1"))))
            .unwrap();
        versions
            .register("export", "2.0.0", Arc::new(|_: &Invocation| Ok(json!("v2"))))
            .unwrap();
        service.context().functions.register("export", |_| Ok(json!("plain")));

        let latest = service.call(CallSpec::new("export"), None).unwrap();
        assert_eq!(latest, json!("v2"));

        let pinned = service
            .call(CallSpec::new("export").kwarg(VERSION_KWARG, "1.0.0"), None)
            .unwrap();
        assert_eq!(pinned, json!("v1"));

        // unknown version falls back to the plain registration
        let fallback = service
            .call(CallSpec::new("export").kwarg(VERSION_KWARG, "9.9.9"), None)
            .unwrap();
        assert_eq!(fallback, json!("plain"));

        let malformed = service
            .call(CallSpec::new("export").kwarg(VERSION_KWARG, "v2"), None)
            .unwrap_err();
        assert!(matches!(malformed, RpcError::InvalidVersion(ref v) if v == "v2"));
        let response = service.handle(
            &call_request(CallSpec::new("echo").kwarg(VERSION_KWARG, "1.0")),
            None,
        );
        assert_eq!(response.error_type.as_deref(), Some("InvalidVersion"));

        let names = service.dispatch(ServiceMethod::ListMethods, &Value::Null, None).unwrap();
        assert_eq!(names.as_array().unwrap().iter().filter(|n| *n == "export").count(), 1);
    }

    #[test]
    fn test_batch_keeps_order_and_isolates_failures() {
        let service = service(SecurityFlags::default());
        let batch = vec![
            CallSpec::new("echo").arg("a"),
            CallSpec::new("missing"),
            CallSpec::new("echo").arg("c"),
        ];
        let request = Request::new("batch_call", serde_json::to_value(batch).unwrap());
        let response = service.handle(&request, None);
        assert!(response.success);

        let results: Vec<BatchResult> = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert_eq!(
            results[1],
            BatchResult::Error {
                error: "Function 'missing' is not registered".into(),
                kind: "FunctionNotFound".into(),
            }
        );
        assert!(results[2].is_success());
    }

    #[test]
    fn test_encryption_requires_token_everywhere() {
        let flags = SecurityFlags {
            encryption: true,
            ..SecurityFlags::default()
        };
        let authority = TokenAuthority::new("studio-secret");
        let token = authority.issue("artist", chrono::Duration::minutes(1)).unwrap();
        let context = ServerContext::new(flags).with_auth(authority).into_shared();
        let service = RpcService::new(context);

        let denied = service.handle(&call_request(CallSpec::new("ping")), None);
        assert_eq!(denied.error_type.as_deref(), Some("PermissionDenied"));

        let allowed = service.handle(&call_request(CallSpec::new("ping").kwarg(AUTH_TOKEN_KWARG, token.clone())), None);
        assert!(allowed.success);

        assert!(service.dispatch(ServiceMethod::GetGlobals, &Value::Null, None).is_err());
        let mut args = Map::new();
        args.insert(AUTH_TOKEN_KWARG.into(), json!(token));
        assert!(service.dispatch(ServiceMethod::GetGlobals, &Value::Object(args), None).is_ok());
    }

    #[test]
    fn test_acl_and_requires_auth() {
        let authority = TokenAuthority::new("k");
        let token = authority.issue("ops", chrono::Duration::minutes(1)).unwrap();
        let context = ServerContext::new(SecurityFlags::default())
            .with_auth(authority)
            .into_shared();
        context.functions.register_function(
            FunctionSpec::new("publish", |_| Ok(json!("published")))
                .acl(["127.0.0.*"])
                .requires_auth(),
        );
        let service = RpcService::new(context);

        let local: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let remote: SocketAddr = "10.1.2.3:40000".parse().unwrap();
        let with_token = || CallSpec::new("publish").kwarg(AUTH_TOKEN_KWARG, token.clone());

        assert!(matches!(
            service.call(CallSpec::new("publish"), Some(local)),
            Err(RpcError::PermissionDenied(_))
        ));
        assert!(matches!(
            service.call(with_token(), Some(remote)),
            Err(RpcError::PermissionDenied(_))
        ));
        assert_eq!(service.call(with_token(), Some(local)).unwrap(), json!("published"));
    }
}
