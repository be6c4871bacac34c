use std::sync::Arc;

use boa_engine::{
    gc::{empty_trace, Finalize, Trace},
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    property::Attribute,
    value::JsValue,
    Context, Source,
};
use dccrpc_common::protocol::error::{Result, RpcError};
use serde_json::{Map, Value};

use super::conversions::{js_value_to_json, json_object_to_js, json_to_js_value};
use super::limits::ResourceLimits;
use crate::invocation::{Handler, Invocation, ProgressReporter};

/// What a script sees besides its own source.
#[derive(Debug, Clone, Default)]
pub struct ScriptEnv {
    /// Installed as global variables. Later keys win.
    pub globals: Map<String, Value>,
    /// Exposed as `dccrpc.paths`.
    pub paths: Vec<String>,
    pub dcc_type: Option<String>,
    pub instance_name: Option<String>,
}

/// A JavaScript function registered at runtime.
///
/// The source is evaluated in a fresh [`Context`] on every call so calls
/// share no state. Arguments are passed positionally; keyword arguments,
/// when present, follow as one trailing object.
///
/// Besides the globals from [`ScriptEnv`], scripts get a `dccrpc` object
/// with `log(...)`, `reportProgress(progress, message)`, `paths`, `dccType`
/// and `instanceName`. `reportProgress` does nothing unless the call runs as
/// a task.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    name: String,
    source: Arc<str>,
    env: Arc<ScriptEnv>,
    limits: ResourceLimits,
}

impl ScriptFunction {
    /// Evaluates `source` once and checks that it defines a callable `name`.
    pub fn compile(name: &str, source: &str, env: ScriptEnv, limits: ResourceLimits) -> Result<Self> {
        if name.is_empty() {
            return Err(RpcError::Validation("Function name must not be empty".into()));
        }
        limits.validate()?;

        let function = Self {
            name: name.to_string(),
            source: Arc::from(source),
            env: Arc::new(env),
            limits,
        };
        let mut ctx = function.context(None)?;
        function.lookup(&mut ctx)?;
        Ok(function)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn call(&self, invocation: &Invocation) -> Result<Value> {
        let mut ctx = self.context(invocation.progress.clone())?;
        let function = self.lookup(&mut ctx)?;

        let mut args = Vec::with_capacity(invocation.args.len() + 1);
        for arg in &invocation.args {
            args.push(json_to_js_value(arg, &mut ctx)?);
        }
        if !invocation.kwargs.is_empty() {
            args.push(json_object_to_js(&invocation.kwargs, &mut ctx)?.into());
        }

        let result = function
            .call(&JsValue::undefined(), &args, &mut ctx)
            .map_err(|e| RpcError::Script(format!("{}: {}", self.name, e)))?;
        js_value_to_json(&result, &mut ctx)
    }

    pub fn into_handler(self) -> Handler {
        let function = Arc::new(self);
        Arc::new(move |invocation: &Invocation| function.call(invocation))
    }

    fn context(&self, progress: Option<ProgressReporter>) -> Result<Context> {
        let mut ctx = Context::default();
        self.limits.apply(&mut ctx);
        install_env(&mut ctx, &self.env, progress)?;

        ctx.eval(Source::from_bytes(self.source.as_bytes()))
            .map_err(|e| RpcError::Script(format!("Evaluation of '{}' failed: {}", self.name, e)))?;
        Ok(ctx)
    }

    fn lookup(&self, ctx: &mut Context) -> Result<JsObject> {
        let value = ctx
            .global_object()
            .get(js_string!(self.name.clone()), ctx)
            .map_err(|e| RpcError::Script(e.to_string()))?;

        value
            .as_object()
            .filter(|object| object.is_callable())
            .cloned()
            .ok_or_else(|| RpcError::Script(format!("Source does not define a callable named '{}'", self.name)))
    }
}

/// Reporter captured by `dccrpc.reportProgress`. Holds no GC values.
struct ProgressCapture(Option<ProgressReporter>);

impl Finalize for ProgressCapture {}

// SAFETY: contains no `Gc` pointers, so there is nothing to trace.
unsafe impl Trace for ProgressCapture {
    empty_trace!();
}

fn install_env(ctx: &mut Context, env: &ScriptEnv, progress: Option<ProgressReporter>) -> Result<()> {
    for (key, value) in &env.globals {
        let value = json_to_js_value(value, ctx)?;
        ctx.register_global_property(js_string!(key.clone()), value, Attribute::all())
            .map_err(|e| RpcError::Script(format!("Failed to install global '{}': {}", key, e)))?;
    }

    let dccrpc = JsObject::with_object_proto(ctx.intrinsics());

    let log = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure(|_this, args, _ctx| {
            let parts: Vec<String> = args.iter().map(|v| v.display().to_string()).collect();
            tracing::info!(target: "dccrpc::script", "{}", parts.join(" "));
            Ok(JsValue::undefined())
        }),
    )
    .build();

    let report_progress = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, capture: &ProgressCapture, ctx| {
                let progress = args.first().cloned().unwrap_or_else(JsValue::undefined).to_number(ctx)?;
                let message = match args.get(1) {
                    Some(value) if !value.is_undefined() => value.to_string(ctx)?.to_std_string_escaped(),
                    _ => String::new(),
                };
                if let Some(reporter) = &capture.0 {
                    reporter.report(progress, &message);
                }
                Ok(JsValue::undefined())
            },
            ProgressCapture(progress),
        ),
    )
    .build();

    let paths = json_to_js_value(&Value::from(env.paths.clone()), ctx)?;
    let dcc_type = json_to_js_value(&Value::from(env.dcc_type.clone()), ctx)?;
    let instance_name = json_to_js_value(&Value::from(env.instance_name.clone()), ctx)?;

    let properties: [(&str, JsValue); 5] = [
        ("log", log.into()),
        ("reportProgress", report_progress.into()),
        ("paths", paths),
        ("dccType", dcc_type),
        ("instanceName", instance_name),
    ];
    for (key, value) in properties {
        dccrpc
            .create_data_property_or_throw(js_string!(key), value, ctx)
            .map_err(|e| RpcError::Script(e.to_string()))?;
    }

    ctx.register_global_property(js_string!("dccrpc"), dccrpc, Attribute::all())
        .map_err(|e| RpcError::Script(format!("Failed to install dccrpc bindings: {}", e)))
}
