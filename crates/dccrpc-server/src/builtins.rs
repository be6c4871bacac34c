//! Functions every server exposes out of the box.
//!
//! Remote registration, shutdown, process kill, listing and describing are
//! refused when remote control is disabled. The environment functions are
//! refused unless env control is enabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::transfer::{self, TransferChunk, TransferPackage};
use dccrpc_instances::local_hostname;
use serde_json::{json, Map, Value};

use crate::context::{ServerContext, StagedChunk};
use crate::invocation::{FunctionSpec, Handler, Invocation};
use crate::runtime::ScriptFunction;

pub const CATEGORY: &str = "builtin";

pub const SHUTDOWN_MESSAGE: &str = "[tp-rpc] Shutdown signal sent.";

/// Delay before stop/kill take effect so the reply still reaches the caller.
const GRACE_PERIOD: Duration = Duration::from_millis(200);

type Builtin = fn(&Arc<ServerContext>, &Invocation) -> Result<Value>;

/// Wraps a builtin so it holds the context weakly.
fn bind(context: &Arc<ServerContext>, builtin: Builtin) -> impl Fn(&Invocation) -> Result<Value> + Send + Sync + 'static {
    let context = Arc::downgrade(context);
    move |invocation: &Invocation| {
        let context = context
            .upgrade()
            .ok_or_else(|| RpcError::Config("Server context is no longer available".to_string()))?;
        builtin(&context, invocation)
    }
}

pub fn register_builtins(context: &Arc<ServerContext>) {
    let specs = [
        FunctionSpec::new("ping", bind(context, ping))
            .doc("Reports the identity of this server.")
            .returns("dict"),
        FunctionSpec::new("register_remote_function", bind(context, register_remote_function))
            .doc("Registers a JavaScript function sent by the caller.")
            .param("name", "str", None)
            .param("source_code", "str", None)
            .param("client_paths", "list", Some(json!([])))
            .param("client_globals", "dict", Some(json!({})))
            .returns("dict"),
        FunctionSpec::new("stop_rpc_server", bind(context, stop_rpc_server))
            .doc("Stops this server after replying.")
            .returns("str"),
        FunctionSpec::new("kill_process", bind(context, kill_process))
            .doc("Terminates the host process after replying.")
            .returns("str"),
        FunctionSpec::new("list_registered_functions", bind(context, list_registered_functions))
            .doc("Lists registered function names, or their signatures when verbose.")
            .param("verbose", "bool", Some(json!(false)))
            .returns("list"),
        FunctionSpec::new("describe_remote_function", bind(context, describe_remote_function))
            .doc("Describes the signature and documentation of a function.")
            .param("name", "str", None)
            .returns("dict"),
        FunctionSpec::new("get_env", bind(context, get_env))
            .param("name", "str", None)
            .returns("str"),
        FunctionSpec::new("set_env", bind(context, set_env))
            .param("name", "str", None)
            .param("value", "str", None)
            .returns("bool"),
        FunctionSpec::new("list_env", bind(context, list_env))
            .param("prefix", "str", Some(Value::Null))
            .returns("dict"),
        FunctionSpec::new("submit_task", bind(context, submit_task))
            .doc("Runs a registered function in the background and returns the task id.")
            .param("function_name", "str", None)
            .returns("str"),
        FunctionSpec::new("get_task_status", bind(context, get_task_status))
            .param("task_id", "str", None)
            .returns("str"),
        FunctionSpec::new("get_task_result", bind(context, get_task_result))
            .doc("Result of a finished task. Failed tasks raise their error again.")
            .param("task_id", "str", None),
        FunctionSpec::new("get_task_progress", bind(context, get_task_progress))
            .param("task_id", "str", None)
            .returns("dict"),
        FunctionSpec::new("cancel_task", bind(context, cancel_task))
            .doc("Cancels a task that has not started yet.")
            .param("task_id", "str", None)
            .returns("bool"),
        FunctionSpec::new("list_tasks", bind(context, list_tasks)).returns("list"),
        FunctionSpec::new("publish_event", bind(context, publish_event))
            .param("event_type", "str", None)
            .param("data", "any", Some(Value::Null))
            .param("source", "str", Some(Value::Null))
            .returns("str"),
        FunctionSpec::new("subscribe_to_events", bind(context, subscribe_to_events))
            .doc("Calls a registered function for every matching event.")
            .param("event_type", "str", None)
            .param("callback_function", "str", None)
            .returns("bool"),
        FunctionSpec::new("get_recent_events", bind(context, get_recent_events))
            .param("event_type", "str", Some(Value::Null))
            .param("limit", "int", Some(json!(10)))
            .returns("list"),
        FunctionSpec::new("get_function_versions", bind(context, get_function_versions))
            .param("function_name", "str", None)
            .returns("dict"),
        FunctionSpec::new("discover_services", bind(context, discover_services))
            .param("dcc_type", "str", Some(Value::Null))
            .returns("list"),
        FunctionSpec::new("start_discovery_listener", bind(context, start_discovery_listener)).returns("bool"),
        FunctionSpec::new("receive_file", bind(context, receive_file))
            .doc("Saves a transfer package on this machine and returns the path.")
            .param("transfer_package", "dict", None)
            .param("output_dir", "str", Some(Value::Null))
            .returns("str"),
        FunctionSpec::new("prepare_file_for_transfer", bind(context, prepare_file_for_transfer))
            .doc("Packs a local file for download by the caller.")
            .param("file_path", "str", None)
            .param("compress", "bool", Some(json!(true)))
            .returns("dict"),
        FunctionSpec::new("receive_file_chunk", bind(context, receive_file_chunk))
            .doc("Receives one chunk of a large upload; the last chunk writes the file.")
            .param("chunk", "dict", None)
            .param("output_dir", "str", Some(Value::Null))
            .returns("dict"),
    ];

    for spec in specs {
        context.functions.register_function(spec.category(CATEGORY));
    }
}

fn ping(context: &Arc<ServerContext>, _: &Invocation) -> Result<Value> {
    let identity = context.identity();
    Ok(json!({
        "dcc_type": identity.as_ref().map(|i| i.dcc_type.clone()),
        "instance_name": identity.as_ref().map(|i| i.instance_name.clone()),
        "uri": identity.as_ref().map(|i| i.uri.clone()),
        "hostname": local_hostname(),
        "platform": std::env::consts::OS,
    }))
}

fn register_remote_function(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    context.flags().require_remote_control("register_remote_function")?;

    let name = inv.str_arg(0, "name")?;
    let source = inv.str_arg(1, "source_code")?;
    let paths: Vec<String> = match inv.get(2, "client_paths") {
        None => Vec::new(),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| RpcError::Validation(format!("client_paths must be a list of strings: {}", e)))?,
    };
    let client_globals = match inv.get(3, "client_globals") {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(RpcError::Validation(format!("client_globals must be an object, got {}", other)));
        }
    };

    let (paths_added, paths_skipped): (Vec<String>, Vec<String>) =
        paths.into_iter().partition(|p| Path::new(p).exists());
    let env = context.script_env(paths_added.clone(), client_globals);

    let function = match ScriptFunction::compile(&name, &source, env, context.limits().clone()) {
        Ok(function) => function,
        Err(e) => {
            tracing::warn!(function = %name, error = %e, "Remote registration failed");
            return Ok(json!({
                "status": "error",
                "function": name,
                "paths_added": paths_added,
                "paths_skipped": paths_skipped,
                "message": e.to_string(),
            }));
        }
    };

    let doc = match inv.peer {
        Some(peer) => format!("Registered remotely (JavaScript) by {}.", peer.ip()),
        None => "Registered remotely (JavaScript).".to_string(),
    };
    context.functions.register_function(
        FunctionSpec::from_handler(name.clone(), function.into_handler())
            .doc(doc)
            .category("remote"),
    );
    context
        .events
        .emit("function_registered", json!({ "function": name }), Some("rpc"));
    tracing::info!(function = %name, "Remote function registered");

    Ok(json!({
        "status": "success",
        "function": name,
        "paths_added": paths_added,
        "paths_skipped": paths_skipped,
        "message": format!("Function '{}' registered", name),
    }))
}

fn stop_rpc_server(context: &Arc<ServerContext>, _: &Invocation) -> Result<Value> {
    context.flags().require_remote_control("stop_rpc_server")?;

    let context = Arc::downgrade(context);
    thread::Builder::new()
        .name("dccrpc-stop".to_string())
        .spawn(move || {
            thread::sleep(GRACE_PERIOD);
            let requested = context.upgrade().map_or(false, |c| c.request_shutdown());
            if !requested {
                tracing::warn!("Shutdown requested but no running server is attached");
            }
        })?;
    Ok(json!(SHUTDOWN_MESSAGE))
}

fn kill_process(context: &Arc<ServerContext>, _: &Invocation) -> Result<Value> {
    context.flags().require_remote_control("kill_process")?;

    thread::Builder::new()
        .name("dccrpc-kill".to_string())
        .spawn(|| {
            thread::sleep(GRACE_PERIOD);
            tracing::warn!(pid = std::process::id(), "Terminating process on remote request");
            std::process::exit(0);
        })?;
    Ok(json!(format!("[tp-rpc] Terminating process {}.", std::process::id())))
}

fn list_registered_functions(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    context.flags().require_remote_control("list_registered_functions")?;
    Ok(context.functions.list(inv.bool_or(0, "verbose", false)?))
}

fn describe_remote_function(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    context.flags().require_remote_control("describe_remote_function")?;
    Ok(context.functions.describe(&inv.str_arg(0, "name")?))
}

fn get_env(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    context.flags().require_env_control("get_env")?;
    let name = inv.str_arg(0, "name")?;
    Ok(std::env::var(&name).map(Value::String).unwrap_or(Value::Null))
}

fn set_env(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    context.flags().require_env_control("set_env")?;
    let name = inv.str_arg(0, "name")?;
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(RpcError::Validation(format!("Invalid environment variable name '{}'", name)));
    }
    let value = match inv.require(1, "value")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if value.contains('\0') {
        return Err(RpcError::Validation("Environment values cannot contain NUL".to_string()));
    }

    std::env::set_var(&name, &value);
    tracing::info!(variable = %name, "Environment variable set remotely");
    Ok(Value::Bool(true))
}

fn list_env(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    context.flags().require_env_control("list_env")?;
    let prefix = inv.opt_str(0, "prefix")?.unwrap_or_default();
    let vars: Map<String, Value> = std::env::vars()
        .filter(|(key, _)| key.starts_with(&prefix))
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    Ok(Value::Object(vars))
}

fn submit_task(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let mut kwargs = inv.kwargs.clone();
    let (name, args) = match kwargs.remove("function_name") {
        Some(Value::String(name)) => (name, inv.args.clone()),
        Some(other) => {
            return Err(RpcError::Validation(format!("function_name must be a string, got {}", other)));
        }
        None => match inv.args.split_first() {
            Some((Value::String(name), rest)) => (name.clone(), rest.to_vec()),
            _ => return Err(RpcError::Validation("Missing required argument 'function_name'".to_string())),
        },
    };

    let handler = match context.functions.get(&name) {
        Some(function) => {
            function.check_access(inv)?;
            function.handler.clone()
        }
        None => context
            .versions
            .resolve(&name, None)
            .ok_or_else(|| RpcError::FunctionNotFound(name.clone()))?,
    };

    let mut task_inv = Invocation::new(args, kwargs);
    task_inv.peer = inv.peer;
    task_inv.authenticated = inv.authenticated;

    let id = context.tasks.submit(&name, handler, task_inv)?;
    Ok(Value::String(id))
}

fn get_task_status(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let status = context.tasks.get_status(&inv.str_arg(0, "task_id")?)?;
    Ok(json!(status.as_str()))
}

fn get_task_result(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    context.tasks.get_result(&inv.str_arg(0, "task_id")?)
}

fn get_task_progress(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let (progress, message) = context.tasks.get_progress(&inv.str_arg(0, "task_id")?)?;
    Ok(json!({ "progress": progress, "message": message }))
}

fn cancel_task(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    Ok(Value::Bool(context.tasks.cancel(&inv.str_arg(0, "task_id")?)))
}

fn list_tasks(context: &Arc<ServerContext>, _: &Invocation) -> Result<Value> {
    Ok(serde_json::to_value(context.tasks.list_tasks())?)
}

fn publish_event(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let event_type = inv.str_arg(0, "event_type")?;
    let data = inv.get(1, "data").cloned().unwrap_or(Value::Null);
    let source = inv.opt_str(2, "source")?;
    Ok(Value::String(context.events.emit(&event_type, data, source.as_deref())))
}

fn subscribe_to_events(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let event_type = inv.str_arg(0, "event_type")?;
    let callback = inv.str_arg(1, "callback_function")?;
    if !context.functions.contains(&callback) {
        return Err(RpcError::FunctionNotFound(callback));
    }

    // The callback is looked up per event so re-registration takes effect
    let weak = Arc::downgrade(context);
    let name = callback.clone();
    context.events.subscribe(&event_type, move |event| {
        let context = weak
            .upgrade()
            .ok_or_else(|| RpcError::Config("Server context is no longer available".to_string()))?;
        let function = context
            .functions
            .get(&name)
            .ok_or_else(|| RpcError::FunctionNotFound(name.clone()))?;
        let args = vec![
            json!(event.event_type),
            event.data.clone(),
            json!(event.source),
            json!(event.id),
            json!(event.timestamp.to_rfc3339()),
        ];
        function.call(&Invocation::new(args, Map::new())).map(|_| ())
    });

    tracing::debug!(event_type = %event_type, callback = %callback, "Event subscription added");
    Ok(Value::Bool(true))
}

fn get_recent_events(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let event_type = inv.opt_str(0, "event_type")?;
    let limit = inv.u64_or(1, "limit", 10)?;
    let events = context
        .events
        .get_history(event_type.as_deref(), usize::try_from(limit).unwrap_or(usize::MAX));
    Ok(serde_json::to_value(events)?)
}

fn get_function_versions(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let name = inv.str_arg(0, "function_name")?;
    Ok(json!({
        "function": name,
        "versions": context.versions.list_versions(&name),
        "latest": context.versions.get_latest_version(&name),
    }))
}

fn discover_services(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let dcc_type = inv.opt_str(0, "dcc_type")?;
    match context.discovery() {
        Some(discovery) => Ok(serde_json::to_value(discovery.get_services(dcc_type.as_deref()))?),
        None => Ok(json!([])),
    }
}

fn start_discovery_listener(context: &Arc<ServerContext>, _: &Invocation) -> Result<Value> {
    let discovery = context
        .discovery()
        .ok_or_else(|| RpcError::Config("Service discovery is not enabled on this server".to_string()))?;
    discovery.start_listener()?;
    Ok(Value::Bool(true))
}

/// Runs `handler` on the task manager and waits for its outcome, so long
/// transfers show up in `list_tasks` with progress.
///
/// A caller that is itself a task runs the handler inline and reports on its
/// own task: a bounded pool may have no free worker for a nested one.
fn run_as_task(context: &ServerContext, name: &str, handler: Handler, inv: &Invocation) -> Result<Value> {
    if inv.progress.is_some() {
        return handler(inv);
    }
    let id = context.tasks.submit(name, handler, Invocation::default())?;
    context.tasks.wait(&id, None)?;
    context.tasks.get_result(&id)
}

fn receive_file(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let package = TransferPackage::from_value(inv.require(0, "transfer_package")?.clone())?;
    let output_dir = inv.opt_str(1, "output_dir")?.map(PathBuf::from);
    tracing::info!(file = %package.file_name, size = package.file_size, "Receiving file");

    let handler: Handler = Arc::new(move |task: &Invocation| {
        let progress = |p: f64, m: &str| task.report_progress(p, m);
        let path = transfer::decode_file(&package, output_dir.as_deref(), None, Some(&progress))?;
        Ok(Value::String(path.to_string_lossy().into_owned()))
    });
    run_as_task(context, "receive_file", handler, inv)
}

fn prepare_file_for_transfer(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let path = PathBuf::from(inv.str_arg(0, "file_path")?);
    let compress = inv.bool_or(1, "compress", true)?;

    let handler: Handler = Arc::new(move |task: &Invocation| {
        let progress = |p: f64, m: &str| task.report_progress(p, m);
        let package = transfer::encode_file(&path, compress, Some(&progress))?;
        Ok(serde_json::to_value(package)?)
    });
    run_as_task(context, "prepare_file_for_transfer", handler, inv)
}

fn receive_file_chunk(context: &Arc<ServerContext>, inv: &Invocation) -> Result<Value> {
    let chunk: TransferChunk = serde_json::from_value(inv.require(0, "chunk")?.clone())
        .map_err(|e| RpcError::FileTransfer(format!("Invalid transfer chunk: {}", e)))?;
    let output_dir = inv.opt_str(1, "output_dir")?.map(PathBuf::from);
    let transfer_id = chunk.transfer_id.clone();

    let StagedChunk {
        finished,
        received,
        total,
    } = context.stage_chunk(chunk)?;

    let path = match finished {
        Some(assembler) => {
            let package = assembler.finish()?;
            let path = transfer::decode_file(&package, output_dir.as_deref(), None, None)?;
            tracing::info!(file = %package.file_name, chunks = total, "Chunked transfer complete");
            Some(path.to_string_lossy().into_owned())
        }
        None => None,
    };

    Ok(json!({
        "transfer_id": transfer_id,
        "complete": path.is_some(),
        "received": received,
        "total": total,
        "path": path,
    }))
}
