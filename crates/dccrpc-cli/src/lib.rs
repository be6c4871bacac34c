//! # dccrpc CLI
//!
//! Command-line interface for dccrpc servers.
//!
//! - **Servers**: `dccrpc start` hosts a server, optionally with functions
//!   loaded from a JavaScript file
//! - **Registry**: `list`, `status`, `unregister`, `clean`
//! - **Calls**: `call`, `list-functions`, `describe`, `register`, `tasks`, `file`
//! - **Discovery and auth**: `discover`, `token`
//! - **Interactive**: `console` opens a line-oriented shell (see [`console`])
//!
//! This library holds the argument parsing helpers and output rendering used
//! by the `dccrpc` binary.

pub mod console;

use std::fmt::Write as _;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use dccrpc_client::Target;
use dccrpc_instances::{InstanceInfo, InstanceStatus, ServiceRecord};
use dccrpc_server::TaskInfo;
use serde_json::{Map, Value};

/// How command results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(OutputFormat::Plain),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}', expected plain or json", other)),
        }
    }
}

/// Parses a call target.
///
/// Anything containing `://` is a URI; otherwise `dcc_type[/instance_name]`
/// is looked up in the instance registry.
pub fn parse_target(raw: &str) -> Result<Target> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("target must not be empty");
    }
    if raw.contains("://") {
        return Ok(Target::uri(raw));
    }
    match raw.split_once('/') {
        Some((dcc, _)) if dcc.is_empty() => bail!("invalid target '{}': missing DCC type", raw),
        Some((dcc, name)) if !name.is_empty() => Ok(Target::instance(dcc, Some(name))),
        Some((dcc, _)) => Ok(Target::instance(dcc, None)),
        None => Ok(Target::instance(raw, None)),
    }
}

/// Positional arguments given as JSON. A non-array value is a single argument.
pub fn parse_args(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str(raw).map_err(|e| anyhow!("invalid JSON in args: {}", e))? {
        Value::Array(items) => Ok(items),
        value => Ok(vec![value]),
    }
}

/// Keyword arguments given as a JSON object.
pub fn parse_kwargs(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).map_err(|e| anyhow!("invalid JSON in kwargs: {}", e))? {
        Value::Object(map) => Ok(map),
        other => bail!("kwargs must be a JSON object, got {}", other),
    }
}

/// Strings print bare in plain mode; everything else is pretty JSON.
pub fn render_value(value: &Value, format: OutputFormat) -> String {
    match (format, value) {
        (OutputFormat::Plain, Value::String(s)) => s.clone(),
        (OutputFormat::Plain, Value::Null) => String::new(),
        _ => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
    }
}

pub fn render_instances(instances: &[InstanceInfo], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return to_json(instances);
    }
    if instances.is_empty() {
        return "No registered instances".to_string();
    }

    let mut out = String::new();
    for info in instances {
        let _ = writeln!(
            out,
            "{:<28} {:<32} {}",
            info.path(),
            info.uri,
            info.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
        );
    }
    out.trim_end().to_string()
}

pub fn render_status(statuses: &[InstanceStatus], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return to_json(statuses);
    }
    if statuses.is_empty() {
        return "No registered instances".to_string();
    }

    let mut out = String::new();
    for status in statuses {
        let state = if status.alive { "alive" } else { "offline" };
        let _ = writeln!(
            out,
            "{:<28} {:<8} {:>6}s  {}",
            status.info.path(),
            state,
            status.age_secs,
            status.info.uri
        );
    }
    out.trim_end().to_string()
}

pub fn render_tasks(tasks: &[TaskInfo], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return to_json(tasks);
    }
    if tasks.is_empty() {
        return "No tasks".to_string();
    }

    let mut out = String::new();
    for task in tasks {
        let _ = write!(
            out,
            "{}  {:<10} {:>5.1}%  {}",
            task.id,
            task.status.as_str(),
            task.progress * 100.0,
            task.function_name
        );
        if let Some(error) = &task.error {
            let _ = write!(out, "  [{}: {}]", error.kind, error.message);
        } else if !task.message.is_empty() {
            let _ = write!(out, "  {}", task.message);
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub fn render_services(services: &[ServiceRecord], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return to_json(services);
    }
    if services.is_empty() {
        return "No services found".to_string();
    }

    let mut out = String::new();
    for service in services {
        let _ = writeln!(
            out,
            "{}/{:<24} {:<32} {}",
            service.dcc_type, service.instance_name, service.uri, service.hostname
        );
    }
    out.trim_end().to_string()
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}
