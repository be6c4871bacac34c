//! Interactive console.
//!
//! A line-oriented shell over [`Connector`] for poking at a running DCC:
//!
//! ```text
//! (rpc) connect maya maya-1
//! Connected to maya/maya-1
//! (maya/maya-1) call frame_range 1001 end=1100
//! Result: [1001, 1100]
//! ```
//!
//! Words are split like a shell (single and double quotes, backslash
//! escapes). Call arguments are parsed as JSON and fall back to plain
//! strings; `key=value` words become keyword arguments.

use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use dccrpc_client::{Connector, Target};
use dccrpc_server::TaskInfo;
use serde_json::{json, Map, Value};

use crate::{render_tasks, render_value, OutputFormat};

const NOT_CONNECTED: &str = "Not connected to any DCC. Use 'connect' first.";
const PROGRESS_POLL: Duration = Duration::from_millis(500);
const BAR_WIDTH: usize = 20;

const HELP: &str = "\
Commands:
  connect <dcc_type> [instance_name]   select the DCC instance to talk to
  disconnect                           forget the current instance
  list                                 registered DCC instances
  functions [--verbose]                functions registered on the instance
  describe <name>                      signature and parameters of a function
  call <name> [args..] [key=value..]   call a function
  tasks                                background tasks on the instance
  progress <task_id>                   follow a task until it settles
  format [plain|json]                  show or set the output format
  exit | quit                          leave the console";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect {
        dcc_type: String,
        instance_name: Option<String>,
    },
    Disconnect,
    List,
    Functions {
        verbose: bool,
    },
    Describe(String),
    Call {
        function: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    /// `None` shows the current format.
    Format(Option<OutputFormat>),
    Tasks,
    Progress(String),
    Help,
    Exit,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let words = split_words(line)?;
    let Some((head, rest)) = words.split_first() else {
        return Ok(None);
    };

    let command = match head.as_str() {
        "connect" => {
            let dcc_type = rest.first().ok_or_else(|| anyhow!("DCC type is required"))?;
            ConsoleCommand::Connect {
                dcc_type: dcc_type.clone(),
                instance_name: rest.get(1).cloned(),
            }
        }
        "disconnect" => ConsoleCommand::Disconnect,
        "list" => ConsoleCommand::List,
        "functions" => ConsoleCommand::Functions {
            verbose: rest.iter().any(|w| w == "--verbose" || w == "-v"),
        },
        "describe" => ConsoleCommand::Describe(
            rest.first().cloned().ok_or_else(|| anyhow!("Function name is required"))?,
        ),
        "call" => {
            let (function, words) = rest.split_first().ok_or_else(|| anyhow!("Function name is required"))?;
            let mut args = Vec::new();
            let mut kwargs = Map::new();
            for word in words {
                match word.split_once('=') {
                    Some((key, value)) if is_identifier(key) => {
                        kwargs.insert(key.to_string(), parse_word(value));
                    }
                    _ => args.push(parse_word(word)),
                }
            }
            ConsoleCommand::Call {
                function: function.clone(),
                args,
                kwargs,
            }
        }
        "format" => match rest.first() {
            None => ConsoleCommand::Format(None),
            Some(raw) => ConsoleCommand::Format(Some(
                raw.parse::<OutputFormat>()
                    .map_err(|_| anyhow!("Format must be one of: plain, json"))?,
            )),
        },
        "tasks" => ConsoleCommand::Tasks,
        "progress" => ConsoleCommand::Progress(
            rest.first().cloned().ok_or_else(|| anyhow!("Task ID is required"))?,
        ),
        "help" | "?" => ConsoleCommand::Help,
        "exit" | "quit" => ConsoleCommand::Exit,
        other => bail!("Unknown command '{}'. Type 'help' for a list of commands.", other),
    };
    Ok(Some(command))
}

/// Splits a line into words, honoring quotes and backslash escapes.
fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                let escaped = chars.next().ok_or_else(|| anyhow!("Trailing backslash"))?;
                current.push(escaped);
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        bail!("Unterminated quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn parse_word(word: &str) -> Value {
    serde_json::from_str(word).unwrap_or_else(|_| Value::String(word.to_string()))
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Whether the loop keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Console<W: Write> {
    connector: Connector,
    dcc_type: Option<String>,
    instance_name: Option<String>,
    format: OutputFormat,
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(connector: Connector, format: OutputFormat, out: W) -> Self {
        Self {
            connector,
            dcc_type: None,
            instance_name: None,
            format,
            out,
        }
    }

    /// Starts already pointed at an instance, without checking the registry.
    pub fn with_target(mut self, dcc_type: impl Into<String>, instance_name: Option<String>) -> Self {
        self.dcc_type = Some(dcc_type.into());
        self.instance_name = instance_name;
        self
    }

    pub fn prompt(&self) -> String {
        match (&self.dcc_type, &self.instance_name) {
            (Some(dcc), Some(name)) => format!("({}/{}) ", dcc, name),
            (Some(dcc), None) => format!("({}) ", dcc),
            _ => "(rpc) ".to_string(),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Reads commands until `exit` or end of input.
    pub fn run<R: BufRead>(&mut self, input: R) -> Result<()> {
        writeln!(self.out, "dccrpc console. Type 'help' for a list of commands.")?;
        let mut lines = input.lines();
        loop {
            write!(self.out, "{}", self.prompt())?;
            self.out.flush()?;

            let Some(line) = lines.next().transpose()? else {
                writeln!(self.out)?;
                break;
            };
            if self.execute_line(&line)? == Flow::Exit {
                break;
            }
        }
        writeln!(self.out, "Goodbye!")?;
        Ok(())
    }

    /// Runs one line. Command failures are printed and do not stop the console;
    /// only output errors are returned.
    pub fn execute_line(&mut self, line: &str) -> Result<Flow> {
        let command = match parse_command(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                writeln!(self.out, "Error: {}", e)?;
                return Ok(Flow::Continue);
            }
        };
        if command == ConsoleCommand::Exit {
            return Ok(Flow::Exit);
        }
        if let Err(e) = self.execute(command) {
            writeln!(self.out, "Error: {}", e)?;
        }
        Ok(Flow::Continue)
    }

    fn execute(&mut self, command: ConsoleCommand) -> Result<()> {
        match command {
            ConsoleCommand::Connect {
                dcc_type,
                instance_name,
            } => self.connect(dcc_type, instance_name),
            ConsoleCommand::Disconnect => {
                self.dcc_type = None;
                self.instance_name = None;
                writeln!(self.out, "Disconnected")?;
                Ok(())
            }
            ConsoleCommand::List => self.list(),
            ConsoleCommand::Functions { verbose } => self.functions(verbose),
            ConsoleCommand::Describe(name) => self.describe(&name),
            ConsoleCommand::Call {
                function,
                args,
                kwargs,
            } => {
                let target = self.target()?;
                let result = self.connector.call_remote_function(&target, &function, args, kwargs)?;
                writeln!(self.out, "Result: {}", render_value(&result, self.format))?;
                Ok(())
            }
            ConsoleCommand::Format(None) => {
                writeln!(self.out, "Current format: {}", format_name(self.format))?;
                Ok(())
            }
            ConsoleCommand::Format(Some(format)) => {
                self.format = format;
                writeln!(self.out, "Output format set to: {}", format_name(format))?;
                Ok(())
            }
            ConsoleCommand::Tasks => {
                let target = self.target()?;
                let value = self.connector.call_remote_function(&target, "list_tasks", vec![], Map::new())?;
                let tasks: Vec<TaskInfo> = serde_json::from_value(value)?;
                writeln!(self.out, "{}", render_tasks(&tasks, self.format))?;
                Ok(())
            }
            ConsoleCommand::Progress(task_id) => self.progress(&task_id),
            ConsoleCommand::Help => {
                writeln!(self.out, "{}", HELP)?;
                Ok(())
            }
            ConsoleCommand::Exit => Ok(()),
        }
    }

    fn target(&self) -> Result<Target> {
        match &self.dcc_type {
            Some(dcc) => Ok(Target::instance(dcc.clone(), self.instance_name.as_deref())),
            None => bail!(NOT_CONNECTED),
        }
    }

    fn connect(&mut self, dcc_type: String, instance_name: Option<String>) -> Result<()> {
        let instances = self.connector.registry().list_instances(Some(dcc_type.as_str()))?;
        if instances.is_empty() {
            bail!("DCC type '{}' not found", dcc_type);
        }
        if let Some(name) = &instance_name {
            if !instances.iter().any(|i| &i.instance_name == name) {
                bail!("Instance '{}' not found for DCC '{}'", name, dcc_type);
            }
        }

        match &instance_name {
            Some(name) => writeln!(self.out, "Connected to {}/{}", dcc_type, name)?,
            None => writeln!(self.out, "Connected to {}", dcc_type)?,
        }
        self.dcc_type = Some(dcc_type);
        self.instance_name = instance_name;
        Ok(())
    }

    fn list(&mut self) -> Result<()> {
        let instances = self.connector.registry().list_instances(None)?;
        if instances.is_empty() {
            writeln!(self.out, "No DCC instances currently registered.")?;
            return Ok(());
        }
        writeln!(self.out, "Registered DCC instances:")?;
        for info in instances {
            writeln!(self.out, " - {}: {}", info.path(), info.uri)?;
        }
        Ok(())
    }

    fn functions(&mut self, verbose: bool) -> Result<()> {
        let target = self.target()?;
        let functions = self.connector.list_remote_functions(&target, verbose)?;
        if self.format == OutputFormat::Json {
            writeln!(self.out, "{}", render_value(&functions, self.format))?;
            return Ok(());
        }

        let entries = functions.as_array().cloned().unwrap_or_default();
        writeln!(self.out, "Registered functions ({}):", entries.len())?;
        for entry in &entries {
            match entry {
                Value::String(name) => writeln!(self.out, " - {}", name)?,
                record => {
                    writeln!(self.out, " - {}", record["signature"].as_str().unwrap_or_default())?;
                    match record["doc"].as_str() {
                        Some(doc) if !doc.is_empty() => writeln!(self.out, "     {}", doc)?,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn describe(&mut self, name: &str) -> Result<()> {
        let target = self.target()?;
        let info = self.connector.describe_remote_function(&target, name)?;
        if self.format == OutputFormat::Json {
            writeln!(self.out, "{}", render_value(&info, self.format))?;
            return Ok(());
        }
        if info["found"] != Value::Bool(true) {
            writeln!(self.out, "Function '{}' not found.", name)?;
            return Ok(());
        }

        writeln!(self.out, "{}", info["signature"].as_str().unwrap_or(name))?;
        if let Some(doc) = info["doc"].as_str().filter(|d| !d.is_empty()) {
            writeln!(self.out, "\n{}", doc)?;
        }
        if let Some(params) = info["args"].as_array().filter(|p| !p.is_empty()) {
            writeln!(self.out, "\nArguments:")?;
            for param in params {
                let mut line = format!(" - {}", param["name"].as_str().unwrap_or_default());
                if let Some(ty) = param["type"].as_str() {
                    line.push_str(&format!(" ({})", ty));
                }
                if !param["default"].is_null() {
                    line.push_str(&format!(" = {}", param["default"]));
                }
                writeln!(self.out, "{}", line)?;
            }
        }
        if let Some(ret) = info["return_type"].as_str() {
            writeln!(self.out, "\nReturns: {}", ret)?;
        }
        Ok(())
    }

    fn progress(&mut self, task_id: &str) -> Result<()> {
        let target = self.target()?;
        writeln!(self.out, "Monitoring progress of task {}...", task_id)?;
        loop {
            let status = self.connector.task_status(&target, task_id)?;
            let report =
                self.connector
                    .call_remote_function(&target, "get_task_progress", vec![json!(task_id)], Map::new())?;
            let fraction = report["progress"].as_f64().unwrap_or(0.0);
            let message = report["message"].as_str().unwrap_or_default();
            write!(self.out, "\r{} - {} - {}", progress_bar(fraction), status, message)?;
            self.out.flush()?;

            match status.as_str() {
                "done" => {
                    writeln!(self.out)?;
                    let result = self.connector.call_remote_function(
                        &target,
                        "get_task_result",
                        vec![json!(task_id)],
                        Map::new(),
                    )?;
                    writeln!(self.out, "Result: {}", render_value(&result, self.format))?;
                    return Ok(());
                }
                "failed" | "canceled" => {
                    writeln!(self.out)?;
                    return Ok(());
                }
                _ => thread::sleep(PROGRESS_POLL),
            }
        }
    }
}

fn format_name(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Plain => "plain",
        OutputFormat::Json => "json",
    }
}

/// `[==========          ]  50%`
fn progress_bar(fraction: f64) -> String {
    let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
    let filled = (fraction * BAR_WIDTH as f64) as usize;
    format!(
        "[{}{}] {:>3.0}%",
        "=".repeat(filled),
        " ".repeat(BAR_WIDTH - filled),
        fraction * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dccrpc_client::ClientOptions;
    use dccrpc_instances::InstanceRegistry;
    use tempfile::TempDir;

    fn console(dir: &TempDir) -> Console<Vec<u8>> {
        let registry = Arc::new(InstanceRegistry::new(dir.path().join("instances.json")));
        Console::new(Connector::new(registry, ClientOptions::default()), OutputFormat::Plain, Vec::new())
    }

    fn output(console: Console<Vec<u8>>) -> String {
        String::from_utf8(console.into_output()).unwrap()
    }

    #[test]
    fn test_parse_call_splits_args_and_kwargs() {
        let command = parse_command(r#"call bake 1001 "shot cam" '[1, 2]' end=1100 name=hero --x=1"#)
            .unwrap()
            .unwrap();
        match command {
            ConsoleCommand::Call {
                function,
                args,
                kwargs,
            } => {
                assert_eq!(function, "bake");
                assert_eq!(args, vec![json!(1001), json!("shot cam"), json!([1, 2]), json!("--x=1")]);
                assert_eq!(kwargs["end"], json!(1100));
                assert_eq!(kwargs["name"], json!("hero"));
                assert_eq!(kwargs.len(), 2);
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(
            parse_command("connect maya maya-1").unwrap(),
            Some(ConsoleCommand::Connect {
                dcc_type: "maya".to_string(),
                instance_name: Some("maya-1".to_string()),
            })
        );
        assert_eq!(
            parse_command("functions --verbose").unwrap(),
            Some(ConsoleCommand::Functions { verbose: true })
        );
        assert_eq!(
            parse_command("format JSON").unwrap(),
            Some(ConsoleCommand::Format(Some(OutputFormat::Json)))
        );
        assert_eq!(parse_command("format").unwrap(), Some(ConsoleCommand::Format(None)));
        assert_eq!(
            parse_command("progress 7f3a").unwrap(),
            Some(ConsoleCommand::Progress("7f3a".to_string()))
        );
        assert_eq!(parse_command("quit").unwrap(), Some(ConsoleCommand::Exit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("connect").is_err());
        assert!(parse_command("call").is_err());
        assert!(parse_command("describe").is_err());
        assert!(parse_command("format yaml").is_err());
        assert!(parse_command("call bake \"unclosed").is_err());
        assert!(parse_command("teleport maya").is_err());
    }

    #[test]
    fn test_split_words_quotes_and_escapes() {
        assert_eq!(
            split_words(r#"call a\ b "c \"d\"" 'e\f'"#).unwrap(),
            vec!["call", "a b", "c \"d\"", "e\\f"]
        );
        assert_eq!(split_words("x ''").unwrap(), vec!["x", ""]);
        assert!(split_words("tail\\").is_err());
    }

    #[test]
    fn test_commands_need_a_connection() {
        let dir = TempDir::new().unwrap();
        let mut console = console(&dir);
        for line in ["call bake", "functions", "tasks", "describe bake", "progress 1"] {
            assert_eq!(console.execute_line(line).unwrap(), Flow::Continue);
        }
        let out = output(console);
        assert_eq!(out.matches("Error: Not connected to any DCC").count(), 5);
    }

    #[test]
    fn test_connect_checks_the_registry() {
        let dir = TempDir::new().unwrap();
        let mut console = console(&dir);
        console.execute_line("connect maya").unwrap();
        console.execute_line("list").unwrap();
        assert_eq!(console.prompt(), "(rpc) ");

        let out = output(console);
        assert!(out.contains("Error: DCC type 'maya' not found"));
        assert!(out.contains("No DCC instances currently registered."));
    }

    #[test]
    fn test_format_and_disconnect() {
        let dir = TempDir::new().unwrap();
        let mut console = console(&dir).with_target("nuke", Some("comp".to_string()));
        assert_eq!(console.prompt(), "(nuke/comp) ");

        console.execute_line("format json").unwrap();
        assert_eq!(console.format(), OutputFormat::Json);
        console.execute_line("disconnect").unwrap();
        assert_eq!(console.prompt(), "(rpc) ");
        assert_eq!(console.execute_line("exit").unwrap(), Flow::Exit);

        let out = output(console);
        assert!(out.contains("Output format set to: json"));
        assert!(out.contains("Disconnected"));
    }

    #[test]
    fn test_run_stops_at_end_of_input() {
        let dir = TempDir::new().unwrap();
        let mut console = console(&dir);
        console.run("format\nbogus\n".as_bytes()).unwrap();

        let out = output(console);
        assert!(out.contains("Current format: plain"));
        assert!(out.contains("Error: Unknown command 'bogus'"));
        assert!(out.trim_end().ends_with("Goodbye!"));
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0.5), format!("[{}{}]  50%", "=".repeat(10), " ".repeat(10)));
        assert_eq!(progress_bar(2.0), format!("[{}] 100%", "=".repeat(20)));
        assert_eq!(progress_bar(f64::NAN), format!("[{}]   0%", " ".repeat(20)));
    }
}
