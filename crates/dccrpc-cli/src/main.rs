//! # dccrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Host a server with functions from a script
//! dccrpc start maya --name maya-1 --script tools.js --function frame_range
//!
//! # Inspect the instance registry
//! dccrpc list
//! dccrpc status --max-age 90
//!
//! # Call a function (prints JSON with --format json)
//! dccrpc call maya/maya-1 frame_range
//! dccrpc call dccrpc://farm-04:7001 bake --args '[1001, 1100]' --kwargs '{"camera": "shotCam"}'
//!
//! # Background tasks and files
//! dccrpc tasks list maya
//! dccrpc file send maya ./cache.abc --remote-dir /tmp/incoming
//!
//! # Interactive shell
//! dccrpc console maya/maya-1
//! ```
//!
//! ## Targets
//!
//! A target is either a URI (`dccrpc://host:port`) or `dcc_type[/instance_name]`
//! resolved through the instance registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use argh::FromArgs;
use dccrpc_cli::console::Console;
use dccrpc_cli::{
    parse_args, parse_kwargs, parse_target, render_instances, render_services, render_status, render_tasks,
    render_value, OutputFormat,
};
use dccrpc_client::{ClientOptions, Connector, Target};
use dccrpc_common::config::{ConfigManager, Settings};
use dccrpc_common::security::{TokenAuthority, ENV_SECRET};
use dccrpc_common::VERSION_KWARG;
use dccrpc_instances::{DiscoveryConfig, InstanceRegistry, ServiceDiscovery, TcpProbe};
use dccrpc_server::{
    FunctionSpec, RpcServer, ScriptEnv, ScriptFunction, ServerContext, ServerHandle, ServerOptions, TaskInfo,
};
use serde_json::{json, Map, Value};

#[derive(FromArgs)]
/// dccrpc - remote procedure calls into DCC applications
struct Cli {
    /// config file to use instead of the per-user one
    #[argh(option)]
    config: Option<PathBuf>,

    /// instance registry file to use instead of the per-user one
    #[argh(option)]
    registry: Option<PathBuf>,

    /// output format: plain or json
    #[argh(option, default = "OutputFormat::Plain")]
    format: OutputFormat,

    /// auth token sent with every call
    #[argh(option)]
    token: Option<String>,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Start(StartArgs),
    List(ListArgs),
    Unregister(UnregisterArgs),
    Clean(CleanArgs),
    Status(StatusArgs),
    Call(CallArgs),
    ListFunctions(ListFunctionsArgs),
    Describe(DescribeArgs),
    Register(RegisterArgs),
    Tasks(TasksArgs),
    File(FileArgs),
    Discover(DiscoverArgs),
    Token(TokenArgs),
    Console(ConsoleArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "start")]
/// start a server and block until it is stopped
struct StartArgs {
    /// type of DCC the server registers under, e.g. maya
    #[argh(positional)]
    dcc_type: String,

    /// instance name; generated when omitted
    #[argh(option, short = 'n')]
    name: Option<String>,

    /// host to bind to (config default when omitted)
    #[argh(option)]
    host: Option<String>,

    /// port to bind to, 0 for any (config default when omitted)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// script file defining functions to serve
    #[argh(option, short = 's')]
    script: Option<PathBuf>,

    /// name of a function from --script to register (repeatable)
    #[argh(option, short = 'f', long = "function")]
    functions: Vec<String>,

    /// announce the server over multicast discovery
    #[argh(switch)]
    announce: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// list registered instances
struct ListArgs {
    /// only instances of this DCC type
    #[argh(positional)]
    dcc_type: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "unregister")]
/// remove an instance from the registry
struct UnregisterArgs {
    /// type of DCC
    #[argh(positional)]
    dcc_type: String,

    /// instance to remove
    #[argh(positional)]
    instance_name: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "clean")]
/// remove unreachable instances from the registry
struct CleanArgs {
    /// probe timeout in milliseconds
    #[argh(option, default = "2000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// show instances with their heartbeat age
struct StatusArgs {
    /// seconds after which an instance counts as offline
    #[argh(option, default = "90")]
    max_age: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a function on a server
struct CallArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// function to call
    #[argh(positional)]
    function: String,

    /// positional arguments as a JSON array
    #[argh(option, short = 'a')]
    args: Option<String>,

    /// keyword arguments as a JSON object
    #[argh(option, short = 'k')]
    kwargs: Option<String>,

    /// function version to call (MAJOR.MINOR.PATCH)
    #[argh(option)]
    version: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list-functions")]
/// list the functions a server exposes
struct ListFunctionsArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// include signatures and docs
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "describe")]
/// describe one function on a server
struct DescribeArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// function name
    #[argh(positional)]
    function: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "register")]
/// register a function from a JavaScript file on a running server
struct RegisterArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// name of the function defined in the file
    #[argh(positional)]
    function: String,

    /// script file to upload
    #[argh(positional)]
    file: PathBuf,

    /// extra globals for the script as a JSON object
    #[argh(option)]
    globals: Option<String>,

    /// dependency paths exposed to the script (repeatable)
    #[argh(option)]
    path: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "tasks")]
/// inspect and cancel background tasks
struct TasksArgs {
    #[argh(subcommand)]
    command: TaskCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum TaskCommands {
    List(TaskListArgs),
    Get(TaskGetArgs),
    Cancel(TaskCancelArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// list tasks on a server
struct TaskListArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
/// show a task, or its result with --result
struct TaskGetArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// task id
    #[argh(positional)]
    task_id: String,

    /// fetch the result instead of the status
    #[argh(switch)]
    result: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "cancel")]
/// cancel a task that has not started yet
struct TaskCancelArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// task id
    #[argh(positional)]
    task_id: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "file")]
/// move files to and from a server
struct FileArgs {
    #[argh(subcommand)]
    command: FileCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum FileCommands {
    Send(FileSendArgs),
    Get(FileGetArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "send")]
/// send a local file to a server
struct FileSendArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// local file to send
    #[argh(positional)]
    path: PathBuf,

    /// directory on the server to write to
    #[argh(option)]
    remote_dir: Option<String>,

    /// send the file uncompressed
    #[argh(switch)]
    no_compress: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
/// fetch a file from a server
struct FileGetArgs {
    /// server URI or dcc_type[/instance_name]
    #[argh(positional)]
    target: String,

    /// path of the file on the server
    #[argh(positional)]
    remote_path: String,

    /// local directory to write to
    #[argh(option, short = 'o')]
    output_dir: Option<PathBuf>,

    /// exact local file to write
    #[argh(option)]
    output_file: Option<PathBuf>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "discover")]
/// listen for server announcements
struct DiscoverArgs {
    /// only services of this DCC type
    #[argh(positional)]
    dcc_type: Option<String>,

    /// seconds to listen
    #[argh(option, default = "5")]
    wait: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "token")]
/// issue an auth token signed with the secret in TP_DCC_RPC_SECRET
struct TokenArgs {
    /// who the token is for
    #[argh(option, default = "String::from(\"cli\")")]
    subject: String,

    /// lifetime in minutes
    #[argh(option, default = "60")]
    ttl_minutes: i64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "console")]
/// open an interactive console
struct ConsoleArgs {
    /// instance to start connected to, as dcc_type[/instance_name]
    #[argh(positional)]
    target: Option<String>,
}

struct App {
    settings: Settings,
    registry: Arc<InstanceRegistry>,
    format: OutputFormat,
    token: Option<String>,
}

impl App {
    fn connector(&self) -> Connector {
        let mut options = ClientOptions::from_settings(&self.settings);
        options.auth_token = self.token.clone();
        Connector::new(self.registry.clone(), options)
    }

    fn print_value(&self, value: &Value) {
        println!("{}", render_value(value, self.format));
    }
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default to INFO for servers and WARN elsewhere so results stay pipeable
    let default_level = if matches!(cli.command, Commands::Start(_)) { "info" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => ConfigManager::load(path.clone())?,
        None => ConfigManager::load_default()?,
    };
    let settings = config.settings()?;
    let registry = match &cli.registry {
        Some(path) => InstanceRegistry::new(path.clone()),
        None => InstanceRegistry::open_default()?,
    };

    let app = App {
        settings,
        registry: Arc::new(registry),
        format: cli.format,
        token: cli.token.or_else(|| std::env::var("TP_DCC_RPC_TOKEN").ok()),
    };

    match cli.command {
        Commands::Start(args) => run_start(&app, args),
        Commands::List(args) => {
            let instances = app.registry.list_instances(args.dcc_type.as_deref())?;
            println!("{}", render_instances(&instances, app.format));
            Ok(())
        }
        Commands::Unregister(args) => {
            if app.registry.unregister(&args.dcc_type, &args.instance_name)? {
                println!("Unregistered {}/{}", args.dcc_type, args.instance_name);
                Ok(())
            } else {
                bail!("No instance {}/{} in the registry", args.dcc_type, args.instance_name)
            }
        }
        Commands::Clean(args) => {
            let removed = app.registry.cleanup(&TcpProbe::new(Duration::from_millis(args.timeout_ms)))?;
            match app.format {
                OutputFormat::Json => app.print_value(&json!(removed)),
                OutputFormat::Plain if removed.is_empty() => println!("Nothing to clean"),
                OutputFormat::Plain => removed.iter().for_each(|path| println!("Removed {}", path)),
            }
            Ok(())
        }
        Commands::Status(args) => {
            let statuses = app.registry.status(Duration::from_secs(args.max_age))?;
            println!("{}", render_status(&statuses, app.format));
            Ok(())
        }
        Commands::Call(args) => run_call(&app, args),
        Commands::ListFunctions(args) => {
            let functions = app
                .connector()
                .list_remote_functions(&parse_target(&args.target)?, args.verbose)?;
            app.print_value(&functions);
            Ok(())
        }
        Commands::Describe(args) => {
            let described = app
                .connector()
                .describe_remote_function(&parse_target(&args.target)?, &args.function)?;
            app.print_value(&described);
            Ok(())
        }
        Commands::Register(args) => run_register(&app, args),
        Commands::Tasks(args) => run_tasks(&app, args.command),
        Commands::File(args) => run_file(&app, args.command),
        Commands::Discover(args) => run_discover(&app, args),
        Commands::Console(args) => run_console(&app, args),
        Commands::Token(args) => {
            let authority = TokenAuthority::from_env()
                .ok_or_else(|| anyhow!("{} is not set", ENV_SECRET))?;
            let token = authority.issue(&args.subject, chrono::Duration::minutes(args.ttl_minutes))?;
            println!("{}", token);
            Ok(())
        }
    }
}

fn run_start(app: &App, args: StartArgs) -> Result<()> {
    let mut context = ServerContext::from_settings(&app.settings);
    if args.announce || app.settings.discovery.enabled {
        let config = DiscoveryConfig::from_settings(&app.settings.discovery)?;
        context = context.with_discovery(ServiceDiscovery::new(config, Some(app.registry.clone())));
    }
    let context = context.into_shared();

    if let Some(script) = &args.script {
        let source = std::fs::read_to_string(script)
            .with_context(|| format!("Failed to read script {}", script.display()))?;
        if args.functions.is_empty() {
            bail!("--script needs at least one --function to register");
        }
        let env = ScriptEnv {
            globals: context.globals().clone(),
            dcc_type: Some(args.dcc_type.clone()),
            instance_name: args.name.clone(),
            ..ScriptEnv::default()
        };
        for name in &args.functions {
            let function = ScriptFunction::compile(name, &source, env.clone(), context.limits().clone())?;
            context.functions.register_function(
                FunctionSpec::from_handler(name.clone(), function.into_handler())
                    .doc(format!("Defined in {}", script.display()))
                    .category("script"),
            );
        }
        tracing::info!(script = %script.display(), functions = args.functions.len(), "Loaded script functions");
    }

    let mut options = ServerOptions::from_settings(args.dcc_type, &app.settings).with_registry(app.registry.clone());
    options.announce |= args.announce;
    if let Some(name) = args.name {
        options = options.with_instance_name(name);
    }
    if let Some(host) = args.host {
        options = options.with_host(host);
    }
    if let Some(port) = args.port {
        options = options.with_port(port);
    }

    let handle = RpcServer::start(options, context)?;
    println!("{} {}", handle.instance_name(), handle.uri());
    wait_for_stop(&handle)?;
    Ok(())
}

/// Blocks until Ctrl-C or until the server is stopped remotely.
fn wait_for_stop(handle: &ServerHandle) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("Interrupted");
                    break;
                }
                _ = ticker.tick() => {
                    if !handle.is_running() {
                        break;
                    }
                }
            }
        }
    });

    if handle.is_running() {
        handle.shutdown();
    } else {
        handle.wait();
    }
    Ok(())
}

fn run_call(app: &App, args: CallArgs) -> Result<()> {
    let target = parse_target(&args.target)?;
    let positional = parse_args(args.args.as_deref())?;
    let mut kwargs = parse_kwargs(args.kwargs.as_deref())?;
    if let Some(version) = args.version {
        kwargs.insert(VERSION_KWARG.to_string(), Value::String(version));
    }

    let result = app
        .connector()
        .call_remote_function(&target, &args.function, positional, kwargs)?;
    app.print_value(&result);
    Ok(())
}

fn run_register(app: &App, args: RegisterArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let globals = parse_kwargs(args.globals.as_deref())?;

    let response = app.connector().register_function_remotely(
        &parse_target(&args.target)?,
        &args.function,
        &source,
        &args.path,
        globals,
    )?;
    app.print_value(&response);
    Ok(())
}

fn run_console(app: &App, args: ConsoleArgs) -> Result<()> {
    let mut console = Console::new(app.connector(), app.format, std::io::stdout());
    if let Some(raw) = &args.target {
        match parse_target(raw)? {
            Target::Instance {
                dcc_type,
                instance_name,
            } => console = console.with_target(dcc_type, instance_name),
            Target::Uri(uri) => bail!("The console connects through the registry, got URI {}", uri),
        }
    }
    console.run(std::io::stdin().lock())
}

fn run_tasks(app: &App, command: TaskCommands) -> Result<()> {
    let connector = app.connector();
    match command {
        TaskCommands::List(args) => {
            let value = connector.call_remote_function(&parse_target(&args.target)?, "list_tasks", vec![], Map::new())?;
            let tasks: Vec<TaskInfo> = serde_json::from_value(value)?;
            println!("{}", render_tasks(&tasks, app.format));
        }
        TaskCommands::Get(args) => {
            let function = if args.result { "get_task_result" } else { "get_task_status" };
            let value = connector.call_remote_function(
                &parse_target(&args.target)?,
                function,
                vec![json!(args.task_id)],
                Map::new(),
            )?;
            app.print_value(&value);
        }
        TaskCommands::Cancel(args) => {
            let canceled = connector.call_remote_function(
                &parse_target(&args.target)?,
                "cancel_task",
                vec![json!(args.task_id)],
                Map::new(),
            )?;
            if canceled != Value::Bool(true) {
                bail!("Task {} could not be canceled", args.task_id);
            }
            println!("Canceled {}", args.task_id);
        }
    }
    Ok(())
}

fn run_file(app: &App, command: FileCommands) -> Result<()> {
    let connector = app.connector();
    match command {
        FileCommands::Send(args) => {
            let sent = connector.send_file(
                &parse_target(&args.target)?,
                &args.path,
                args.remote_dir.as_deref(),
                !args.no_compress,
            )?;
            app.print_value(&serde_json::to_value(&sent)?);
        }
        FileCommands::Get(args) => {
            let fetched = connector.get_file(
                &parse_target(&args.target)?,
                &args.remote_path,
                args.output_dir.as_deref(),
                args.output_file.as_deref(),
            )?;
            app.print_value(&serde_json::to_value(&fetched)?);
        }
    }
    Ok(())
}

fn run_discover(app: &App, args: DiscoverArgs) -> Result<()> {
    let config = DiscoveryConfig::from_settings(&app.settings.discovery)?;
    let discovery = ServiceDiscovery::new(config, Some(app.registry.clone()));
    discovery.start_listener()?;
    std::thread::sleep(Duration::from_secs(args.wait));

    let services = discovery.get_services(args.dcc_type.as_deref());
    discovery.stop();
    println!("{}", render_services(&services, app.format));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::from_args(&["dccrpc"], args).unwrap()
    }

    #[test]
    fn test_cli_parse_start() {
        let cli = parse(&["start", "maya", "-n", "maya-1", "-s", "tools.js", "-f", "bake", "-f", "export"]);
        match cli.command {
            Commands::Start(StartArgs {
                dcc_type,
                name,
                port,
                script,
                functions,
                announce,
                ..
            }) => {
                assert_eq!(dcc_type, "maya");
                assert_eq!(name.as_deref(), Some("maya-1"));
                assert!(port.is_none());
                assert_eq!(script, Some(PathBuf::from("tools.js")));
                assert_eq!(functions, vec!["bake".to_string(), "export".to_string()]);
                assert!(!announce);
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_parse_call_with_global_options() {
        let cli = parse(&[
            "--format",
            "json",
            "--token",
            "abc",
            "call",
            "maya/maya-1",
            "frame_range",
            "--args",
            "[1]",
            "--version",
            "1.0.0",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.token.as_deref(), Some("abc"));
        match cli.command {
            Commands::Call(CallArgs {
                target,
                function,
                args,
                kwargs,
                version,
            }) => {
                assert_eq!(target, "maya/maya-1");
                assert_eq!(function, "frame_range");
                assert_eq!(args.as_deref(), Some("[1]"));
                assert!(kwargs.is_none());
                assert_eq!(version.as_deref(), Some("1.0.0"));
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_nested_subcommands() {
        let cli = parse(&["tasks", "get", "maya", "1234", "--result"]);
        match cli.command {
            Commands::Tasks(TasksArgs {
                command: TaskCommands::Get(TaskGetArgs { target, task_id, result }),
            }) => {
                assert_eq!(target, "maya");
                assert_eq!(task_id, "1234");
                assert!(result);
            }
            _ => panic!("Expected tasks get"),
        }

        let cli = parse(&["file", "send", "nuke", "plate.exr", "--no-compress"]);
        match cli.command {
            Commands::File(FileArgs {
                command: FileCommands::Send(FileSendArgs { no_compress, remote_dir, .. }),
            }) => {
                assert!(no_compress);
                assert!(remote_dir.is_none());
            }
            _ => panic!("Expected file send"),
        }
    }

    #[test]
    fn test_cli_parse_defaults() {
        let cli = parse(&["status"]);
        assert_eq!(cli.format, OutputFormat::Plain);
        match cli.command {
            Commands::Status(StatusArgs { max_age }) => assert_eq!(max_age, 90),
            _ => panic!("Expected Status command"),
        }

        let cli = parse(&["token"]);
        match cli.command {
            Commands::Token(TokenArgs { subject, ttl_minutes }) => {
                assert_eq!(subject, "cli");
                assert_eq!(ttl_minutes, 60);
            }
            _ => panic!("Expected Token command"),
        }
    }

    #[test]
    fn test_cli_parse_console() {
        match parse(&["console", "maya/maya-1"]).command {
            Commands::Console(ConsoleArgs { target }) => assert_eq!(target.as_deref(), Some("maya/maya-1")),
            _ => panic!("Expected Console command"),
        }
        match parse(&["console"]).command {
            Commands::Console(ConsoleArgs { target }) => assert!(target.is_none()),
            _ => panic!("Expected Console command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::from_args(&["dccrpc"], &["--format", "yaml", "list"]).is_err());
    }
}
