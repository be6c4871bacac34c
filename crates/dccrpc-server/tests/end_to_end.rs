//! Real servers on loopback, driven through the client crate.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use dccrpc_client::{ClientOptions, Connector, RpcClient, Target};
use dccrpc_common::protocol::{BatchResult, CallSpec};
use dccrpc_common::security::{SecurityFlags, TokenAuthority};
use dccrpc_instances::InstanceRegistry;
use dccrpc_server::{FunctionSpec, Invocation, RpcServer, ServerContext, ServerHandle, ServerOptions};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    registry: Arc<InstanceRegistry>,
    context: Arc<ServerContext>,
    server: ServerHandle,
}

impl Fixture {
    fn start(context: ServerContext) -> Self {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(InstanceRegistry::new(dir.path().join("instances.json")));
        let context = context.into_shared();
        let options = ServerOptions::new("maya")
            .with_instance_name("maya-1")
            .with_registry(registry.clone());
        let server = RpcServer::start(options, context.clone()).unwrap();
        Self {
            _dir: dir,
            registry,
            context,
            server,
        }
    }

    fn connector(&self) -> Connector {
        self.connector_with(ClientOptions::default())
    }

    fn connector_with(&self, options: ClientOptions) -> Connector {
        Connector::new(self.registry.clone(), options)
    }

    fn client(&self) -> RpcClient {
        RpcClient::new(self.server.uri(), ClientOptions::default(), None).unwrap()
    }
}

fn target() -> Target {
    Target::instance("maya", Some("maya-1"))
}

fn no_retry() -> ClientOptions {
    ClientOptions {
        retry_enabled: false,
        ..ClientOptions::default()
    }
}

#[test]
fn test_ping_reports_identity() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    let connector = fixture.connector();

    let pong = connector.ping_instance(&target()).unwrap();
    assert_eq!(pong["dcc_type"], json!("maya"));
    assert_eq!(pong["instance_name"], json!("maya-1"));
    assert_eq!(pong["uri"], json!(fixture.server.uri()));

    let functions = connector.list_remote_functions(&target(), false).unwrap();
    assert!(functions.as_array().unwrap().contains(&json!("ping")));

    let methods = fixture.client().list_methods().unwrap();
    assert!(methods.iter().any(|m| m == "submit_task"));
}

#[test]
fn test_batch_and_versions() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    fixture
        .context
        .functions
        .register("double", |inv| Ok(json!(inv.require(0, "x")?.as_i64().unwrap_or(0) * 2)));
    fixture
        .context
        .versions
        .register("export", "1.2.0", Arc::new(|_: &Invocation| Ok(json!("fbx"))))
        .unwrap();
    fixture
        .context
        .versions
        .register("export", "2.0.0", Arc::new(|_: &Invocation| Ok(json!("usd"))))
        .unwrap();

    let client = fixture.client();
    let results = client
        .batch_call(vec![
            CallSpec::new("double").arg(21),
            CallSpec::new("nope"),
            CallSpec::new("export"),
        ])
        .unwrap();
    assert_eq!(results[0], BatchResult::Success { result: json!(42) });
    assert!(!results[1].is_success());
    assert_eq!(results[2], BatchResult::Success { result: json!("usd") });

    let pinned = client.call_versioned("export", "1.2.0", vec![], Map::new()).unwrap();
    assert_eq!(pinned, json!("fbx"));

    let missing = client.call_versioned("export", "3.0.0", vec![], Map::new()).unwrap_err();
    assert_eq!(missing.kind(), "FunctionNotFound");
    assert!(missing.to_string().contains("export@3.0.0"));

    let versions = client.call("get_function_versions", vec![json!("export")], Map::new()).unwrap();
    assert_eq!(versions["versions"], json!(["1.2.0", "2.0.0"]));
    assert_eq!(versions["latest"], json!("2.0.0"));
}

#[test]
fn test_background_task_with_progress() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    fixture.context.functions.register("bake", |inv| {
        let frames = inv.u64_or(0, "frames", 4)?;
        for frame in 1..=frames {
            inv.report_progress(frame as f64 / frames as f64, &format!("frame {}", frame));
        }
        Ok(json!({ "baked": frames }))
    });

    let connector = fixture.connector();
    let id = connector.submit_task(&target(), "bake", vec![json!(8)], Map::new()).unwrap();
    let result = connector
        .wait_task(&target(), &id, Duration::from_millis(20), Duration::from_secs(10))
        .unwrap();
    assert_eq!(result, json!({ "baked": 8 }));

    let progress = connector
        .call_remote_function(&target(), "get_task_progress", vec![json!(id)], Map::new())
        .unwrap();
    assert_eq!(progress["progress"], json!(1.0));

    let events = connector
        .call_remote_function(
            &target(),
            "get_recent_events",
            vec![json!("task_progress"), json!(100)],
            Map::new(),
        )
        .unwrap();
    assert!(!events.as_array().unwrap().is_empty());
}

#[test]
fn test_failed_task_replays_error() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    fixture.context.functions.register("render", |_| {
        Err(dccrpc_common::RpcError::Validation("camera missing".into()))
    });

    let connector = fixture.connector_with(no_retry());
    let id = connector.submit_task(&target(), "render", vec![], Map::new()).unwrap();
    let err = connector
        .wait_task(&target(), &id, Duration::from_millis(20), Duration::from_secs(10))
        .unwrap_err();
    assert_eq!(err.kind(), "Validation");
    assert!(err.to_string().contains("camera missing"));
}

#[test]
fn test_remote_script_registration() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    let connector = fixture.connector();

    let sum = connector
        .remote_call(
            &target(),
            "add",
            "function add(a, b) { return a + b; }",
            vec![json!(2), json!(3)],
            Map::new(),
        )
        .unwrap();
    assert_eq!(sum, json!(5));

    let mut globals = Map::new();
    globals.insert("shot".into(), json!("sh010"));
    connector
        .register_function_remotely(
            &target(),
            "shot_name",
            "function shot_name(suffix) { return shot + '_' + suffix; }",
            &[],
            globals,
        )
        .unwrap();
    let named = connector
        .call_remote_function(&target(), "shot_name", vec![json!("comp")], Map::new())
        .unwrap();
    assert_eq!(named, json!("sh010_comp"));

    let described = connector.describe_remote_function(&target(), "shot_name").unwrap();
    assert_eq!(described["found"], json!(true));
    assert_eq!(described["category"], json!("remote"));

    let broken = connector
        .register_function_remotely(&target(), "broken", "function broken( {", &[], Map::new())
        .unwrap_err();
    assert_eq!(broken.kind(), "Script");
}

#[test]
fn test_remote_control_can_be_disabled() {
    let flags = SecurityFlags {
        remote_control: false,
        ..SecurityFlags::default()
    };
    let fixture = Fixture::start(ServerContext::new(flags));
    let connector = fixture.connector_with(no_retry());

    let err = connector
        .register_function_remotely(&target(), "f", "function f() {}", &[], Map::new())
        .unwrap_err();
    assert_eq!(err.kind(), "PermissionDenied");

    let err = connector.list_remote_functions(&target(), false).unwrap_err();
    assert_eq!(err.kind(), "PermissionDenied");

    // ping stays available
    assert!(connector.ping_instance(&target()).is_ok());
}

#[test]
fn test_encryption_requires_tokens() {
    let authority = TokenAuthority::new("render-farm");
    let token = authority.issue("wrangler", chrono::Duration::minutes(5)).unwrap();
    let flags = SecurityFlags {
        encryption: true,
        ..SecurityFlags::default()
    };
    let fixture = Fixture::start(ServerContext::new(flags).with_auth(authority));

    let anonymous = fixture.connector_with(no_retry());
    assert_eq!(anonymous.ping_instance(&target()).unwrap_err().kind(), "PermissionDenied");

    let trusted = fixture.connector_with(ClientOptions::default().with_auth_token(token.clone()));
    assert_eq!(trusted.ping_instance(&target()).unwrap()["dcc_type"], json!("maya"));

    let client = RpcClient::new(
        fixture.server.uri(),
        ClientOptions::default().with_auth_token(token),
        None,
    )
    .unwrap();
    assert!(client.get_globals().unwrap().is_empty());
}

#[test]
fn test_acl_guarded_function() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    fixture.context.functions.register_function(
        FunctionSpec::new("local_only", |_| Ok(json!("ok"))).acl(["127.0.0.1"]),
    );
    fixture.context.functions.register_function(
        FunctionSpec::new("studio_only", |_| Ok(json!("ok"))).acl(["10.*"]),
    );

    let connector = fixture.connector_with(no_retry());
    assert_eq!(
        connector
            .call_remote_function(&target(), "local_only", vec![], Map::new())
            .unwrap(),
        json!("ok")
    );
    let err = connector
        .call_remote_function(&target(), "studio_only", vec![], Map::new())
        .unwrap_err();
    assert_eq!(err.kind(), "PermissionDenied");
}

#[test]
fn test_file_round_trip() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let back = TempDir::new().unwrap();

    let source = local.path().join("cache.abc");
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(&source, &payload).unwrap();

    let connector = fixture.connector();
    let sent = connector
        .send_file(&target(), &source, remote.path().to_str(), true)
        .unwrap();
    assert!(sent.success);
    assert_eq!(sent.file_size, payload.len() as u64);
    assert_eq!(fs::read(&sent.remote_path).unwrap(), payload);

    let fetched = connector
        .get_file(&target(), &sent.remote_path, Some(back.path()), None)
        .unwrap();
    assert_eq!(fetched.file_hash, sent.file_hash);
    assert_eq!(fs::read(&fetched.local_path).unwrap(), payload);
}

#[test]
fn test_chunked_file_transfer() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();

    let source = local.path().join("plate.exr");
    let payload: Vec<u8> = (0..9_000u32).map(|i| (i * 7 % 256) as u8).collect();
    fs::write(&source, &payload).unwrap();

    let connector = fixture.connector().with_chunk_size(1024);
    let sent = connector
        .send_file(&target(), &source, remote.path().to_str(), false)
        .unwrap();
    assert_eq!(fs::read(&sent.remote_path).unwrap(), payload);
    assert_eq!(fixture.context.transfers_in_flight(), 0);
}

#[test]
fn test_stop_rpc_server_unregisters() {
    let fixture = Fixture::start(ServerContext::new(SecurityFlags::default()));
    let connector = fixture.connector_with(no_retry());

    let message = connector
        .call_remote_function(&target(), "stop_rpc_server", vec![], Map::new())
        .unwrap();
    assert_eq!(message, Value::String("[tp-rpc] Shutdown signal sent.".into()));

    fixture.server.wait();
    assert!(!fixture.server.is_running());
    assert!(fixture.registry.get_uri("maya", Some("maya-1")).unwrap().is_none());
    assert!(connector.ping_instance(&target()).is_err());
}
