//! Registry cleanup against real sockets.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use dccrpc_common::protocol::{Request, Response};
use dccrpc_common::transport::{TcpServer, WireOptions};
use dccrpc_instances::{InstanceRegistry, TcpProbe};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

fn spawn_server() -> (u16, watch::Sender<bool>, thread::JoinHandle<()>) {
    let (port_tx, port_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let server = TcpServer::bind("127.0.0.1:0", WireOptions::default()).await.unwrap();
            port_tx.send(server.local_addr().unwrap().port()).unwrap();
            server
                .run_until(
                    |request: Request, _peer: SocketAddr| async move {
                        Response::ok(request.id, json!(["call", "batch_call"]))
                    },
                    stop_rx,
                )
                .await
                .unwrap();
        });
    });

    (port_rx.recv().unwrap(), stop_tx, handle)
}

fn closed_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn cleanup_removes_instance_with_nothing_listening() {
    let dir = TempDir::new().unwrap();
    let registry = InstanceRegistry::new(dir.path().join("registry.json"));
    let (port, stop, handle) = spawn_server();

    let live = registry
        .register("maya", &format!("dccrpc://127.0.0.1:{}", port), None)
        .unwrap();
    let dead = registry
        .register("maya", &format!("dccrpc://127.0.0.1:{}", closed_port()), None)
        .unwrap();

    let removed = registry
        .cleanup(&TcpProbe::new(Duration::from_millis(500)))
        .unwrap();
    assert_eq!(removed, vec![format!("maya/{}", dead)]);

    let remaining = registry.list_instances(None).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].instance_name, live);

    stop.send(true).unwrap();
    handle.join().unwrap();
}

#[test]
fn concurrent_registrations_get_distinct_names() {
    let dir = TempDir::new().unwrap();
    let registry = std::sync::Arc::new(InstanceRegistry::new(dir.path().join("registry.json")));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            thread::spawn(move || {
                registry
                    .register("houdini", &format!("dccrpc://127.0.0.1:{}", 7000 + i), None)
                    .unwrap()
            })
        })
        .collect();

    let mut names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 8);
    assert_eq!(registry.list_instances(Some("houdini")).unwrap().len(), 8);
}
