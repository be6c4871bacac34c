use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::registry::InstanceRegistry;

/// Background thread refreshing one instance's heartbeat on an interval.
///
/// Stops when [`HeartbeatTask::stop`] is called or the task is dropped.
pub struct HeartbeatTask {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatTask {
    pub fn start(
        registry: Arc<InstanceRegistry>,
        dcc_type: String,
        instance_name: String,
        interval: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(format!("dccrpc-heartbeat-{}", instance_name))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        match registry.update_heartbeat(&dcc_type, &instance_name) {
                            Ok(true) => {}
                            Ok(false) => {
                                // Removed by a cleanup elsewhere; the server is still alive
                                tracing::warn!(instance = %instance_name, "Instance missing from registry during heartbeat");
                            }
                            Err(e) => {
                                tracing::warn!(instance = %instance_name, error = %e, "Heartbeat update failed");
                            }
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn heartbeat thread");
                None
            }
        };

        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_heartbeat_refreshes_entry() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(InstanceRegistry::new(dir.path().join("registry.json")));
        let name = registry.register("maya", "dccrpc://h:1", None).unwrap();
        let before = registry.list_instances(None).unwrap()[0].last_heartbeat;

        let task = HeartbeatTask::start(registry.clone(), "maya".into(), name, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(120));
        task.stop();

        let after = registry.list_instances(None).unwrap()[0].last_heartbeat;
        assert!(after > before);
    }
}
