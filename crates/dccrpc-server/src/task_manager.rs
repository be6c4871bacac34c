//! Background execution of registered functions.
//!
//! A task moves `pending → running → done | failed`, or `pending → canceled`
//! when canceled before a worker picks it up. Failures, including panics,
//! are stored on the task and only surface when the result is requested.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dccrpc_common::config::TaskSettings;
use dccrpc_common::protocol::error::{Result, RpcError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::EventBus;
use crate::invocation::{Handler, Invocation, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskManagerConfig {
    /// `None` spawns one thread per task; `Some(n)` runs tasks on `n` pooled workers.
    pub max_workers: Option<usize>,
}

impl TaskManagerConfig {
    pub fn from_settings(settings: &TaskSettings) -> Self {
        Self {
            max_workers: settings.max_workers.filter(|n| *n > 0),
        }
    }
}

/// Failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

/// Snapshot of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub function_name: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

struct TaskRecord {
    info: TaskInfo,
    result: Option<Value>,
}

struct TaskInner {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    settled: Condvar,
    events: Option<EventBus>,
}

impl TaskInner {
    fn publish(&self, event_type: &str, data: Value) {
        if let Some(events) = &self.events {
            events.emit(event_type, data, Some("task_manager"));
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .filter_map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("dccrpc-task-{}", i))
                    .spawn(move || loop {
                        let job = receiver.lock().recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .map_err(|e| tracing::error!(error = %e, "Failed to spawn task worker"))
                    .ok()
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    fn execute(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| RpcError::TaskFailed {
                kind: "Runtime".to_string(),
                message: "Task workers are shut down".to_string(),
            })?;
        sender.send(job).map_err(|_| RpcError::TaskFailed {
            kind: "Runtime".to_string(),
            message: "Task workers are gone".to_string(),
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.lock().take();
        let current = thread::current().id();
        for worker in self.workers.lock().drain(..) {
            // A worker can end up dropping the pool itself
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

/// Runs functions in the background and keeps their outcome.
///
/// Lifecycle events (`task_started`, `task_progress`, `task_completed`,
/// `task_failed`, `task_canceled`) are published on the event bus when one
/// is attached.
pub struct TaskManager {
    inner: Arc<TaskInner>,
    pool: Option<WorkerPool>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, events: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                tasks: Mutex::new(HashMap::new()),
                settled: Condvar::new(),
                events,
            }),
            pool: config.max_workers.map(|n| WorkerPool::new(n.max(1))),
        }
    }

    /// Queues `handler` and returns the new task id. The task starts `pending`.
    pub fn submit(&self, function_name: &str, handler: Handler, invocation: Invocation) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let info = TaskInfo {
            id: id.clone(),
            function_name: function_name.to_string(),
            status: TaskStatus::Pending,
            progress: 0.0,
            message: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.inner
            .tasks
            .lock()
            .insert(id.clone(), TaskRecord { info, result: None });

        let inner = self.inner.clone();
        let task_id = id.clone();
        let name = function_name.to_string();
        let job: Job = Box::new(move || run_task(&inner, &task_id, &name, handler, invocation));

        let dispatched = match &self.pool {
            Some(pool) => pool.execute(job),
            None => thread::Builder::new()
                .name(format!("dccrpc-task-{}", &id[..8]))
                .spawn(job)
                .map(|_| ())
                .map_err(RpcError::from),
        };

        if let Err(e) = dispatched {
            self.inner.tasks.lock().remove(&id);
            return Err(e);
        }

        tracing::debug!(task_id = %id, function = function_name, "Task submitted");
        Ok(id)
    }

    /// Cancels a task that has not started yet.
    pub fn cancel(&self, task_id: &str) -> bool {
        let function_name = {
            let mut tasks = self.inner.tasks.lock();
            match tasks.get_mut(task_id) {
                Some(record) if record.info.status == TaskStatus::Pending => {
                    record.info.status = TaskStatus::Canceled;
                    record.info.finished_at = Some(Utc::now());
                    record.info.function_name.clone()
                }
                _ => return false,
            }
        };

        self.inner.settled.notify_all();
        self.inner.publish(
            "task_canceled",
            json!({ "task_id": task_id, "function_name": function_name }),
        );
        true
    }

    pub fn get_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.with_task(task_id, |record| record.info.status)
    }

    /// The value returned by a finished task.
    ///
    /// Failed tasks return their recorded error.
    pub fn get_result(&self, task_id: &str) -> Result<Value> {
        self.with_task(task_id, |record| match record.info.status {
            TaskStatus::Done => Ok(record.result.clone().unwrap_or(Value::Null)),
            TaskStatus::Failed => {
                let error = record.info.error.clone();
                Err(match error {
                    Some(error) => RpcError::TaskFailed {
                        kind: error.kind,
                        message: error.message,
                    },
                    None => RpcError::TaskFailed {
                        kind: "Unknown".to_string(),
                        message: format!("Task '{}' failed", task_id),
                    },
                })
            }
            TaskStatus::Canceled => Err(RpcError::TaskCanceled(task_id.to_string())),
            TaskStatus::Pending | TaskStatus::Running => Err(RpcError::TaskNotCompleted(task_id.to_string())),
        })?
    }

    /// `(progress, message)` of a task.
    pub fn get_progress(&self, task_id: &str) -> Result<(f64, String)> {
        self.with_task(task_id, |record| (record.info.progress, record.info.message.clone()))
    }

    pub fn get_info(&self, task_id: &str) -> Result<TaskInfo> {
        self.with_task(task_id, |record| record.info.clone())
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.inner.tasks.lock().values().map(|r| r.info.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Blocks until the task settles or `timeout` elapses, then returns its status.
    pub fn wait(&self, task_id: &str, timeout: Option<Duration>) -> Result<TaskStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut tasks = self.inner.tasks.lock();
        loop {
            let status = tasks
                .get(task_id)
                .map(|r| r.info.status)
                .ok_or_else(|| RpcError::TaskNotFound(task_id.to_string()))?;
            if status.is_terminal() {
                return Ok(status);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(status);
                    }
                    self.inner.settled.wait_for(&mut tasks, deadline - now);
                }
                None => self.inner.settled.wait(&mut tasks),
            }
        }
    }

    /// Removes settled tasks older than `max_age`. Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, r| !(r.info.status.is_terminal() && r.info.finished_at.map_or(false, |t| t < cutoff)));
        before - tasks.len()
    }

    fn with_task<T>(&self, task_id: &str, f: impl FnOnce(&TaskRecord) -> T) -> Result<T> {
        let tasks = self.inner.tasks.lock();
        tasks
            .get(task_id)
            .map(f)
            .ok_or_else(|| RpcError::TaskNotFound(task_id.to_string()))
    }
}

fn run_task(inner: &Arc<TaskInner>, task_id: &str, function_name: &str, handler: Handler, mut invocation: Invocation) {
    {
        let mut tasks = inner.tasks.lock();
        match tasks.get_mut(task_id) {
            Some(record) if record.info.status == TaskStatus::Pending => {
                record.info.status = TaskStatus::Running;
                record.info.started_at = Some(Utc::now());
            }
            // Canceled before a worker got to it
            _ => return,
        }
    }
    inner.publish(
        "task_started",
        json!({ "task_id": task_id, "function_name": function_name }),
    );

    invocation.progress = Some(progress_reporter(inner, task_id, function_name));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&invocation)));
    let (status, result, error) = match outcome {
        Ok(Ok(value)) => (TaskStatus::Done, Some(value), None),
        Ok(Err(e)) => (
            TaskStatus::Failed,
            None,
            Some(TaskError {
                kind: e.kind().to_string(),
                message: e.to_string(),
                traceback: format!("{}: {}\n  in task {} ({})\n  {:?}", e.kind(), e, task_id, function_name, e),
            }),
        ),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            (
                TaskStatus::Failed,
                None,
                Some(TaskError {
                    kind: "Panic".to_string(),
                    traceback: format!("panicked: {}\n  in task {} ({})", message, task_id, function_name),
                    message,
                }),
            )
        }
    };

    {
        let mut tasks = inner.tasks.lock();
        if let Some(record) = tasks.get_mut(task_id) {
            record.info.status = status;
            record.info.finished_at = Some(Utc::now());
            record.info.error = error.clone();
            record.result = result;
            if status == TaskStatus::Done {
                record.info.progress = 1.0;
            }
        }
    }
    inner.settled.notify_all();

    match error {
        None => {
            tracing::debug!(task_id, function = function_name, "Task completed");
            inner.publish(
                "task_completed",
                json!({ "task_id": task_id, "function_name": function_name }),
            );
        }
        Some(error) => {
            tracing::warn!(task_id, function = function_name, error = %error.message, "Task failed");
            inner.publish(
                "task_failed",
                json!({
                    "task_id": task_id,
                    "function_name": function_name,
                    "error": error.message,
                    "traceback": error.traceback,
                }),
            );
        }
    }
}

fn progress_reporter(inner: &Arc<TaskInner>, task_id: &str, function_name: &str) -> ProgressReporter {
    let inner = Arc::downgrade(inner);
    let task_id = task_id.to_string();
    let function_name = function_name.to_string();

    ProgressReporter::new(move |progress, message| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Some(record) = inner.tasks.lock().get_mut(&task_id) {
            record.info.progress = progress;
            record.info.message = message.to_string();
        }
        inner.publish(
            "task_progress",
            json!({
                "task_id": task_id,
                "progress": progress,
                "message": message,
                "function_name": function_name,
            }),
        );
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn handler<F>(f: F) -> Handler
    where
        F: Fn(&Invocation) -> Result<Value> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn wait_done(manager: &TaskManager, id: &str) -> TaskStatus {
        manager.wait(id, Some(Duration::from_secs(5))).unwrap()
    }

    #[test]
    fn test_successful_task() {
        let manager = TaskManager::new(TaskManagerConfig::default(), None);
        let id = manager
            .submit(
                "double",
                handler(|inv| Ok(json!(inv.u64_or(0, "n", 0)? * 2))),
                Invocation::new(vec![json!(21)], Default::default()),
            )
            .unwrap();

        assert_eq!(wait_done(&manager, &id), TaskStatus::Done);
        assert_eq!(manager.get_result(&id).unwrap(), json!(42));
        assert_eq!(manager.get_progress(&id).unwrap().0, 1.0);
    }

    #[test]
    fn test_failure_is_replayed_by_get_result() {
        let manager = TaskManager::new(TaskManagerConfig::default(), None);
        let id = manager
            .submit(
                "broken",
                handler(|_| Err(RpcError::Validation("bad scene".into()))),
                Invocation::default(),
            )
            .unwrap();

        assert_eq!(wait_done(&manager, &id), TaskStatus::Failed);
        match manager.get_result(&id).unwrap_err() {
            RpcError::TaskFailed { kind, message } => {
                assert_eq!(kind, "Validation");
                assert_eq!(message, "Validation error: bad scene");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let info = manager.get_info(&id).unwrap();
        assert!(info.error.unwrap().traceback.contains("broken"));
    }

    #[test]
    fn test_panics_are_captured() {
        let manager = TaskManager::new(TaskManagerConfig { max_workers: Some(1) }, None);
        let id = manager
            .submit("explode", handler(|_| panic!("kaboom")), Invocation::default())
            .unwrap();

        assert_eq!(wait_done(&manager, &id), TaskStatus::Failed);
        let err = manager.get_result(&id).unwrap_err();
        assert_eq!(err.kind(), "Panic");
        assert_eq!(err.to_string(), "kaboom");

        // the worker survives the panic
        let id = manager
            .submit("after", handler(|_| Ok(json!("ok"))), Invocation::default())
            .unwrap();
        assert_eq!(wait_done(&manager, &id), TaskStatus::Done);
    }

    #[test]
    fn test_cancel_only_while_pending() {
        let manager = TaskManager::new(TaskManagerConfig { max_workers: Some(1) }, None);
        let release = Arc::new(AtomicBool::new(false));

        let gate = release.clone();
        let blocker = manager
            .submit(
                "blocker",
                handler(move |_| {
                    while !gate.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Ok(Value::Null)
                }),
                Invocation::default(),
            )
            .unwrap();
        let queued = manager
            .submit("queued", handler(|_| Ok(json!("ran"))), Invocation::default())
            .unwrap();

        assert!(manager.cancel(&queued));
        assert!(!manager.cancel(&queued));
        assert_eq!(manager.get_status(&queued).unwrap(), TaskStatus::Canceled);
        assert!(matches!(manager.get_result(&queued), Err(RpcError::TaskCanceled(_))));

        // wait until the blocker is running, then it can no longer be canceled
        while manager.get_status(&blocker).unwrap() != TaskStatus::Running {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!manager.cancel(&blocker));
        assert!(matches!(manager.get_result(&blocker), Err(RpcError::TaskNotCompleted(_))));

        release.store(true, Ordering::SeqCst);
        assert_eq!(wait_done(&manager, &blocker), TaskStatus::Done);
        assert_eq!(manager.get_status(&queued).unwrap(), TaskStatus::Canceled);
    }

    #[test]
    fn test_progress_events() {
        let bus = EventBus::default();
        let manager = TaskManager::new(TaskManagerConfig::default(), Some(bus.clone()));

        let id = manager
            .submit(
                "export",
                handler(|inv| {
                    inv.report_progress(0.25, "quarter");
                    inv.report_progress(2.0, "clamped");
                    Ok(Value::Null)
                }),
                Invocation::default(),
            )
            .unwrap();
        wait_done(&manager, &id);
        // completion is published right after the status flips
        let deadline = Instant::now() + Duration::from_secs(5);
        while bus.get_history(Some("task_completed"), 1).is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let progress: Vec<Value> = bus
            .get_history(Some("task_progress"), 10)
            .into_iter()
            .map(|e| e.data)
            .collect();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0]["progress"], json!(0.25));
        assert_eq!(progress[1]["progress"], json!(1.0));
        assert_eq!(progress[1]["function_name"], json!("export"));

        let lifecycle: Vec<String> = bus
            .get_history(None, 10)
            .into_iter()
            .map(|e| e.event_type)
            .filter(|t| t != "task_progress")
            .collect();
        assert_eq!(lifecycle, vec!["task_started", "task_completed"]);
    }

    #[test]
    fn test_unknown_task() {
        let manager = TaskManager::new(TaskManagerConfig::default(), None);
        assert!(matches!(manager.get_status("nope"), Err(RpcError::TaskNotFound(_))));
        assert!(matches!(manager.get_result("nope"), Err(RpcError::TaskNotFound(_))));
        assert!(!manager.cancel("nope"));
    }

    #[test]
    fn test_list_tasks_in_submission_order() {
        let manager = TaskManager::new(TaskManagerConfig { max_workers: Some(2) }, None);
        let ids: Vec<String> = (0..3)
            .map(|i| {
                let id = manager
                    .submit(&format!("job{}", i), handler(|_| Ok(Value::Null)), Invocation::default())
                    .unwrap();
                thread::sleep(Duration::from_millis(2));
                id
            })
            .collect();
        for id in &ids {
            wait_done(&manager, id);
        }

        let listed: Vec<String> = manager.list_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(manager.prune(Duration::ZERO), 3);
        assert!(manager.list_tasks().is_empty());
    }
}
