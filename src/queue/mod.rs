//! In-memory task registry plus a fixed-size worker pool.
//!
//! ## Two levels of concurrency
//!
//! ```text
//! dispatch ──► bounded channel ──► N pool workers ──► job(TaskHandle)
//!                                                      │
//!                                                      ├─ unit 0 ─┐
//!                                                      ├─ unit 1 ─┤ fan-out,
//!                                                      └─ unit k ─┘ joined by the job
//! ```
//!
//! The pool bounds how many tasks run at once; inside a task the job may
//! fan out freely. Every write to task state, from any level, goes through
//! the single registry lock, and each fan-out unit writes only its own
//! pre-sized result slot, so aggregated results come out in student order no
//! matter which unit finishes first.
//!
//! ## Supervision
//!
//! A job returns `Ok(message)` to complete its task or `Err` to fail it.
//! Panics are caught at the worker boundary and turned into a failed task
//! with a generic message; the worker survives and keeps draining the queue.

mod janitor;
pub mod status;
pub mod task;

pub use janitor::JanitorHandle;
pub use status::{compute_progress, TaskStatusReport};
pub use task::{Task, TaskCounts, TaskStatus};

use crate::config::GraderConfig;
use crate::error::GraderError;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a job resolves to: an optional completion message, or the error that
/// fails the task.
pub type JobFuture = BoxFuture<'static, Result<Option<String>, GraderError>>;

/// Work executed by a pool worker for one task.
pub type Job = Box<dyn FnOnce(TaskHandle) -> JobFuture + Send + 'static>;

struct Envelope {
    task_id: String,
    job: Job,
}

// ── Registry ─────────────────────────────────────────────────────────────

/// The task map and the in-flight counter. Shared by the queue front-end,
/// the pool workers, task handles, and the janitor.
pub(crate) struct Registry {
    tasks: RwLock<HashMap<String, Task>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Registry {
    fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Task>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Task>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on a task that exists and is not terminal. Unknown and
    /// terminal tasks are left untouched and reported with a warning.
    fn mutate_active<R>(&self, task_id: &str, op: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut tasks = self.write();
        match tasks.get_mut(task_id) {
            None => {
                warn!("{op}: task {task_id} not found");
                None
            }
            Some(task) if task.is_terminal() => {
                warn!("{op}: task {task_id} is already {}; ignoring", task.status);
                None
            }
            Some(task) => Some(f(task)),
        }
    }

    fn create(&self, kind: &str, message: &str) -> String {
        let id = format!("task_{}", Uuid::new_v4().simple());
        let task = Task::new(id.clone(), kind, message);
        self.write().insert(id.clone(), task);
        info!("Created task {id} ({kind})");
        id
    }

    fn update_status(&self, task_id: &str, status: TaskStatus, message: &str) -> bool {
        self.mutate_active(task_id, "update_task_status", |task| {
            if status == TaskStatus::Pending && task.status != TaskStatus::Pending {
                warn!("update_task_status: task {task_id} cannot return to pending");
                return false;
            }
            apply_status(task, status, message);
            true
        })
        .unwrap_or(false)
    }

    /// Worker-side settlement: a job that already finalised its own task is
    /// not an error.
    fn settle(&self, task_id: &str, status: TaskStatus, message: &str) {
        let mut tasks = self.write();
        if let Some(task) = tasks.get_mut(task_id) {
            if !task.is_terminal() {
                apply_status(task, status, message);
            }
        }
    }

    /// Claim a task for the pool. Fails for unknown tasks, tasks already
    /// claimed, and tasks that have left `pending`.
    fn mark_dispatched(&self, task_id: &str) -> Result<(), GraderError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| GraderError::TaskNotFound(task_id.to_string()))?;
        if task.dispatched || task.status != TaskStatus::Pending {
            return Err(GraderError::AlreadyDispatched {
                task_id: task_id.to_string(),
                status: task.status.to_string(),
            });
        }
        task.dispatched = true;
        Ok(())
    }

    /// `pending → processing`, once. Anything else means the job must not run.
    fn begin_processing(&self, task_id: &str) -> bool {
        self.mutate_active(task_id, "begin_processing", |task| {
            if task.status != TaskStatus::Pending {
                warn!("begin_processing: task {task_id} is already {}; skipping", task.status);
                return false;
            }
            task.status = TaskStatus::Processing;
            true
        })
        .unwrap_or(false)
    }

    fn set_total_students(&self, task_id: &str, total: usize) -> bool {
        self.mutate_active(task_id, "update_task_total_students", |task| {
            if total < task.processed_count {
                warn!(
                    "update_task_total_students: task {task_id} already processed {} > {total}",
                    task.processed_count
                );
                return false;
            }
            task.total_students = total;
            if task.results.len() < total {
                task.results.resize(total, None);
            }
            true
        })
        .unwrap_or(false)
    }

    fn increment_processed(&self, task_id: &str) -> bool {
        self.mutate_active(task_id, "increment_processed_count", |task| {
            if task.processed_count >= task.total_students {
                warn!(
                    "increment_processed_count: task {task_id} already at {}/{}",
                    task.processed_count, task.total_students
                );
                return false;
            }
            task.processed_count += 1;
            debug!(
                "Task {task_id}: processed {}/{}",
                task.processed_count, task.total_students
            );
            true
        })
        .unwrap_or(false)
    }

    fn record_result(&self, task_id: &str, index: usize, payload: String) -> bool {
        self.mutate_active(task_id, "record_unit_result", |task| {
            match task.results.get_mut(index) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(payload);
                    true
                }
                Some(_) => {
                    warn!("record_unit_result: task {task_id} slot {index} already filled");
                    false
                }
                None => {
                    warn!(
                        "record_unit_result: task {task_id} has {} slots, got index {index}",
                        task.results.len()
                    );
                    false
                }
            }
        })
        .unwrap_or(false)
    }

    fn set_param(&self, task_id: &str, key: &str, value: &str) -> bool {
        self.mutate_active(task_id, "set_task_param", |task| {
            task.params.insert(key.to_string(), value.to_string());
            true
        })
        .unwrap_or(false)
    }

    fn get(&self, task_id: &str) -> Option<Task> {
        self.read().get(task_id).cloned()
    }

    fn cleanup(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, task| match task.ended_at {
            Some(ended) => now.signed_duration_since(ended) <= max_age,
            None => true,
        });
        let removed = before - tasks.len();
        if removed > 0 {
            info!("Cleaned up {removed} finished tasks");
        }
        removed
    }

    fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::zeroed();
        for task in self.read().values() {
            *counts.0.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    fn find_active(&self, key: &str, value: &str) -> Option<String> {
        self.read()
            .values()
            .filter(|t| !t.is_terminal())
            .filter(|t| t.params.get(key).map(String::as_str) == Some(value))
            .min_by_key(|t| t.created_at)
            .map(|t| t.id.clone())
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

fn apply_status(task: &mut Task, status: TaskStatus, message: &str) {
    task.status = status;
    match status {
        TaskStatus::Completed => {
            if !message.is_empty() {
                task.results.push(Some(message.to_string()));
            }
            task.ended_at = Some(Utc::now());
            info!("Task {} completed", task.id);
        }
        TaskStatus::Failed => {
            task.error = Some(message.to_string());
            task.ended_at = Some(Utc::now());
            warn!("Task {} failed: {message}", task.id);
        }
        TaskStatus::Pending | TaskStatus::Processing => {}
    }
}

// ── Task handle ──────────────────────────────────────────────────────────

/// Capability handed to a running job to report on its own task.
///
/// Cheap to clone; fan-out units each take a clone and write only their own
/// result slot.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: Arc<str>,
    registry: Arc<Registry>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.task_id
    }

    pub fn set_total_students(&self, total: usize) -> bool {
        self.registry.set_total_students(&self.task_id, total)
    }

    pub fn increment_processed(&self) -> bool {
        self.registry.increment_processed(&self.task_id)
    }

    pub fn record_result(&self, index: usize, payload: impl Into<String>) -> bool {
        self.registry.record_result(&self.task_id, index, payload.into())
    }

    pub fn snapshot(&self) -> Option<Task> {
        self.registry.get(&self.task_id)
    }
}

// ── Queue front-end ──────────────────────────────────────────────────────

struct Dispatcher {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Task registry plus worker pool. Clones share the same queue.
///
/// Must be created inside a Tokio runtime: workers are spawned immediately.
#[derive(Clone)]
pub struct TaskQueue {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
}

impl TaskQueue {
    /// Start a queue sized from the configuration.
    pub fn new(config: &GraderConfig) -> Self {
        Self::with_workers(config.worker_count, config.queue_capacity)
    }

    /// Start `worker_count` workers over a channel buffering `capacity` tasks.
    pub fn with_workers(worker_count: usize, capacity: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let registry = Arc::new(Registry::new());

        let workers = (0..worker_count)
            .map(|n| tokio::spawn(worker_loop(n, Arc::clone(&rx), Arc::clone(&registry))))
            .collect();
        info!("Task queue started with {worker_count} workers (capacity {capacity})");

        Self {
            registry,
            dispatcher: Arc::new(Dispatcher {
                sender: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
            }),
        }
    }

    /// Register a new pending task and return its ID.
    pub fn create_task(&self, kind: &str, message: &str) -> String {
        self.registry.create(kind, message)
    }

    /// Hand a task to the worker pool. Waits only while the buffer is full.
    ///
    /// A task is dispatched at most once; a second dispatch of the same ID
    /// fails with [`GraderError::AlreadyDispatched`]. Cancelling the returned
    /// future while it waits for buffer space leaves the task undispatched
    /// and the in-flight count untouched.
    pub async fn dispatch<F>(&self, task_id: &str, job: F) -> Result<(), GraderError>
    where
        F: FnOnce(TaskHandle) -> JobFuture + Send + 'static,
    {
        if self.registry.get(task_id).is_none() {
            return Err(GraderError::TaskNotFound(task_id.to_string()));
        }
        let sender = self
            .dispatcher
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(GraderError::QueueClosed)?;

        let permit = sender.reserve().await.map_err(|_| GraderError::QueueClosed)?;
        // Nothing below awaits, so the claim and the send cannot be torn apart.
        self.registry.mark_dispatched(task_id)?;
        self.registry.in_flight.fetch_add(1, Ordering::SeqCst);
        permit.send(Envelope {
            task_id: task_id.to_string(),
            job: Box::new(job),
        });
        debug!("Dispatched task {task_id}");
        Ok(())
    }

    pub fn update_task_status(&self, task_id: &str, status: TaskStatus, message: &str) -> bool {
        self.registry.update_status(task_id, status, message)
    }

    pub fn update_task_total_students(&self, task_id: &str, total: usize) -> bool {
        self.registry.set_total_students(task_id, total)
    }

    pub fn increment_processed_count(&self, task_id: &str) -> bool {
        self.registry.increment_processed(task_id)
    }

    pub fn record_unit_result(&self, task_id: &str, index: usize, payload: impl Into<String>) -> bool {
        self.registry.record_result(task_id, index, payload.into())
    }

    pub fn set_task_param(&self, task_id: &str, key: &str, value: &str) -> bool {
        self.registry.set_param(task_id, key, value)
    }

    /// Snapshot of a task.
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.registry.get(task_id)
    }

    /// Poll-friendly view of a task.
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatusReport> {
        self.registry.get(task_id).map(|t| TaskStatusReport::from_task(&t))
    }

    /// Remove finished tasks whose end time is older than `max_age`.
    pub fn cleanup_tasks(&self, max_age: Duration) -> usize {
        self.registry.cleanup(max_age)
    }

    pub fn tasks_count(&self) -> TaskCounts {
        self.registry.counts()
    }

    /// Oldest unfinished task whose parameter `key` equals `value`.
    pub fn find_active_task(&self, key: &str, value: &str) -> Option<String> {
        self.registry.find_active(key, value)
    }

    /// Number of dispatched tasks not yet settled.
    pub fn in_flight(&self) -> usize {
        self.registry.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once every dispatched task has settled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.registry.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Run [`TaskQueue::cleanup_tasks`] every `every` until the handle stops.
    pub fn spawn_janitor(&self, every: Duration, max_age: Duration) -> JanitorHandle {
        janitor::spawn(Arc::clone(&self.registry), every, max_age)
    }

    /// Stop accepting work, let workers drain the buffer, and join them.
    pub async fn shutdown(&self) {
        let sender = self
            .dispatcher
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let workers: Vec<_> = self
            .dispatcher
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            if let Err(err) = handle.await {
                error!(error = %err, "Task worker join failed");
            }
        }
        info!("Task queue shut down");
    }
}

// ── Workers ──────────────────────────────────────────────────────────────

async fn worker_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    registry: Arc<Registry>,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(envelope) = next else {
            debug!("Worker {worker}: channel closed");
            break;
        };
        run_job(worker, &registry, envelope).await;
        registry.finish_one();
    }
}

async fn run_job(worker: usize, registry: &Arc<Registry>, envelope: Envelope) {
    let Envelope { task_id, job } = envelope;
    if !registry.begin_processing(&task_id) {
        return;
    }
    info!("Worker {worker}: processing task {task_id}");

    let handle = TaskHandle {
        task_id: Arc::from(task_id.as_str()),
        registry: Arc::clone(registry),
    };
    let outcome = AssertUnwindSafe(async move { job(handle).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(message)) => {
            registry.settle(&task_id, TaskStatus::Completed, message.as_deref().unwrap_or(""));
        }
        Ok(Err(err)) => {
            warn!("Task {task_id} returned an error: {err}");
            registry.settle(&task_id, TaskStatus::Failed, &err.client_message());
        }
        Err(payload) => {
            let err = GraderError::TaskPanic {
                task_id: task_id.clone(),
            };
            error!(panic = %panic_message(payload.as_ref()), "{err}");
            registry.settle(&task_id, TaskStatus::Failed, &err.client_message());
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
