//! Task records held by the queue registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a task: `Pending → Processing → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Completed and failed tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    /// `error` is accepted as an alias for `failed`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" | "error" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// One unit of trackable asynchronous work.
///
/// Only the queue writes tasks; callers get read-only snapshots from
/// [`crate::queue::TaskQueue::get_task`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub(crate) id: String,
    pub(crate) status: TaskStatus,
    pub(crate) created_at: DateTime<Utc>,
    /// Set exactly when the status is terminal.
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) total_students: usize,
    pub(crate) processed_count: usize,
    /// Result slots in student order; `None` marks a unit without a result.
    pub(crate) results: Vec<Option<String>>,
    pub(crate) error: Option<String>,
    pub(crate) params: BTreeMap<String, String>,
    /// Handed to the worker pool; a task is dispatched at most once.
    #[serde(skip)]
    pub(crate) dispatched: bool,
}

impl Task {
    pub(crate) fn new(id: String, kind: &str, message: &str) -> Self {
        let mut params = BTreeMap::new();
        params.insert("type".to_string(), kind.to_string());
        params.insert("message".to_string(), message.to_string());
        Self {
            id,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            ended_at: None,
            total_students: 0,
            processed_count: 0,
            results: Vec::new(),
            error: None,
            params,
            dispatched: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn total_students(&self) -> usize {
        self.total_students
    }

    pub fn processed_count(&self) -> usize {
        self.processed_count
    }

    /// Result slots in student order.
    pub fn results(&self) -> &[Option<String>] {
        &self.results
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.param("type")
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Populated result payloads in slot order, empty slots skipped.
    pub fn filled_results(&self) -> impl Iterator<Item = &str> {
        self.results.iter().filter_map(|r| r.as_deref())
    }
}

/// Number of registered tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts(pub BTreeMap<TaskStatus, usize>);

impl TaskCounts {
    pub(crate) fn zeroed() -> Self {
        Self(TaskStatus::ALL.iter().map(|s| (*s, 0)).collect())
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}
