//! Poll-friendly projection of a task.
//!
//! Clients poll until they see `completed` or `failed`. The report is a pure
//! function of a [`Task`] snapshot, so repeated polls of a terminal task
//! serialise to identical bytes.

use super::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// What a client sees when polling a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub processed: usize,
    pub total: usize,
    /// Always within `[0, 1]`; `1.0` once completed, `0.0` once failed.
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl TaskStatusReport {
    pub fn from_task(task: &Task) -> Self {
        let results: Vec<Value> = task.filled_results().map(payload_value).collect();
        let mut report = Self {
            task_id: task.id.clone(),
            status: task.status,
            processed: task.processed_count,
            total: task.total_students,
            progress: compute_progress(task.status, task.processed_count, task.total_students),
            start_time: task.created_at,
            end_time: None,
            partial_results: None,
            results: None,
            error: None,
            is_error: false,
        };

        match task.status {
            TaskStatus::Pending | TaskStatus::Processing => {
                report.partial_results = Some(results);
            }
            TaskStatus::Completed => {
                report.results = Some(results);
                report.end_time = task.ended_at;
            }
            TaskStatus::Failed => {
                report.error = Some(
                    task.error
                        .clone()
                        .unwrap_or_else(|| "task failed".to_string()),
                );
                report.is_error = true;
                report.end_time = task.ended_at;
            }
        }
        report
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Fraction of students processed, safe for any counter state.
pub fn compute_progress(status: TaskStatus, processed: usize, total: usize) -> f64 {
    match status {
        TaskStatus::Completed => 1.0,
        TaskStatus::Failed => 0.0,
        TaskStatus::Pending | TaskStatus::Processing => {
            if total == 0 {
                return 0.0;
            }
            let p = processed as f64 / total as f64;
            if p.is_finite() {
                p.clamp(0.0, 1.0)
            } else {
                0.0
            }
        }
    }
}

/// Stored payloads are JSON text when they came from a grader; anything else
/// (e.g. a free-form completion message) is reported as a string.
fn payload_value(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}
