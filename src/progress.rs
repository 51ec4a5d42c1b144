//! Progress callbacks for homework grading.
//!
//! Inject an [`Arc<dyn GradingProgressCallback>`] via
//! [`crate::homework::HomeworkService::with_progress`] to observe each
//! student unit as it is graded. The task queue already keeps counters for
//! polling clients; callbacks are for hosts that want push events (a
//! terminal bar, a WebSocket, a log line).
//!
//! Units of one task are graded concurrently, so `on_unit_*` may be called
//! from several threads at once. All methods default to no-ops.

use std::sync::Arc;

/// Called by [`crate::homework::HomeworkService`] as a task progresses.
pub trait GradingProgressCallback: Send + Sync {
    /// Called once the number of units is known.
    fn on_task_start(&self, task_id: &str, total_units: usize) {
        let _ = (task_id, total_units);
    }

    /// Called just before a unit is sent for grading. `unit` is 1-indexed.
    fn on_unit_start(&self, task_id: &str, unit: usize, total_units: usize) {
        let _ = (task_id, unit, total_units);
    }

    /// Called when a unit has a validated result.
    fn on_unit_complete(&self, task_id: &str, unit: usize, total_units: usize) {
        let _ = (task_id, unit, total_units);
    }

    /// Called when a unit fails after all retries.
    fn on_unit_error(&self, task_id: &str, unit: usize, total_units: usize, error: &str) {
        let _ = (task_id, unit, total_units, error);
    }

    /// Called once after every unit has been attempted.
    fn on_task_complete(&self, task_id: &str, total_units: usize, success_count: usize) {
        let _ = (task_id, total_units, success_count);
    }
}

/// Ignores every event.
pub struct NoopProgressCallback;

impl GradingProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn GradingProgressCallback>;
