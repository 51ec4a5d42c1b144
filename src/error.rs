//! Error types for the homework-grader library.
//!
//! Two error types reflect two different blast radii:
//!
//! * [`GraderError`] is **fatal** for the operation it comes from: a split that
//!   cannot produce a complete, index-aligned set of student documents, a task
//!   that cannot be queued, or a task whose every student failed.
//!
//! * [`GradeError`] is **non-fatal**: one student's document could not be
//!   graded. It is logged and leaves that student's result slot empty while
//!   sibling units carry on.
//!
//! Failed tasks expose [`GraderError::client_message`] to pollers, never the
//! raw `Display` output, so filesystem paths stay on the server side.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the homework-grader library.
#[derive(Debug, Error)]
pub enum GraderError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Missing, empty, oversized or malformed input; never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ── Split errors ──────────────────────────────────────────────────────
    /// Neither bulk nor page-by-page extraction produced any page for a unit.
    #[error("Extraction failed for student {unit} (pages {first_page}-{last_page}): {detail}")]
    ExtractionFailed {
        unit: usize,
        first_page: usize,
        last_page: usize,
        detail: String,
    },

    /// A unit's output file is missing or zero bytes after extraction.
    #[error("Split produced an empty document: '{path}'")]
    EmptyOutput { path: PathBuf },

    /// A unit's output has the wrong number of pages (strict mode only).
    #[error("Split document '{path}' has {actual} pages, expected {expected}")]
    PageCountMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    // ── Grading errors ────────────────────────────────────────────────────
    /// Every student document of a task failed to grade.
    #[error("All {total} student documents failed to grade. First error: {first_error}")]
    AllUnitsFailed { total: usize, first_error: String },

    /// The only document of a single-file task failed to grade.
    #[error(transparent)]
    Grading(#[from] GradeError),

    // ── Queue errors ──────────────────────────────────────────────────────
    /// The queue has been shut down and accepts no more work.
    #[error("Task queue is closed")]
    QueueClosed,

    /// No task with this ID is registered.
    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    /// The task was already handed to the pool, or is no longer pending.
    /// Each task gets at most one processing pass.
    #[error("Task '{task_id}' cannot be dispatched: already queued or {status}")]
    AlreadyDispatched { task_id: String, status: String },

    /// A task job panicked; the payload is logged, not exposed.
    #[error("Task '{task_id}' panicked during processing")]
    TaskPanic { task_id: String },

    // ── I/O and config ────────────────────────────────────────────────────
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GraderError {
    /// Attach the offending path to an [`std::io::Error`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GraderError::Io {
            path: path.into(),
            source,
        }
    }

    /// Human-readable message safe to store on a failed task.
    pub fn client_message(&self) -> String {
        match self {
            GraderError::InvalidInput(msg) => format!("invalid input: {msg}"),
            GraderError::ExtractionFailed { unit, .. } => {
                format!("could not extract the pages of student {unit}")
            }
            GraderError::EmptyOutput { .. } | GraderError::PageCountMismatch { .. } => {
                "splitting the PDF produced an incomplete student document".to_string()
            }
            GraderError::AllUnitsFailed { total, first_error } => {
                format!("all {total} student documents failed to grade: {first_error}")
            }
            GraderError::Grading(e) => e.to_string(),
            GraderError::TaskPanic { .. } => {
                "an internal error occurred while processing the task".to_string()
            }
            GraderError::QueueClosed => "the grading service is shutting down".to_string(),
            GraderError::TaskNotFound(_) => "task not found".to_string(),
            GraderError::AlreadyDispatched { .. } => "task is already being processed".to_string(),
            GraderError::Io { .. } | GraderError::Internal(_) | GraderError::InvalidConfig(_) => {
                "an internal error occurred while processing the task".to_string()
            }
        }
    }
}

/// A non-fatal error for one student document.
///
/// Recorded by the fan-out as an empty result slot; the aggregate task
/// continues unless every unit fails.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum GradeError {
    /// The file was missing or empty before the first attempt.
    #[error("homework file is missing or empty: {detail}")]
    InvalidInput { detail: String },

    /// Extension or content is not a PDF, JPEG or PNG.
    #[error("unsupported file type '{extension}' (expected pdf, jpg, jpeg or png)")]
    UnsupportedFileType { extension: String },

    /// Network, timeout or empty-response failures persisted through every attempt.
    #[error("grading model unavailable after {attempts} attempts: {detail}")]
    TransientModelFailure { attempts: u32, detail: String },

    /// The model refused the content; retrying cannot help.
    #[error("grading model rejected the content: {detail}")]
    ContentPolicyRejected { detail: String },

    /// The response could not be parsed as a grading result even after repair.
    #[error("grading model returned an unreadable result: {detail}")]
    InvalidResponseFormat { detail: String },

    /// The file disappeared between attempts.
    #[error("homework file disappeared before retry {attempt}")]
    FileVanished { attempt: u32 },
}

impl GradeError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GradeError::TransientModelFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_failed_display() {
        let e = GraderError::ExtractionFailed {
            unit: 2,
            first_page: 4,
            last_page: 6,
            detail: "no pages".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("student 2"), "got: {msg}");
        assert!(msg.contains("4-6"), "got: {msg}");
    }

    #[test]
    fn client_message_hides_paths() {
        let e = GraderError::EmptyOutput {
            path: PathBuf::from("/srv/uploads/split/secret/student_1.pdf"),
        };
        assert!(!e.client_message().contains("/srv"));

        let e = GraderError::io(
            "/srv/uploads/x.pdf",
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        );
        assert!(!e.client_message().contains("/srv"));
    }

    #[test]
    fn client_message_hides_panic_payload() {
        let e = GraderError::TaskPanic {
            task_id: "task_1".into(),
        };
        assert!(!e.client_message().contains("task_1"));
    }

    #[test]
    fn grading_error_is_transparent() {
        let e: GraderError = GradeError::ContentPolicyRejected {
            detail: "blocked".into(),
        }
        .into();
        assert!(e.to_string().contains("rejected"));
        assert_eq!(e.to_string(), e.client_message());
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(GradeError::TransientModelFailure {
            attempts: 1,
            detail: "503".into()
        }
        .is_retryable());
        assert!(!GradeError::ContentPolicyRejected { detail: "x".into() }.is_retryable());
        assert!(!GradeError::FileVanished { attempt: 2 }.is_retryable());
        assert!(!GradeError::InvalidResponseFormat { detail: "x".into() }.is_retryable());
    }
}
