//! # homework-grader
//!
//! Grade scanned homework with a multimodal model.
//!
//! ## Why this crate?
//!
//! An instructor scans a whole class set into one PDF, several pages per
//! student, and wants every student's handwritten answers read and judged.
//! That is three problems that fail independently: splitting a scan that
//! PDF tooling sometimes chokes on, calling a model that times out, rate
//! limits, refuses content or returns half a JSON document, and keeping a
//! poller informed while dozens of students are graded at once. Each gets
//! its own module and its own failure policy.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Submit   validate, dedupe, create task            (homework)
//!  ├─ 2. Queue    worker pool picks the task up            (queue)
//!  ├─ 3. Split    one PDF per student, with fallbacks      (split, spawn_blocking)
//!  ├─ 4. Grade    concurrent model calls, retry + repair   (grading)
//!  ├─ 5. Collect  index-ordered result slots, counters     (queue)
//!  └─ 6. Poll     status report with bounded progress      (queue::status)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use homework_grader::{GraderConfig, HomeworkService, Submission, Subject};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / …
//!     let service = HomeworkService::new(GraderConfig::default())?;
//!     let task_id = service
//!         .submit(Submission::new("class-3b.pdf").subject(Subject::Math).pages_per_student(2))
//!         .await?;
//!     loop {
//!         let report = service.get_task_status(&task_id).ok_or("task vanished")?;
//!         if report.is_terminal() {
//!             println!("{}", serde_json::to_string_pretty(&report)?);
//!             break;
//!         }
//!         tokio::time::sleep(Duration::from_secs(1)).await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `grader` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod grading;
pub mod homework;
pub mod progress;
pub mod prompts;
pub mod queue;
pub mod split;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{GraderConfig, GraderConfigBuilder};
pub use error::{GradeError, GraderError};
pub use grading::{
    GradedDocument, GradingBackend, GradingInvoker, GradingResult, MockGradingBackend, RetryPolicy,
};
pub use homework::{HomeworkService, Submission};
pub use progress::{GradingProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::{Layout, Subject};
pub use queue::{compute_progress, Task, TaskCounts, TaskHandle, TaskQueue, TaskStatus, TaskStatusReport};
pub use split::{split_pdf, split_pdf_blocking, PdfToolkit, PdfiumToolkit, SplitOptions, SplitOutcome, SplitUnit};
