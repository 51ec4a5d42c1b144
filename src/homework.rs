//! Homework submission: validate, queue, split, fan out, grade.
//!
//! ```text
//! submit(Submission)
//!  ├─ validate   exists, non-empty, size limit, pdf/jpeg/png by extension + header
//!  ├─ dedupe     same file + subject already in flight → existing task ID
//!  └─ dispatch   job on the task queue
//!       ├─ PDF with pages_per_student → split_pdf → one unit per student
//!       │    units graded concurrently, each writes its own result slot
//!       │    no unit succeeds → AllUnitsFailed
//!       └─ otherwise → the whole file is one unit
//! ```
//!
//! A unit that fails is logged and reported through the progress callback;
//! its slot stays empty and `processed` does not count it, so a poller sees
//! which students are missing.

use crate::config::GraderConfig;
use crate::error::{GradeError, GraderError};
use crate::grading::{
    backend_from_config, detect_mime_type, GradingBackend, GradingInvoker, Sleeper,
};
use crate::progress::{GradingProgressCallback, NoopProgressCallback};
use crate::prompts::{system_instruction, task_prompt, Layout, Subject};
use crate::queue::{JanitorHandle, TaskHandle, TaskQueue, TaskStatus, TaskStatusReport};
use crate::split::{split_pdf, PdfToolkit, PdfiumToolkit, SplitOptions, SplitUnit};
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const PDF_MIME: &str = "application/pdf";
const DEDUP_PARAM: &str = "dedup_key";

/// One uploaded homework file and how to grade it.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub path: PathBuf,
    pub subject: Subject,
    pub layout: Layout,
    /// Split a PDF into units of this many pages, one per student.
    /// `None` grades the whole file as one student.
    pub pages_per_student: Option<usize>,
    /// Replaces the default task prompt text.
    pub prompt: Option<String>,
}

impl Submission {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            subject: Subject::default(),
            layout: Layout::default(),
            pages_per_student: None,
            prompt: None,
        }
    }

    pub fn subject(mut self, subject: Subject) -> Self {
        self.subject = subject;
        self
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn pages_per_student(mut self, pages: usize) -> Self {
        self.pages_per_student = Some(pages);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Accepts submissions and runs them on a [`TaskQueue`].
pub struct HomeworkService {
    queue: TaskQueue,
    invoker: Arc<GradingInvoker>,
    toolkit: Arc<dyn PdfToolkit>,
    config: Arc<GraderConfig>,
    progress: Arc<dyn GradingProgressCallback>,
    submit_gate: tokio::sync::Mutex<()>,
}

impl HomeworkService {
    /// Build the service from configuration: the configured grading backend,
    /// pdfium for splitting, and a fresh queue. Must run inside a Tokio
    /// runtime.
    pub fn new(config: GraderConfig) -> Result<Self, GraderError> {
        let backend = backend_from_config(&config)?;
        Ok(Self::from_parts(config, backend, Arc::new(PdfiumToolkit::new())))
    }

    /// Build the service around an explicit backend and PDF toolkit.
    pub fn from_parts(
        config: GraderConfig,
        backend: Arc<dyn GradingBackend>,
        toolkit: Arc<dyn PdfToolkit>,
    ) -> Self {
        let queue = TaskQueue::new(&config);
        let invoker = Arc::new(GradingInvoker::new(backend, &config));
        Self {
            queue,
            invoker,
            toolkit,
            config: Arc::new(config),
            progress: Arc::new(NoopProgressCallback),
            submit_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn GradingProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Replace the timer used between grading attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.invoker = Arc::new(self.invoker.as_ref().clone().with_sleeper(sleeper));
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatusReport> {
        self.queue.get_task_status(task_id)
    }

    /// Start periodic cleanup of finished tasks using the configured
    /// interval and retention.
    pub fn spawn_janitor(&self) -> JanitorHandle {
        self.queue
            .spawn_janitor(self.config.cleanup_interval, self.config.task_retention)
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Validate and queue a submission. Returns the task ID to poll; a
    /// duplicate of an unfinished submission returns that task's ID.
    pub async fn submit(&self, submission: Submission) -> Result<String, GraderError> {
        let mime_type = self.validate(&submission)?;
        let dedup_key = dedup_key(&submission);

        let _gate = self.submit_gate.lock().await;
        if let Some(existing) = self.queue.find_active_task(DEDUP_PARAM, &dedup_key) {
            info!(
                "{} ({}) is already being graded as {existing}",
                submission.path.display(),
                submission.subject
            );
            return Ok(existing);
        }

        let file_name = display_name(&submission.path);
        let task_id = self
            .queue
            .create_task("homework", &format!("{} homework: {file_name}", submission.subject));
        self.queue.set_task_param(&task_id, DEDUP_PARAM, &dedup_key);
        self.queue.set_task_param(&task_id, "file", &file_name);
        self.queue
            .set_task_param(&task_id, "subject", submission.subject.as_str());

        let job = HomeworkJob {
            invoker: Arc::clone(&self.invoker),
            toolkit: Arc::clone(&self.toolkit),
            progress: Arc::clone(&self.progress),
            split_root: self.config.split_root(),
            split_options: SplitOptions {
                strict_page_count: self.config.strict_page_count,
            },
            system_instruction: system_instruction(submission.subject),
            mime_type,
            submission,
        };
        if let Err(e) = self
            .queue
            .dispatch(&task_id, move |handle| job.run(handle).boxed())
            .await
        {
            self.queue
                .update_task_status(&task_id, TaskStatus::Failed, &e.client_message());
            return Err(e);
        }
        Ok(task_id)
    }

    fn validate(&self, submission: &Submission) -> Result<&'static str, GraderError> {
        let path = &submission.path;
        let meta = std::fs::metadata(path)
            .map_err(|_| GraderError::InvalidInput(format!("{} not found", display_name(path))))?;
        if !meta.is_file() {
            return Err(GraderError::InvalidInput(format!(
                "{} is not a file",
                display_name(path)
            )));
        }
        if meta.len() == 0 {
            return Err(GraderError::InvalidInput(format!(
                "{} is empty",
                display_name(path)
            )));
        }
        if meta.len() > self.config.max_upload_bytes {
            return Err(GraderError::InvalidInput(format!(
                "{} is {} bytes; the limit is {}",
                display_name(path),
                meta.len(),
                self.config.max_upload_bytes
            )));
        }
        if submission.pages_per_student == Some(0) {
            return Err(GraderError::InvalidInput(
                "pages per student must be ≥ 1".into(),
            ));
        }
        detect_mime_type(path).map_err(|e| GraderError::InvalidInput(e.to_string()))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn dedup_key(submission: &Submission) -> String {
    let path = std::fs::canonicalize(&submission.path).unwrap_or_else(|_| submission.path.clone());
    format!("{}|{}", path.display(), submission.subject)
}

// ── Job ──────────────────────────────────────────────────────────────────

/// Everything a dispatched submission needs, owned by the job.
struct HomeworkJob {
    invoker: Arc<GradingInvoker>,
    toolkit: Arc<dyn PdfToolkit>,
    progress: Arc<dyn GradingProgressCallback>,
    split_root: PathBuf,
    split_options: SplitOptions,
    system_instruction: String,
    mime_type: &'static str,
    submission: Submission,
}

impl HomeworkJob {
    async fn run(self, handle: TaskHandle) -> Result<Option<String>, GraderError> {
        match (self.mime_type, self.submission.pages_per_student) {
            (PDF_MIME, Some(pages)) => self.grade_split(handle, pages).await,
            (_, Some(_)) => {
                debug!("pages per student ignored for a {} upload", self.mime_type);
                self.grade_single(handle).await
            }
            (_, None) => self.grade_single(handle).await,
        }
    }

    async fn grade_split(self, handle: TaskHandle, pages_per_student: usize) -> Result<Option<String>, GraderError> {
        let outcome = split_pdf(
            Arc::clone(&self.toolkit),
            &self.submission.path,
            pages_per_student,
            &self.split_root,
            self.split_options,
        )
        .await?;

        let total = outcome.units.len();
        handle.set_total_students(total);
        self.progress.on_task_start(handle.id(), total);
        info!(
            "Task {}: grading {total} students from {} pages",
            handle.id(),
            outcome.total_pages
        );

        let job = Arc::new(self);
        let units: Vec<_> = outcome
            .units
            .into_iter()
            .map(|unit| {
                let job = Arc::clone(&job);
                let handle = handle.clone();
                tokio::spawn(async move { job.grade_unit(&handle, unit, total).await })
            })
            .collect();

        let mut successes = 0;
        let mut first_error: Option<String> = None;
        for (index, joined) in futures::future::join_all(units).await.into_iter().enumerate() {
            match joined {
                Ok(Ok(())) => successes += 1,
                Ok(Err(e)) => {
                    first_error.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    error!("Task {}: student {} panicked: {e}", handle.id(), index + 1);
                    first_error.get_or_insert_with(|| "internal error while grading".to_string());
                }
            }
        }

        job.progress.on_task_complete(handle.id(), total, successes);
        if successes == 0 {
            return Err(GraderError::AllUnitsFailed {
                total,
                first_error: first_error.unwrap_or_else(|| "no student documents".to_string()),
            });
        }
        if successes < total {
            warn!(
                "Task {}: {} of {total} students could not be graded",
                handle.id(),
                total - successes
            );
        }
        Ok(None)
    }

    async fn grade_unit(&self, handle: &TaskHandle, unit: SplitUnit, total: usize) -> Result<(), GradeError> {
        let number = unit.index + 1;
        self.progress.on_unit_start(handle.id(), number, total);
        let prompt = task_prompt(
            self.submission.subject,
            self.submission.layout,
            &format!("student {number}"),
            unit.page_count(),
            self.submission.prompt.as_deref(),
        );

        match self
            .invoker
            .grade_file(&self.system_instruction, &unit.output, PDF_MIME, &prompt)
            .await
        {
            Ok(doc) => {
                handle.record_result(unit.index, doc.json);
                handle.increment_processed();
                self.progress.on_unit_complete(handle.id(), number, total);
                Ok(())
            }
            Err(e) => {
                warn!("Task {}: student {number} failed: {e}", handle.id());
                self.progress
                    .on_unit_error(handle.id(), number, total, &e.to_string());
                Err(e)
            }
        }
    }

    async fn grade_single(self, handle: TaskHandle) -> Result<Option<String>, GraderError> {
        handle.set_total_students(1);
        self.progress.on_task_start(handle.id(), 1);
        self.progress.on_unit_start(handle.id(), 1, 1);

        let page_count = if self.mime_type == PDF_MIME {
            self.pdf_page_count().await
        } else {
            1
        };
        let prompt = task_prompt(
            self.submission.subject,
            self.submission.layout,
            &display_name(&self.submission.path),
            page_count,
            self.submission.prompt.as_deref(),
        );

        match self
            .invoker
            .grade_file(
                &self.system_instruction,
                &self.submission.path,
                self.mime_type,
                &prompt,
            )
            .await
        {
            Ok(doc) => {
                handle.record_result(0, doc.json);
                handle.increment_processed();
                self.progress.on_unit_complete(handle.id(), 1, 1);
                self.progress.on_task_complete(handle.id(), 1, 1);
                Ok(None)
            }
            Err(e) => {
                self.progress.on_unit_error(handle.id(), 1, 1, &e.to_string());
                self.progress.on_task_complete(handle.id(), 1, 0);
                Err(GraderError::Grading(e))
            }
        }
    }

    /// Page count for the prompt; an unreadable count only loses the
    /// multi-page note.
    async fn pdf_page_count(&self) -> usize {
        let toolkit = Arc::clone(&self.toolkit);
        let path = self.submission.path.clone();
        match tokio::task::spawn_blocking(move || toolkit.page_count(&path)).await {
            Ok(Ok(n)) if n > 0 => n,
            Ok(Ok(_)) => 1,
            Ok(Err(e)) => {
                debug!("page count unavailable: {e}");
                1
            }
            Err(e) => {
                debug!("page count task failed: {e}");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_builder_sets_fields() {
        let s = Submission::new("hw.pdf")
            .subject(Subject::Math)
            .layout(Layout::Double)
            .pages_per_student(2)
            .prompt("grade question 1");
        assert_eq!(s.subject, Subject::Math);
        assert_eq!(s.layout, Layout::Double);
        assert_eq!(s.pages_per_student, Some(2));
        assert_eq!(s.prompt.as_deref(), Some("grade question 1"));
    }

    #[test]
    fn dedup_key_depends_on_subject() {
        let a = dedup_key(&Submission::new("/nonexistent/hw.pdf").subject(Subject::Math));
        let b = dedup_key(&Submission::new("/nonexistent/hw.pdf").subject(Subject::English));
        assert_ne!(a, b);
        assert!(a.ends_with("|math"));
    }

    #[test]
    fn display_name_is_file_name() {
        assert_eq!(display_name(Path::new("/srv/uploads/a.png")), "a.png");
    }
}
