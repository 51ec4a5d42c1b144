//! Shared fakes for the integration tests.
//!
//! `FakeToolkit` treats a "PDF" as a text file: a `%PDF-fake` header line
//! followed by one `page N` line per page. Every primitive can be told to
//! fail, so each rung of the splitter's fallback ladder can be reached
//! without pdfium.

#![allow(dead_code)]

use async_trait::async_trait;
use homework_grader::grading::{BackendError, GradingBackend, GradingRequest, Sleeper};
use homework_grader::split::{PdfToolkit, ToolkitError};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ── PDF fakes ────────────────────────────────────────────────────────────

const HEADER: &str = "%PDF-fake";

/// Write a fake PDF with pages `1..=pages`.
pub fn write_fake_pdf(path: &Path, pages: usize) {
    let labels: Vec<usize> = (1..=pages).collect();
    write_pages(path, &labels);
}

fn write_pages(path: &Path, labels: &[usize]) {
    let mut body = String::from(HEADER);
    body.push('\n');
    for label in labels {
        body.push_str(&format!("page {label}\n"));
    }
    fs::write(path, body).expect("write fake pdf");
}

/// Page labels of a fake PDF, in order.
pub fn read_pages(path: &Path) -> Vec<usize> {
    fs::read_to_string(path)
        .expect("read fake pdf")
        .lines()
        .filter_map(|l| l.strip_prefix("page "))
        .map(|n| n.parse().expect("page label"))
        .collect()
}

#[derive(Default)]
pub struct FakeToolkit {
    /// `extract_range` returns an error.
    pub fail_bulk: bool,
    /// `extract_range` writes one file per page instead of one file.
    pub bulk_per_page: bool,
    /// `extract_range` silently drops the last page of the range.
    pub bulk_drops_last_page: bool,
    /// `extract_page` fails for these pages.
    pub failing_pages: HashSet<usize>,
    /// `extract_range` writes a zero-byte file for the range starting here.
    pub empty_range_at: Option<usize>,
    /// `merge` returns an error.
    pub fail_merge: bool,
    /// `merge` reports success without writing anything.
    pub merge_writes_nothing: bool,
    pub merges: AtomicUsize,
}

impl FakeToolkit {
    fn source_pages(&self, pdf: &Path) -> Result<Vec<usize>, ToolkitError> {
        let text = fs::read_to_string(pdf).map_err(|e| ToolkitError::new(e.to_string()))?;
        if !text.starts_with(HEADER) {
            return Err(ToolkitError::new("not a fake pdf"));
        }
        Ok(read_pages(pdf))
    }
}

impl PdfToolkit for FakeToolkit {
    fn page_count(&self, pdf: &Path) -> Result<usize, ToolkitError> {
        Ok(self.source_pages(pdf)?.len())
    }

    fn extract_range(
        &self,
        pdf: &Path,
        first: usize,
        last: usize,
        out_dir: &Path,
    ) -> Result<(), ToolkitError> {
        if self.fail_bulk {
            return Err(ToolkitError::new("bulk extraction unsupported"));
        }
        if self.empty_range_at == Some(first) {
            fs::write(out_dir.join(format!("pages_{first:04}-{last:04}.pdf")), b"")
                .map_err(|e| ToolkitError::new(e.to_string()))?;
            return Ok(());
        }
        let pages = self.source_pages(pdf)?;
        let mut wanted: Vec<usize> = pages[first - 1..last].to_vec();
        if self.bulk_drops_last_page && wanted.len() > 1 {
            wanted.pop();
        }
        if self.bulk_per_page {
            for label in &wanted {
                write_pages(&out_dir.join(format!("part_{label:04}.pdf")), &[*label]);
                // Distinct mtimes keep the merge order deterministic.
                std::thread::sleep(Duration::from_millis(15));
            }
        } else {
            write_pages(&out_dir.join(format!("pages_{first:04}-{last:04}.pdf")), &wanted);
        }
        Ok(())
    }

    fn extract_page(&self, pdf: &Path, page: usize, out_file: &Path) -> Result<(), ToolkitError> {
        if self.failing_pages.contains(&page) {
            return Err(ToolkitError::new(format!("page {page} is corrupt")));
        }
        let pages = self.source_pages(pdf)?;
        let label = pages
            .get(page - 1)
            .ok_or_else(|| ToolkitError::new(format!("no page {page}")))?;
        write_pages(out_file, &[*label]);
        Ok(())
    }

    fn merge(&self, inputs: &[PathBuf], out_file: &Path) -> Result<(), ToolkitError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        if self.fail_merge {
            return Err(ToolkitError::new("merge failed"));
        }
        if self.merge_writes_nothing {
            return Ok(());
        }
        let mut labels = Vec::new();
        for input in inputs {
            labels.extend(read_pages(input));
        }
        write_pages(out_file, &labels);
        Ok(())
    }
}

// ── Grading fakes ────────────────────────────────────────────────────────

pub const VALID_RESULT: &str =
    r#"{"answers":[{"questionNumber":"1","studentAnswer":"x = 5","isCorrect":true}],"overallScore":"100"}"#;

/// One scripted backend reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Transient(&'static str),
    Policy(&'static str),
    /// Sleep this long before answering with [`VALID_RESULT`].
    Slow(Duration),
}

/// Backend replaying a script, then repeating `fallback` forever.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    pub calls: AtomicUsize,
    /// Runs before each reply, e.g. to delete the file under grading.
    pub on_call: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Reply::Text(VALID_RESULT.to_string()),
            calls: AtomicUsize::new(0),
            on_call: None,
        }
    }

    pub fn always(reply: Reply) -> Self {
        Self {
            fallback: reply,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GradingBackend for ScriptedBackend {
    async fn grade(&self, _request: &GradingRequest) -> Result<String, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_call {
            hook(n);
        }
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Transient(msg) => Err(BackendError::Transient(msg.to_string())),
            Reply::Policy(msg) => Err(BackendError::PolicyRejected(msg.to_string())),
            Reply::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(VALID_RESULT.to_string())
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Backend that answers prose, never JSON, for every file named in
/// `bad_files`, and echoes the student number from the prompt otherwise.
pub struct SelectiveBackend {
    pub bad_files: HashSet<String>,
}

#[async_trait]
impl GradingBackend for SelectiveBackend {
    async fn grade(&self, request: &GradingRequest) -> Result<String, BackendError> {
        if self.bad_files.contains(&request.file_name) {
            Ok("I'm sorry, the handwriting on this page is illegible.".to_string())
        } else {
            let label = request
                .prompt
                .split_whitespace()
                .skip_while(|w| *w != "student")
                .nth(1)
                .unwrap_or("?")
                .trim_end_matches('.');
            Ok(format!(
                r#"{{"answers":[{{"questionNumber":"1","studentAnswer":"{label}"}}]}}"#
            ))
        }
    }
}

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}
