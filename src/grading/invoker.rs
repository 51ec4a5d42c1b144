//! Grade one file: retrying model call, then response validation.
//!
//! ## Attempt loop
//!
//! Each attempt re-reads the file from disk, so a file deleted between
//! attempts surfaces as [`GradeError::FileVanished`] instead of a replay of
//! stale bytes. Each attempt also gets a slightly longer deadline than the
//! one before (`api_timeout + attempt * api_timeout_step`), since a timeout
//! on a large multi-page PDF is the most common transient failure.
//!
//! | outcome | retried? |
//! |---------|----------|
//! | network / rate limit / timeout / empty reply | yes, with backoff |
//! | policy rejection | no, fails at once |
//! | file vanished | no |
//!
//! ## Validation
//!
//! The reply must parse as a [`GradingResult`]. If it does not, it goes
//! through [`repair_json`] once; if that still fails the unit is
//! [`GradeError::InvalidResponseFormat`]. Invalid replies are not retried.

use super::backend::{BackendError, GradingBackend, GradingRequest};
use super::repair::{repair_json, strip_code_fences};
use super::result::GradingResult;
use super::retry::{RetryError, RetryPolicy, Sleeper, TokioSleeper};
use crate::config::GraderConfig;
use crate::error::GradeError;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A validated grading result for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct GradedDocument {
    pub result: GradingResult,
    /// `result` re-serialised; this is what gets stored on the task.
    pub json: String,
    pub attempts: u32,
    /// Whether the reply needed [`repair_json`] to parse.
    pub repaired: bool,
    pub duration_ms: u64,
}

/// Calls a [`GradingBackend`] under a [`RetryPolicy`].
#[derive(Clone)]
pub struct GradingInvoker {
    backend: Arc<dyn GradingBackend>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    api_timeout: Duration,
    api_timeout_step: Duration,
}

impl GradingInvoker {
    pub fn new(backend: Arc<dyn GradingBackend>, config: &GraderConfig) -> Self {
        Self {
            backend,
            policy: config.retry_policy(),
            sleeper: Arc::new(TokioSleeper),
            api_timeout: config.api_timeout,
            api_timeout_step: config.api_timeout_step,
        }
    }

    /// Replace the timer used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn deadline(&self, attempt: u32) -> Duration {
        self.api_timeout
            .saturating_add(self.api_timeout_step.saturating_mul(attempt))
    }

    /// Grade the file at `path`.
    pub async fn grade_file(
        &self,
        system_instruction: &str,
        path: &Path,
        mime_type: &str,
        prompt: &str,
    ) -> Result<GradedDocument, GradeError> {
        let start = Instant::now();
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => {
                return Err(GradeError::InvalidInput {
                    detail: "file is empty".into(),
                })
            }
            Err(e) => {
                return Err(GradeError::InvalidInput {
                    detail: e.to_string(),
                })
            }
        }

        let template = GradingRequest {
            system_instruction: system_instruction.to_string(),
            prompt: prompt.to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mime_type: mime_type.to_string(),
            payload: Vec::new(),
        };

        let outcome = self
            .policy
            .run(self.sleeper.as_ref(), GradeError::is_retryable, |attempt| {
                let backend = Arc::clone(&self.backend);
                let mut request = template.clone();
                let deadline = self.deadline(attempt);
                async move {
                    request.payload = read_payload(path, attempt).await?;
                    call_backend(backend.as_ref(), &request, attempt, deadline).await
                }
            })
            .await;

        let (raw, attempts) = match outcome {
            Ok(raw) => raw,
            Err(RetryError { attempts, error }) => {
                let error = match error {
                    GradeError::TransientModelFailure { detail, .. } => {
                        GradeError::TransientModelFailure { attempts, detail }
                    }
                    other => other,
                };
                warn!("{}: grading failed after {attempts} attempts: {error}", template.file_name);
                return Err(error);
            }
        };

        let (result, repaired) = parse_response(&raw)?;
        let json = serde_json::to_string(&result).map_err(|e| GradeError::InvalidResponseFormat {
            detail: e.to_string(),
        })?;
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "{}: graded {} answers in {} attempt(s), {}ms{}",
            template.file_name,
            result.answers.len(),
            attempts,
            duration_ms,
            if repaired { " (repaired)" } else { "" }
        );

        Ok(GradedDocument {
            result,
            json,
            attempts,
            repaired,
            duration_ms,
        })
    }
}

/// Attempt 0 treats a missing file as bad input; later attempts as a file
/// that vanished mid-flight.
async fn read_payload(path: &Path, attempt: u32) -> Result<Vec<u8>, GradeError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        Ok(_) | Err(_) if attempt > 0 => {
            warn!("{} disappeared before attempt {}", path.display(), attempt + 1);
            Err(GradeError::FileVanished { attempt })
        }
        Ok(_) => Err(GradeError::InvalidInput {
            detail: "file is empty".into(),
        }),
        Err(e) => Err(GradeError::InvalidInput {
            detail: e.to_string(),
        }),
    }
}

async fn call_backend(
    backend: &dyn GradingBackend,
    request: &GradingRequest,
    attempt: u32,
    deadline: Duration,
) -> Result<(String, u32), GradeError> {
    debug!(
        "{}: attempt {} via {} (deadline {:?})",
        request.file_name,
        attempt + 1,
        backend.name(),
        deadline
    );
    let transient = |detail: String| GradeError::TransientModelFailure {
        attempts: attempt + 1,
        detail,
    };
    match tokio::time::timeout(deadline, backend.grade(request)).await {
        Err(_) => Err(transient(format!("no reply within {deadline:?}"))),
        Ok(Err(BackendError::PolicyRejected(detail))) => {
            warn!("{}: rejected by content policy", request.file_name);
            Err(GradeError::ContentPolicyRejected { detail })
        }
        Ok(Err(BackendError::Transient(detail))) => Err(transient(detail)),
        Ok(Ok(text)) if text.trim().is_empty() => Err(transient("empty response".into())),
        Ok(Ok(text)) => Ok((text, attempt + 1)),
    }
}

/// Parse a model reply, repairing it once if needed.
pub fn parse_response(raw: &str) -> Result<(GradingResult, bool), GradeError> {
    if let Ok(result) = serde_json::from_str::<GradingResult>(&strip_code_fences(raw)) {
        return Ok((result, false));
    }
    let repaired = repair_json(raw);
    serde_json::from_str::<GradingResult>(&repaired)
        .map(|result| (result, true))
        .map_err(|e| GradeError::InvalidResponseFormat {
            detail: e.to_string(),
        })
}

/// MIME type for an upload, from its extension and confirmed by its header
/// bytes.
pub fn detect_mime_type(path: &Path) -> Result<&'static str, GradeError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match extension.as_str() {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => return Err(GradeError::UnsupportedFileType { extension }),
    };

    let mut header = Vec::with_capacity(16);
    std::fs::File::open(path)
        .and_then(|f| f.take(16).read_to_end(&mut header))
        .map_err(|e| GradeError::InvalidInput {
            detail: e.to_string(),
        })?;

    let content_matches = match mime {
        "application/pdf" => header.starts_with(b"%PDF"),
        _ => matches!(
            (image::guess_format(&header), mime),
            (Ok(image::ImageFormat::Jpeg), "image/jpeg") | (Ok(image::ImageFormat::Png), "image/png")
        ),
    };
    if content_matches {
        Ok(mime)
    } else {
        Err(GradeError::UnsupportedFileType {
            extension: format!("{extension} (content does not match)"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_reply_needs_no_repair() {
        let (r, repaired) =
            parse_response(r#"{"answers":[{"questionNumber":"1","studentAnswer":"a"}]}"#).unwrap();
        assert!(!repaired);
        assert_eq!(r.answers.len(), 1);
    }

    #[test]
    fn fenced_reply_needs_no_repair() {
        let (_, repaired) = parse_response("```json\n{\"answers\":[]}\n```").unwrap();
        assert!(!repaired);
    }

    #[test]
    fn truncated_reply_is_repaired() {
        let (r, repaired) =
            parse_response(r#"Sure! {"answers":[{"questionNumber":"1","studentAnswer":"a"},"#).unwrap();
        assert!(repaired);
        assert_eq!(r.answers[0].question_number, "1");
    }

    #[test]
    fn prose_reply_is_invalid() {
        assert!(matches!(
            parse_response("I cannot read this image."),
            Err(GradeError::InvalidResponseFormat { .. })
        ));
    }

    #[test]
    fn mime_from_extension_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("a.PDF");
        std::fs::write(&pdf, b"%PDF-1.7\n...").unwrap();
        assert_eq!(detect_mime_type(&pdf), Ok("application/pdf"));

        let png = dir.path().join("b.png");
        std::fs::write(&png, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap();
        assert_eq!(detect_mime_type(&png), Ok("image/png"));

        let fake = dir.path().join("c.jpg");
        std::fs::write(&fake, b"not really a jpeg").unwrap();
        assert!(matches!(
            detect_mime_type(&fake),
            Err(GradeError::UnsupportedFileType { .. })
        ));

        let doc = dir.path().join("d.docx");
        std::fs::write(&doc, b"PK").unwrap();
        assert_eq!(
            detect_mime_type(&doc),
            Err(GradeError::UnsupportedFileType {
                extension: "docx".into()
            })
        );
    }

    #[test]
    fn deadline_grows_per_attempt() {
        let config = GraderConfig::builder()
            .api_timeout(Duration::from_secs(10))
            .api_timeout_step(Duration::from_secs(5))
            .build()
            .unwrap();
        let invoker = GradingInvoker::new(Arc::new(super::super::backend::MockGradingBackend), &config);
        assert_eq!(invoker.deadline(0), Duration::from_secs(10));
        assert_eq!(invoker.deadline(2), Duration::from_secs(20));
    }
}
