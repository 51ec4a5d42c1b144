//! The multimodal grading backend seam.
//!
//! [`GradingBackend`] takes a rubric, a file payload and a prompt and returns
//! free text that should parse as a grading result. Two implementations:
//!
//! * [`LlmGradingBackend`] sends the file as a base64 attachment through
//!   `edgequake-llm`, so any vision-capable provider it supports can grade.
//! * [`MockGradingBackend`] returns canned per-subject results. Choosing it
//!   is a configuration decision made when the service is built, so tests
//!   and demos never flip process-wide state.

use crate::config::GraderConfig;
use crate::error::GraderError;
use crate::prompts::Subject;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Everything the backend needs for one call.
#[derive(Debug, Clone)]
pub struct GradingRequest {
    pub system_instruction: String,
    pub prompt: String,
    pub file_name: String,
    pub mime_type: String,
    pub payload: Vec<u8>,
}

/// Backend failures, split by whether a retry can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Network, rate-limit, timeout, empty-response and other passing faults.
    #[error("{0}")]
    Transient(String),

    /// The provider's safety filter refused the content.
    #[error("content rejected by provider policy: {0}")]
    PolicyRejected(String),
}

/// A multimodal model that grades one file.
#[async_trait]
pub trait GradingBackend: Send + Sync {
    async fn grade(&self, request: &GradingRequest) -> Result<String, BackendError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Build the backend selected by the configuration.
pub fn backend_from_config(config: &GraderConfig) -> Result<Arc<dyn GradingBackend>, GraderError> {
    if config.mock_grading {
        return Ok(Arc::new(MockGradingBackend));
    }
    let provider = resolve_provider(config)?;
    Ok(Arc::new(LlmGradingBackend::new(provider, config)))
}

/// Provider precedence: explicit instance, then name + model, then the
/// `EDGEQUAKE_LLM_PROVIDER` / `EDGEQUAKE_MODEL` pair, then auto-detection.
fn resolve_provider(config: &GraderConfig) -> Result<Arc<dyn LLMProvider>, GraderError> {
    if let Some(provider) = &config.provider {
        return Ok(Arc::clone(provider));
    }
    if let Some(name) = &config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }
    if let (Ok(name), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !name.is_empty() && !model.is_empty() {
            return create_provider(&name, &model);
        }
    }
    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| {
        GraderError::InvalidConfig(format!(
            "no LLM provider could be auto-detected ({e}); set GEMINI_API_KEY, \
             OPENAI_API_KEY or pass a provider name"
        ))
    })?;
    Ok(llm)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, GraderError> {
    ProviderFactory::create_llm_provider(name, model)
        .map_err(|e| GraderError::InvalidConfig(format!("LLM provider '{name}' is not configured: {e}")))
}

// ── edgequake-llm backend ────────────────────────────────────────────────

/// Grades through any `edgequake-llm` vision provider.
pub struct LlmGradingBackend {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmGradingBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &GraderConfig) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl GradingBackend for LlmGradingBackend {
    async fn grade(&self, request: &GradingRequest) -> Result<String, BackendError> {
        let attachment = ImageData::new(STANDARD.encode(&request.payload), request.mime_type.as_str())
            .with_detail("high");
        let messages = vec![
            ChatMessage::system(request.system_instruction.as_str()),
            ChatMessage::user_with_images(
                format!(
                    "Please grade the homework in the attached file ({}).\n\n{}",
                    request.file_name, request.prompt
                ),
                vec![attachment],
            ),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            request.file_name, response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }

    fn name(&self) -> &str {
        "llm"
    }
}

/// Providers report safety refusals as ordinary API errors; recognise them
/// by message.
pub fn classify_provider_error(message: &str) -> BackendError {
    const POLICY_MARKERS: [&str; 6] = [
        "content_filter",
        "content filter",
        "safety",
        "blocked",
        "policy",
        "prohibited",
    ];
    let lower = message.to_ascii_lowercase();
    if POLICY_MARKERS.iter().any(|m| lower.contains(m)) {
        BackendError::PolicyRejected(message.to_string())
    } else {
        BackendError::Transient(message.to_string())
    }
}

// ── Mock backend ─────────────────────────────────────────────────────────

/// Returns a canned result for the subject named in the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockGradingBackend;

#[async_trait]
impl GradingBackend for MockGradingBackend {
    async fn grade(&self, request: &GradingRequest) -> Result<String, BackendError> {
        let subject = Subject::detect(&request.prompt);
        debug!("mock grading {} as {}", request.file_name, subject);
        Ok(mock_result(subject).to_string())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn mock_result(subject: Subject) -> &'static str {
    match subject {
        Subject::English => {
            r#"{
  "answers": [
    {"questionNumber": "1", "studentAnswer": "He is a doctor", "isCorrect": true,
     "explanation": "Correct answer with correct grammar"},
    {"questionNumber": "2", "studentAnswer": "They are student", "isCorrect": false,
     "correctAnswer": "They are students", "explanation": "The plural noun needs an s"},
    {"questionNumber": "3", "studentAnswer": "I am 12 years old", "isCorrect": true,
     "explanation": "Age is expressed correctly"}
  ],
  "overallScore": "85",
  "feedback": "Most answers are correct. Watch singular and plural nouns."
}"#
        }
        Subject::Math => {
            r#"{
  "answers": [
    {"questionNumber": "1", "studentAnswer": "x = 5", "isCorrect": true,
     "explanation": "Equation solved correctly"},
    {"questionNumber": "2", "studentAnswer": "30 cm²", "isCorrect": false,
     "correctAnswer": "28 cm²", "correctSteps": "area = 4 × 7 = 28 cm²",
     "explanation": "Multiplication error: 4 × 7 is 28"},
    {"questionNumber": "3", "studentAnswer": "64", "isCorrect": true,
     "explanation": "8 squared is 64"}
  ],
  "overallScore": "80",
  "feedback": "Concepts are understood; check calculations more carefully."
}"#
        }
        Subject::Chinese => {
            r#"{
  "answers": [
    {"questionNumber": "1", "studentAnswer": "春风又绿江南岸，明月何时照我还",
     "evaluation": "Recited correctly", "suggestion": "Reflect on the homesickness in the line"},
    {"questionNumber": "2", "studentAnswer": "欲穷千里目，更上一层天",
     "evaluation": "Wrong character: 天 should be 楼", "suggestion": "Recite more precisely"},
    {"questionNumber": "3", "studentAnswer": "这篇文章主要讲述了作者童年的回忆",
     "evaluation": "Theme identified, answer lacks detail", "suggestion": "Cite key events"}
  ],
  "overallScore": "88",
  "feedback": "Good understanding overall; recitation needs more accuracy."
}"#
        }
        Subject::General => {
            r#"{
  "answers": [
    {"questionNumber": "1", "studentAnswer": "First answer", "evaluation": "Mostly correct"},
    {"questionNumber": "2", "studentAnswer": "Second answer", "evaluation": "Small mistakes to fix"},
    {"questionNumber": "3", "studentAnswer": "Third answer", "evaluation": "Fully correct"}
  ],
  "feedback": "Good overall; pay more attention to details."
}"#
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::result::GradingResult;

    #[test]
    fn content_filter_is_policy_rejection() {
        assert!(matches!(
            classify_provider_error("API error: finish_reason=content_filter"),
            BackendError::PolicyRejected(_)
        ));
        assert!(matches!(
            classify_provider_error("Response blocked due to SAFETY"),
            BackendError::PolicyRejected(_)
        ));
        assert!(matches!(
            classify_provider_error("HTTP 503 Service Unavailable"),
            BackendError::Transient(_)
        ));
    }

    #[test]
    fn mock_results_parse() {
        for subject in Subject::ALL {
            let parsed: GradingResult = serde_json::from_str(mock_result(subject))
                .unwrap_or_else(|e| panic!("{subject}: {e}"));
            assert_eq!(parsed.answers.len(), 3, "{subject}");
        }
    }

    #[tokio::test]
    async fn mock_backend_follows_prompt_subject() {
        let request = GradingRequest {
            system_instruction: String::new(),
            prompt: "This is math homework.".into(),
            file_name: "a.png".into(),
            mime_type: "image/png".into(),
            payload: vec![1, 2, 3],
        };
        let out = MockGradingBackend.grade(&request).await.unwrap();
        assert!(out.contains("x = 5"));
    }
}
