//! Configuration for the grading service.
//!
//! Every tunable of the queue, the splitter and the grading invoker lives in
//! [`GraderConfig`], built via [`GraderConfigBuilder`]. Callers set only what
//! they care about and rely on the documented defaults for the rest.

use crate::error::GraderError;
use crate::grading::retry::RetryPolicy;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a grading service instance.
///
/// # Example
/// ```rust
/// use homework_grader::GraderConfig;
/// use std::time::Duration;
///
/// let config = GraderConfig::builder()
///     .worker_count(8)
///     .max_attempts(3)
///     .retry_base_delay(Duration::from_millis(500))
///     .build()
///     .unwrap();
/// assert_eq!(config.worker_count, 8);
/// ```
#[derive(Clone)]
pub struct GraderConfig {
    /// Number of pool workers consuming dispatched tasks. Default: 5.
    pub worker_count: usize,

    /// Dispatched-but-unclaimed tasks the queue buffers before `dispatch`
    /// waits for capacity. Default: 100.
    pub queue_capacity: usize,

    /// Total attempts per grading call, first included. Default: 5.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles for each later one. Default: 2 s.
    pub retry_base_delay: Duration,

    /// Upper bound for any single backoff wait, jitter included. Default: 60 s.
    pub retry_max_delay: Duration,

    /// Random extra delay added to each backoff, drawn from `0..=retry_jitter`.
    /// Default: 5 s.
    pub retry_jitter: Duration,

    /// Deadline for the first model call. Default: 120 s.
    pub api_timeout: Duration,

    /// Added to the deadline for each retry, so larger documents that timed
    /// out once get more room. Default: 30 s.
    pub api_timeout_step: Duration,

    /// Root of the upload area. Split sessions go to `<upload_root>/split`.
    /// Default: `uploads`.
    pub upload_root: PathBuf,

    /// Largest accepted upload in bytes. Default: 50 MiB.
    pub max_upload_bytes: u64,

    /// How long finished tasks are kept before cleanup. Default: 24 h.
    pub task_retention: Duration,

    /// Period of the cleanup janitor. Default: 1 h.
    pub cleanup_interval: Duration,

    /// Fail a split when a student document has the wrong page count instead
    /// of logging a warning. Default: false.
    pub strict_page_count: bool,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens the model may generate per document. Default: 8192.
    pub max_tokens: usize,

    /// Grade with canned per-subject results instead of calling a model.
    /// Default: false.
    pub mock_grading: bool,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            queue_capacity: 100,
            max_attempts: 5,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
            retry_jitter: Duration::from_secs(5),
            api_timeout: Duration::from_secs(120),
            api_timeout_step: Duration::from_secs(30),
            upload_root: PathBuf::from("uploads"),
            max_upload_bytes: 50 * 1024 * 1024,
            task_retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            strict_page_count: false,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.2,
            max_tokens: 8192,
            mock_grading: false,
        }
    }
}

impl fmt::Debug for GraderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraderConfig")
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("retry_jitter", &self.retry_jitter)
            .field("api_timeout", &self.api_timeout)
            .field("upload_root", &self.upload_root)
            .field("strict_page_count", &self.strict_page_count)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("mock_grading", &self.mock_grading)
            .finish()
    }
}

impl GraderConfig {
    /// Create a new builder for `GraderConfig`.
    pub fn builder() -> GraderConfigBuilder {
        GraderConfigBuilder {
            config: Self::default(),
        }
    }

    /// The retry policy shared by every grading call.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            jitter: self.retry_jitter,
        }
    }

    /// Directory that holds one sub-directory per split session.
    pub fn split_root(&self) -> PathBuf {
        self.upload_root.join("split")
    }
}

/// Builder for [`GraderConfig`].
#[derive(Debug)]
pub struct GraderConfigBuilder {
    config: GraderConfig,
}

impl GraderConfigBuilder {
    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.worker_count = n.max(1);
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.queue_capacity = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_base_delay(mut self, d: Duration) -> Self {
        self.config.retry_base_delay = d;
        self
    }

    pub fn retry_max_delay(mut self, d: Duration) -> Self {
        self.config.retry_max_delay = d;
        self
    }

    pub fn retry_jitter(mut self, d: Duration) -> Self {
        self.config.retry_jitter = d;
        self
    }

    pub fn api_timeout(mut self, d: Duration) -> Self {
        self.config.api_timeout = d;
        self
    }

    pub fn api_timeout_step(mut self, d: Duration) -> Self {
        self.config.api_timeout_step = d;
        self
    }

    pub fn upload_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.upload_root = root.into();
        self
    }

    pub fn max_upload_bytes(mut self, n: u64) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn task_retention(mut self, d: Duration) -> Self {
        self.config.task_retention = d;
        self
    }

    pub fn cleanup_interval(mut self, d: Duration) -> Self {
        self.config.cleanup_interval = d;
        self
    }

    pub fn strict_page_count(mut self, v: bool) -> Self {
        self.config.strict_page_count = v;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn mock_grading(mut self, v: bool) -> Self {
        self.config.mock_grading = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GraderConfig, GraderError> {
        let c = &self.config;
        if c.worker_count == 0 {
            return Err(GraderError::InvalidConfig(
                "worker_count must be ≥ 1".into(),
            ));
        }
        if c.max_attempts == 0 {
            return Err(GraderError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.retry_base_delay > c.retry_max_delay {
            return Err(GraderError::InvalidConfig(format!(
                "retry_base_delay ({:?}) exceeds retry_max_delay ({:?})",
                c.retry_base_delay, c.retry_max_delay
            )));
        }
        if c.max_upload_bytes == 0 {
            return Err(GraderError::InvalidConfig(
                "max_upload_bytes must be > 0".into(),
            ));
        }
        if c.api_timeout.is_zero() {
            return Err(GraderError::InvalidConfig(
                "api_timeout must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_limits() {
        let c = GraderConfig::default();
        assert_eq!(c.worker_count, 5);
        assert_eq!(c.queue_capacity, 100);
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.retry_max_delay, Duration::from_secs(60));
        assert_eq!(c.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(c.split_root(), PathBuf::from("uploads/split"));
    }

    #[test]
    fn setters_clamp() {
        let c = GraderConfig::builder()
            .worker_count(0)
            .max_attempts(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.worker_count, 1);
        assert_eq!(c.max_attempts, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn base_delay_above_cap_is_rejected() {
        let err = GraderConfig::builder()
            .retry_base_delay(Duration::from_secs(120))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraderError::InvalidConfig(_)));
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let c = GraderConfig::builder()
            .max_attempts(3)
            .retry_jitter(Duration::ZERO)
            .build()
            .unwrap();
        let p = c.retry_policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.jitter, Duration::ZERO);
        assert_eq!(p.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn debug_hides_provider() {
        let s = format!("{:?}", GraderConfig::default());
        assert!(s.contains("GraderConfig"));
        assert!(s.contains("provider: None"));
    }
}
