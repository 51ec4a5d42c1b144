//! Grading: one file in, one validated [`GradingResult`] out.
//!
//! ```text
//! file ──► GradingInvoker ──► GradingBackend (LLM or mock)
//!               │  retry + backoff, FileVanished re-check
//!               ▼
//!          parse, else repair_json, else InvalidResponseFormat
//! ```

pub mod backend;
pub mod invoker;
pub mod repair;
pub mod result;
pub mod retry;

pub use backend::{
    backend_from_config, BackendError, GradingBackend, GradingRequest, LlmGradingBackend,
    MockGradingBackend,
};
pub use invoker::{detect_mime_type, parse_response, GradedDocument, GradingInvoker};
pub use repair::repair_json;
pub use result::{Answer, GradingResult, Score};
pub use retry::{RetryError, RetryPolicy, Sleeper, TokioSleeper};
