//! One retry/backoff policy shared by every grading call site.
//!
//! ## Backoff
//!
//! Retry `n` (1-based) waits `base * 2^(n-1)` plus a uniform jitter in
//! `0..=jitter`, and never more than `max_delay`. With the defaults
//! (2 s base, 5 s jitter, 60 s cap) five attempts wait roughly
//! 2 → 4 → 8 → 16 s plus jitter. Jitter spreads out the retries of the many
//! fan-out units that tend to fail together when the model is overloaded.
//!
//! Waiting goes through the [`Sleeper`] trait so tests can count and inspect
//! sleeps without spending wall-clock time.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_secs(5),
        }
    }
}

/// The last error once the policy gave up, and how many attempts were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub error: E,
}

impl RetryPolicy {
    /// Delay before retry `retry` (1-based) with the given jitter sample.
    pub fn backoff(&self, retry: u32, jitter: Duration) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .saturating_add(jitter);
        delay.min(self.max_delay)
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run `op` until it succeeds, returns an error `is_retryable` rejects,
    /// or attempts run out.
    ///
    /// `op` receives the 0-based attempt number, so it can do per-attempt
    /// work such as re-checking inputs or stretching its deadline.
    pub async fn run<T, E, Op, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        is_retryable: impl Fn(&E) -> bool,
        mut op: Op,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let attempts = attempt + 1;
                    if !is_retryable(&error) || attempts >= max_attempts {
                        return Err(RetryError { attempts, error });
                    }
                    let delay = self.backoff(attempts, self.sample_jitter());
                    warn!(
                        "Attempt {}/{} failed ({}); retrying in {:?}",
                        attempts, max_attempts, error, delay
                    );
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Something that can wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Waits on the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff(1, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(p.backoff(2, Duration::ZERO), Duration::from_secs(4));
        assert_eq!(p.backoff(4, Duration::ZERO), Duration::from_secs(16));
        assert_eq!(p.backoff(6, Duration::ZERO), Duration::from_secs(60));
        assert_eq!(p.backoff(40, Duration::ZERO), Duration::from_secs(60));
        assert_eq!(
            p.backoff(1, Duration::from_secs(3)),
            Duration::from_secs(5)
        );
        assert_eq!(
            p.backoff(5, Duration::from_secs(50)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = RetryPolicy {
            jitter: Duration::from_millis(250),
            ..policy(3)
        };
        for _ in 0..100 {
            assert!(p.sample_jitter() <= Duration::from_millis(250));
        }
        assert_eq!(policy(3).sample_jitter(), Duration::ZERO);
    }

    #[tokio::test]
    async fn two_transient_failures_then_success() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let out = policy(5)
            .run(&sleeper, |_: &String| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(format!("503 on attempt {attempt}"))
                    } else {
                        Ok("graded")
                    }
                }
            })
            .await;
        assert_eq!(out, Ok("graded"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeper.0.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let sleeper = RecordingSleeper::default();
        let out: Result<(), _> = policy(5)
            .run(&sleeper, |e: &&str| *e != "policy", |_| async { Err("policy") })
            .await;
        assert_eq!(
            out,
            Err(RetryError {
                attempts: 1,
                error: "policy"
            })
        );
        assert!(sleeper.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let sleeper = RecordingSleeper::default();
        let out: Result<(), _> = policy(3)
            .run(&sleeper, |_: &&str| true, |_| async { Err("down") })
            .await;
        assert_eq!(out.unwrap_err().attempts, 3);
        assert_eq!(sleeper.0.lock().unwrap().len(), 2);
    }
}
