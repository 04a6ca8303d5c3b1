//! Bounded retry for merge batch writes
//!
//! A failed batch is replayed as a whole transaction after an exponential,
//! jittered pause. Only failures the caller classifies as transient are
//! replayed; the merge engine itself never retries.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff policy for replaying a write transaction
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Replays after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Pause before the first replay
    pub initial_delay: Duration,
    /// Upper bound on any single pause
    pub max_delay: Duration,
    /// Fraction of each pause that is randomized (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::database()
    }
}

impl RetryConfig {
    /// Short pauses, for local SQLite files and tests
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            jitter: 0.3,
        }
    }

    /// Warehouse write transactions
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }

    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::fast()
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Pause before replay number `replay` (0-indexed).
    ///
    /// Doubles per replay up to `max_delay`; the jittered share is drawn
    /// uniformly, so the pause never exceeds the capped value.
    pub fn delay_for_attempt(&self, replay: u32) -> Duration {
        let doubled = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(replay.min(31)));
        let capped = doubled.min(self.max_delay);

        if self.jitter <= 0.0 {
            return capped;
        }

        let fixed = capped.mul_f64(1.0 - self.jitter);
        let spread = capped.saturating_sub(fixed);
        let drawn = rand::thread_rng().gen_range(0.0..=1.0);
        fixed + spread.mul_f64(drawn)
    }
}

/// Replays a fallible operation according to a [`RetryConfig`]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, replaying failures accepted by `is_transient`.
    ///
    /// Returns the first success or the last failure.
    pub async fn run<F, Fut, T, E, P>(
        &self,
        context: &str,
        operation: F,
        is_transient: P,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let started = Instant::now();
        let mut replays = 0u32;

        loop {
            match operation().await {
                Ok(value) => {
                    if replays > 0 {
                        tracing::info!(
                            context,
                            replays,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "write committed after replay"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if replays < self.config.max_retries && is_transient(&e) => {
                    let delay = self.config.delay_for_attempt(replays);
                    replays += 1;
                    tracing::warn!(
                        context,
                        replay = replays,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient write failure; replaying transaction"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if replays > 0 {
                        tracing::warn!(
                            context,
                            replays,
                            error = %e,
                            "write failed after replays"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Whether a storage error is transient.
///
/// Covers PostgreSQL serialization failures, deadlocks, connection loss and
/// operator intervention, plus SQLite BUSY/LOCKED.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            matches!(code.as_ref(), "40001" | "40P01" | "5" | "6" | "261" | "262" | "517")
                || code.starts_with("08")
                || code.starts_with("57")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let config = RetryConfig::database();
        for replay in 0..12 {
            let delay = config.delay_for_attempt(replay);
            assert!(delay <= config.max_delay);
            assert!(delay >= config.initial_delay.mul_f64(0.5).min(config.max_delay.mul_f64(0.5)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replays_transient_failures() {
        let calls = AtomicU32::new(0);
        let retry = Retry::new(RetryConfig::fast().with_max_retries(5));

        let result: Result<u32, &str> = retry
            .run(
                "test",
                || async {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Err("busy"),
                        n => Ok(n),
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let retry = Retry::new(RetryConfig::fast().with_max_retries(2));

        let result: Result<(), &str> = retry
            .run(
                "test",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("busy")
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Err("busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_replayed() {
        let calls = AtomicU32::new(0);
        let retry = Retry::new(RetryConfig::fast());

        let result = retry
            .run(
                "test",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(sqlx::Error::RowNotFound)
                },
                is_retryable_db_error,
            )
            .await;

        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_retryable_db_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_retryable_db_error(&sqlx::Error::PoolClosed));
        assert!(!is_retryable_db_error(&sqlx::Error::RowNotFound));
        assert_eq!(RetryConfig::none().max_retries, 0);
    }
}
