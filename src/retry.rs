use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped, plus up to 50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = (capped.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "[RETRY] {} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StacError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));
        let tenth = policy.delay_for(10);
        assert!(tenth <= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transport_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::default()
            .run("search", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StacError::Transport("connection reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = RetryPolicy::default()
            .run("bulk", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StacError::Transport("503".into()))
            })
            .await;
        assert!(matches!(result, Err(StacError::Transport(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = RetryPolicy::default()
            .run("search", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StacError::InvalidQuery("bad".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
