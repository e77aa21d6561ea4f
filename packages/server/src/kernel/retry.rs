//! Bounded exponential retry for external provider calls.
//!
//! Every outbound call to the mailbox, model, or extraction provider goes
//! through [`RetryPolicy::execute`]; no component carries its own ad-hoc
//! retry loop. A failure with a non-transient status code is surfaced
//! immediately, everything else is retried with capped exponential backoff
//! plus a small jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::common::ProviderError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first call.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Run `op`, retrying transient failures up to `retries` times.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_transient() || attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = self
                        .base_delay
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(self.max_delay);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient provider failure, retrying"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            retries: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast_policy()
            .execute(|| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ProviderError::Status {
                            status: 503,
                            message: "unavailable".into(),
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = fast_policy()
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Status {
                        status: 404,
                        message: "missing".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = fast_policy()
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Status {
                        status: 429,
                        message: "rate limited".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        // Initial call plus four retries.
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
