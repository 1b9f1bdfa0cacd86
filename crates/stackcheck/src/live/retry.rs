use super::FetchError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Capped exponential backoff with jitter
///
/// The delay before retry `n` (1-based) is `base * 2^(n-1)`, capped at `max_backoff_ms`. With
/// jitter the actual delay is drawn uniformly from the upper half of that value. Only
/// [transient](FetchError::is_transient) errors are retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as u32;
        let capped = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);

        let millis = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    /// Runs `operation` until it succeeds, fails permanently or runs out of attempts
    ///
    /// Returns the final result and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> (Result<T, FetchError>, usize)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(attempt, ?delay, %error, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return (result, attempt),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            jitter: false,
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: false,
        };
        let delays = (1..=6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);

        assert_eq!(policy.delay_for_attempt(usize::MAX).as_millis(), 1_000);
    }

    #[test]
    fn jitter_stays_in_the_upper_half() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2).as_millis();
            assert!((200..=400).contains(&delay), "{delay}");
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = &AtomicUsize::new(0);
        let (result, attempts) = quick(4)
            .run(move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(FetchError::Throttled),
                    1 => Err(FetchError::Transient("connection reset".into())),
                    _ => Ok("done"),
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (result, attempts) = quick(4)
            .run(|| async { Err::<(), _>(FetchError::PermissionDenied("describe".into())) })
            .await;

        assert_eq!(result, Err(FetchError::PermissionDenied("describe".into())));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let (result, attempts) = quick(3)
            .run(|| async { Err::<(), _>(FetchError::Throttled) })
            .await;

        assert_eq!(result, Err(FetchError::Throttled));
        assert_eq!(attempts, 3);
    }
}
