use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Attempts before giving up (at least one attempt is always made)
    pub max_attempts: u32,
    /// Delay after the first failure, doubled on each further failure
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Retry an async operation with exponential backoff
///
/// # Arguments
/// * `f` - Produces a fresh attempt each time it is called
/// * `backoff` - Attempt count and delay schedule
/// * `operation_name` - Human-readable name for logging
#[cfg(feature = "async")]
pub async fn retry_with_backoff_async<F, Fut, T, E>(
    mut f: F,
    backoff: &Backoff,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 < max_attempts => {
                let delay = backoff.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    operation_name,
                    max_attempts,
                    e
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Backoff {
        Backoff {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let backoff = Backoff::default();

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        // 100ms * 2^5 = 3.2s, capped
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(2));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = retry_with_backoff_async(
            || {
                calls += 1;
                let current = calls;
                async move { if current < 3 { Err(format!("fail {current}")) } else { Ok(current) } }
            },
            &fast(),
            "flaky op",
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_retry_gives_up_with_last_error() {
        let mut calls = 0;
        let result: Result<(), String> = retry_with_backoff_async(
            || {
                calls += 1;
                let current = calls;
                async move { Err(format!("fail {current}")) }
            },
            &fast(),
            "broken op",
        )
        .await;
        assert_eq!(result, Err("fail 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let backoff = Backoff {
            max_attempts: 0,
            ..fast()
        };
        let mut calls = 0;
        let _: Result<(), &str> = retry_with_backoff_async(
            || {
                calls += 1;
                async { Err("nope") }
            },
            &backoff,
            "single shot",
        )
        .await;
        assert_eq!(calls, 1);
    }
}
