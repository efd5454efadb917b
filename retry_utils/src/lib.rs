use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup, 5xx, broker busy - retry with the normal schedule
    Transient,
    /// 429 from an upstream API - retry with a doubled delay
    RateLimited,
    /// Bad request, auth failure, decode error - never retry
    Permanent,
}

/// Exponential backoff schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Schedule without sleeping between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32, class: ErrorClass) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let mut delay = self.base_delay.saturating_mul(factor);
        if class == ErrorClass::RateLimited {
            delay = delay.saturating_mul(2);
        }
        delay.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// retries are exhausted. The last error is returned.
pub async fn retry_async<F, Fut, T, E>(
    label: &str,
    policy: &RetryPolicy,
    mut operation: F,
    classify: impl Fn(&E) -> ErrorClass,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!("{} succeeded after {} retries", label, retry);
                }
                return Ok(value);
            }
            Err(e) => {
                let class = classify(&e);
                if class == ErrorClass::Permanent || retry >= policy.max_retries {
                    return Err(e);
                }

                let delay = policy.delay_for(retry, class);
                warn!(
                    "{} failed (attempt {}/{}): {} - retrying in {}ms",
                    label,
                    retry + 1,
                    policy.max_retries + 1,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0, ErrorClass::Transient), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, ErrorClass::Transient), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1, ErrorClass::RateLimited), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4, ErrorClass::Transient), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = retry_async(
            "permanent",
            &RetryPolicy::immediate(3),
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError("bad request"))
            },
            |_| ErrorClass::Permanent,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = retry_async(
            "flaky",
            &RetryPolicy::immediate(3),
            move || async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TestError("connection reset"))
                } else {
                    Ok(n)
                }
            },
            |_| ErrorClass::Transient,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = retry_async(
            "down",
            &RetryPolicy::immediate(2),
            move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError("503"))
            },
            |_| ErrorClass::RateLimited,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
