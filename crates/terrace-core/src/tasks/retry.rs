use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Constant-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until the operation succeeds.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..Default::default()
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Run `operation` until it succeeds, sleeping `policy.interval` between
/// attempts. Returns the last error once the attempt bound is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "giving up"
                    );
                    return Err(e);
                }
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = policy.interval.as_millis() as u64,
                    "failed, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}
