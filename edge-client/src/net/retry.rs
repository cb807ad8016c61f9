use std::future::Future;
use std::time::Duration;

use reqwest::{Response, StatusCode};
use tracing::{debug, warn};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            initial_delay,
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed): doubles each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Run `send` until it yields a success response, retrying network failures,
/// 5xx and 429 with exponential backoff. Any other non-success status is
/// returned immediately. When attempts run out the last error is returned.
pub async fn request_with_retry<F, Fut>(
    policy: RetryPolicy,
    mut send: F,
) -> Result<Response, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Response, reqwest::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        let error = match send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                TransportError::Status {
                    status: status.as_u16(),
                    body,
                }
            }
            Err(e) => TransportError::Network(e),
        };

        if !error.is_retryable() {
            debug!("Request failed with terminal error: {}", error);
            return Err(error);
        }

        if attempt >= policy.max_retries {
            warn!("Request failed after {} attempt(s): {}", attempt, error);
            return Err(error);
        }

        let delay = policy.delay_for(attempt);
        debug!(
            "Request attempt {} failed ({}), retrying in {:?}",
            attempt, error, delay
        );
        tokio::time::sleep(delay).await;
    }
}
