use std::time::Duration;

use crate::resilience::{retry, BackoffSchedule, CircuitBreaker};
use crate::types::RelayCallback;

const SUBMIT_ATTEMPTS: usize = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_OPEN_FOR: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error, Clone)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend responded with status {0}")]
    Status(u16),
    #[error("circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },
}

impl BackendError {
    /// Retryable when the request itself failed, the breaker is open, or the
    /// backend responded 500-599 or 429.
    fn retryable(&self) -> bool {
        match self {
            BackendError::Request(_) | BackendError::CircuitOpen { .. } => true,
            BackendError::Status(status) => (500..=599).contains(status) || *status == 429,
        }
    }
}

/// Posts the terminal outcome callback to the backend, guarded by its own
/// `submit` circuit breaker, independent from any `pull`-side breaker.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    breaker: CircuitBreaker,
    backoff: BackoffSchedule,
}

impl BackendClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            base_url,
            token,
            breaker: CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_OPEN_FOR),
            backoff: BackoffSchedule::default_backend(),
        }
    }

    pub async fn post_callback(&self, callback: &RelayCallback) -> Result<(), BackendError> {
        retry(
            SUBMIT_ATTEMPTS,
            &self.backoff,
            None,
            |err: &BackendError, _attempt| err.retryable(),
            |err, attempt, sleep_ms| {
                tracing::warn!(attempt, sleep_ms, error = %err, "retrying backend callback");
            },
            |_attempt| self.try_once(callback),
        )
        .await
    }

    async fn try_once(&self, callback: &RelayCallback) -> Result<(), BackendError> {
        if let Err(open) = self.breaker.ensure_allowed() {
            return Err(BackendError::CircuitOpen { retry_after_ms: open.retry_after_ms });
        }

        let url = format!("{}/api/v1/relays/messages", self.base_url.trim_end_matches('/'));
        let result = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(callback)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                self.breaker.record_success();
                Ok(())
            }
            Ok(response) => {
                self.breaker.record_failure();
                Err(BackendError::Status(response.status().as_u16()))
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(BackendError::Request(e.to_string()))
            }
        }
    }
}
