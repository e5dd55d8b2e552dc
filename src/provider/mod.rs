//! Clients for the flight data feeds and the prediction service.

pub mod flights;
pub mod prediction;

pub use flights::{FlightRecord, FlightSource, HttpFlightSource, TelemetryRecord, TimeWindow};
pub use prediction::{
    HttpPredictionProvider, MockPredictionProvider, PredictionInput, PredictionOutput, PredictionProvider,
};

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::error;

use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Retryable for ProviderError {
    /// Rate limits and auth failures will not clear up within a backoff window.
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport(_) | ProviderError::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        ProviderError::Timeout(after)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

/// Map a non-success status to the matching error; pass successes through.
pub(crate) async fn check_status(
    response: reqwest::Response,
    what: &'static str,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "{what} failed");
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(format!("{status}")),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        _ => ProviderError::Transport(format!("{what}: {status} - {body}")),
    })
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Transport(e.to_string()))
}
