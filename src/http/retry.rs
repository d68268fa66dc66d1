//! Retry policy for repository downloads.

use reqwest::StatusCode;

/// Maximum number of attempts for one request.
pub const MAX_RETRIES: usize = 3;

/// Delay between attempts in milliseconds.
pub const RETRY_DELAY_MS: u64 = 1000;

/// Failures that will not go away by asking again.
#[derive(Debug, thiserror::Error)]
pub enum NonRetryableError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("access refused (HTTP {status}): {url}")]
    Refused { url: String, status: u16 },

    #[error("rate limit exceeded: {url}")]
    RateLimited { url: String },

    #[error("request failed (HTTP {status}): {url}")]
    ClientError { url: String, status: u16 },
}

/// Returns `Err` when the request failed in a way retrying will not fix.
pub fn classify_error(error: &reqwest::Error) -> Result<(), NonRetryableError> {
    let Some(status) = error.status() else {
        // Connection errors, timeouts and the like
        return Ok(());
    };
    let url = error.url().map(|u| u.to_string()).unwrap_or_default();

    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(NonRetryableError::NotFound { url }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NonRetryableError::Refused {
            url,
            status: status.as_u16(),
        }),
        StatusCode::TOO_MANY_REQUESTS => Err(NonRetryableError::RateLimited { url }),
        s if s.is_client_error() => Err(NonRetryableError::ClientError {
            url,
            status: s.as_u16(),
        }),
        _ => Ok(()),
    }
}

/// Converts an `error_for_status()` failure, tagging non-retryable ones.
pub fn check_retryable(error: reqwest::Error) -> anyhow::Error {
    match classify_error(&error) {
        Ok(()) => anyhow::Error::from(error),
        Err(non_retryable) => anyhow::Error::from(non_retryable),
    }
}

/// Whether the error means the requested resource does not exist.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<NonRetryableError>(),
        Some(NonRetryableError::NotFound { .. })
    )
}
