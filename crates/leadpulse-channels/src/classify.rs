//! Map HTTP outcomes onto retryable / permanent dispatch failures.

use leadpulse_core::DispatchError;
use reqwest::StatusCode;

/// Timeouts, throttling and server errors are worth retrying; any other
/// 4xx means the request itself is wrong.
pub fn classify_status(status: StatusCode, body: &str) -> DispatchError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body, 300))
    };
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        DispatchError::Retryable(message)
    } else {
        DispatchError::Permanent(message)
    }
}

/// A request that never got a response. Only a malformed request is permanent.
pub fn classify_transport(err: &reqwest::Error) -> DispatchError {
    if err.is_builder() {
        DispatchError::Permanent(format!("invalid request: {err}"))
    } else {
        DispatchError::Retryable(format!("request failed: {err}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
