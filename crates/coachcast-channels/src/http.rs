//! Shared HTTP plumbing: client construction and provider error mapping.

use coachcast_core::error::CoachcastError;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;

const USER_AGENT: &str = concat!("Coachcast/", env!("CARGO_PKG_VERSION"));

pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// Map a non-success provider response to a retryable or permanent error.
pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str, retry_after: Option<u64>) -> CoachcastError {
    let detail = body.chars().take(300).collect::<String>();
    match status.as_u16() {
        429 => CoachcastError::rate_limited(format!("{provider} {status}: {detail}"), retry_after),
        408 | 500..=599 => CoachcastError::channel(format!("{provider} {status}: {detail}")),
        _ => CoachcastError::rejected(format!("{provider} {status}: {detail}")),
    }
}

pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> CoachcastError {
    if e.is_timeout() {
        CoachcastError::Timeout(format!("{provider}: {e}"))
    } else {
        CoachcastError::Http(format!("{provider}: {e}"))
    }
}

/// `Retry-After` in whole seconds, if present.
pub(crate) fn retry_after_header(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}


#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error("x", StatusCode::TOO_MANY_REQUESTS, "", Some(5)),
            CoachcastError::RateLimited { retry_after_secs: Some(5), .. }
        ));
        assert!(status_error("x", StatusCode::BAD_GATEWAY, "", None).is_retryable());
        assert!(status_error("x", StatusCode::REQUEST_TIMEOUT, "", None).is_retryable());
        assert!(!status_error("x", StatusCode::UNAUTHORIZED, "bad key", None).is_retryable());
        assert!(!status_error("x", StatusCode::BAD_REQUEST, "", None).is_retryable());
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_header(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after_header(&headers), Some(12));
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after_header(&headers), None);
    }
}
