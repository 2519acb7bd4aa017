//! Shared HTTP client and response classification.

use std::time::Duration;

use enrichkit_shared::{EnrichError, LookupError, Result};
use reqwest::{Client, StatusCode};

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("enrichkit/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by all network adapters.
pub fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| EnrichError::Network(format!("failed to build HTTP client: {e}")))
}

/// Map a transport failure onto the lookup error classes.
pub(crate) fn send_error(err: reqwest::Error, timeout: Duration) -> LookupError {
    if err.is_timeout() {
        LookupError::Timeout(timeout)
    } else {
        LookupError::Unavailable(err.to_string())
    }
}

/// Map a non-success status onto the lookup error classes.
pub(crate) fn status_error(status: StatusCode, what: &str) -> LookupError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        LookupError::RateLimited(format!("{what}: HTTP {status}"))
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        LookupError::Unavailable(format!("{what}: HTTP {status}"))
    } else {
        LookupError::NotFound(format!("{what}: HTTP {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "x"),
            LookupError::RateLimited(_)
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, "x").is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, "x").is_transient());
    }
}
