//! Runner client error types.

use std::error::Error as StdError;

use thiserror::Error;

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors talking to a session runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Runner host does not resolve; the runner service does not exist.
    #[error("runner host for {url} does not resolve: {message}")]
    Unresolvable { url: String, message: String },

    /// Connection refused or dropped after all attempts.
    #[error("runner at {url} is not reachable after {attempts} attempt(s): {message}")]
    Unavailable {
        url: String,
        message: String,
        attempts: u32,
    },

    /// Request timed out.
    #[error("request to runner at {url} timed out")]
    Timeout { url: String },

    /// Runner answered with a non-success status.
    #[error("runner returned HTTP {status}")]
    Status { status: u16 },

    /// Any other HTTP client failure.
    #[error("runner request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl RunnerError {
    /// Classify a transport failure.
    pub(crate) fn from_transport(url: &str, err: reqwest::Error) -> Self {
        if is_unresolvable(&err) {
            RunnerError::Unresolvable {
                url: url.to_string(),
                message: error_chain(&err),
            }
        } else if err.is_timeout() {
            RunnerError::Timeout {
                url: url.to_string(),
            }
        } else if err.is_connect() {
            RunnerError::Unavailable {
                url: url.to_string(),
                message: error_chain(&err),
                attempts: 1,
            }
        } else {
            RunnerError::Request(err)
        }
    }
}

const DNS_MARKERS: &[&str] = &[
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "no such host",
    "nodename nor servname",
];

/// Whether an error (or any of its sources) is a host-resolution failure.
pub fn is_unresolvable(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if DNS_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = e.source();
    }
    false
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_dns_failure_found_in_source_chain() {
        let err = Wrapped(std::io::Error::other(
            "failed to lookup address information: Name or service not known",
        ));
        assert!(is_unresolvable(&err));
    }

    #[test]
    fn test_connection_refused_is_not_dns() {
        let err = Wrapped(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)",
        ));
        assert!(!is_unresolvable(&err));
    }

    #[test]
    fn test_error_chain_joins_sources() {
        let err = Wrapped(std::io::Error::other("inner"));
        assert_eq!(error_chain(&err), "error sending request: inner");
    }
}
