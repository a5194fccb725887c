//! Upstream failure view
//!
//! The engine never inspects the caller's error type directly. Anything that
//! implements `UpstreamError` can flow through classification: `reqwest::Error`
//! for callers using reqwest as their transport, and `UpstreamFailure` for
//! callers that already read the response status, headers and body.

use reqwest::header::HeaderMap;
use std::collections::HashMap;

/// Read-only view of a failed upstream call.
///
/// The `Display` output is treated as the failure message and is matched
/// against quota and resource-exhaustion phrases.
pub trait UpstreamError: std::error::Error + Send + Sync {
    /// HTTP-style status code, if a response was received.
    fn status(&self) -> Option<u16> {
        None
    }

    /// Response headers, if a response was received.
    fn headers(&self) -> Option<&HeaderMap> {
        None
    }

    /// The call timed out before a response arrived.
    fn is_timeout(&self) -> bool {
        false
    }

    /// The upstream could not be reached.
    fn is_connect(&self) -> bool {
        false
    }
}

impl UpstreamError for reqwest::Error {
    fn status(&self) -> Option<u16> {
        reqwest::Error::status(self).map(|s| s.as_u16())
    }

    fn is_timeout(&self) -> bool {
        reqwest::Error::is_timeout(self)
    }

    fn is_connect(&self) -> bool {
        reqwest::Error::is_connect(self)
    }
}

/// Concrete upstream failure for clients that map responses themselves.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamFailure {
    #[error("upstream returned {status}: {body}")]
    Http {
        status: u16,
        headers: HeaderMap,
        body: String,
    },

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("upstream unreachable: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

impl UpstreamFailure {
    /// HTTP failure without headers.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        UpstreamFailure::Http {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// HTTP failure carrying response headers.
    pub fn with_headers(status: u16, headers: HeaderMap, body: impl Into<String>) -> Self {
        UpstreamFailure::Http {
            status,
            headers,
            body: body.into(),
        }
    }
}

impl From<reqwest::Error> for UpstreamFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamFailure::Timeout(err.to_string())
        } else if err.is_connect() {
            UpstreamFailure::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            UpstreamFailure::http(status.as_u16(), err.to_string())
        } else {
            UpstreamFailure::Other(err.to_string())
        }
    }
}

impl UpstreamError for UpstreamFailure {
    fn status(&self) -> Option<u16> {
        match self {
            UpstreamFailure::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn headers(&self) -> Option<&HeaderMap> {
        match self {
            UpstreamFailure::Http { headers, .. } => Some(headers),
            _ => None,
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, UpstreamFailure::Timeout(_))
    }

    fn is_connect(&self) -> bool {
        matches!(self, UpstreamFailure::Connect(_))
    }
}

/// Flatten a header map into lowercase name → value strings.
///
/// Values that are not valid visible ASCII are skipped. Repeated headers keep
/// the last value.
pub fn header_map_to_strings(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Parse a header as an unsigned integer.
pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Parse a header as a finite float.
pub(crate) fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|f| f.is_finite())
}
