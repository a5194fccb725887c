//! Error types for pool and engine operations

/// Errors from pool administration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("duplicate credential: {0}")]
    Duplicate(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error escaping `ExecutionEngine::execute`.
///
/// Upstream failures are returned unchanged so callers can inspect their own
/// error type. `NoCredentials` is only produced when no credential could be
/// bound before any upstream failure was observed.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E> {
    #[error("{0}")]
    Upstream(E),

    #[error("no credentials available: {0}")]
    NoCredentials(String),
}

impl<E> ExecuteError<E> {
    pub fn is_no_credentials(&self) -> bool {
        matches!(self, ExecuteError::NoCredentials(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_display_is_transparent() {
        let err: ExecuteError<std::io::Error> =
            ExecuteError::Upstream(std::io::Error::other("socket closed"));
        assert_eq!(err.to_string(), "socket closed");
        assert!(!err.is_no_credentials());
    }

    #[test]
    fn no_credentials_is_distinct() {
        let err: ExecuteError<std::io::Error> = ExecuteError::NoCredentials("{}".into());
        assert!(err.is_no_credentials());
        assert!(err.to_string().starts_with("no credentials available"));
    }
}
