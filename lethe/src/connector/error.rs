use crate::core::Retryable;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single connector call.
///
/// Connectors classify their own failures. The executor retries the
/// transient variants with backoff and records the rest on the task at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConnectorError {
    /// Connection refused or reset, or the service reported itself unavailable.
    #[error("transient connector failure: {0}")]
    Transient(String),

    /// A permanent failure that a retry cannot fix.
    #[error("connector failure: {0}")]
    Fatal(String),

    /// The call did not finish within the connector timeout.
    #[error("connector call timed out after {0:?}")]
    Timeout(Duration),

    /// The third party asked us to slow down.
    #[error("rate limited by upstream service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request sent to the third party was rejected as invalid.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl ConnectorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest(message.into())
    }
}

impl Retryable for ConnectorError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Transient(_)
                | ConnectorError::Timeout(_)
                | ConnectorError::RateLimited { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectorError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let transient = matches!(
            error.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
        );
        if transient {
            ConnectorError::Transient(error.to_string())
        } else {
            ConnectorError::Fatal(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ConnectorError::transient("connection reset").is_retryable());
        assert!(ConnectorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ConnectorError::RateLimited { retry_after: None }.is_retryable());

        assert!(!ConnectorError::fatal("boom").is_retryable());
        assert!(!ConnectorError::unauthorized("bad token").is_retryable());
        assert!(!ConnectorError::malformed("missing id").is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let refused: ConnectorError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(refused, ConnectorError::Transient(_)));

        let denied: ConnectorError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(denied, ConnectorError::Fatal(_)));
    }
}
