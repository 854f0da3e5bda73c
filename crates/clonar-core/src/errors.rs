use std::time::Duration;

/// Errors returned by external collaborators (language models, embedders).
/// Classified so callers can decide whether a failure should count against
/// the dependency's circuit breaker.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}")]
    ServerError { status: u16 },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl CollaboratorError {
    /// Whether the failure says something about the dependency's health.
    /// Caller mistakes and missing configuration do not.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::MalformedResponse(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::MalformedResponse(_) => "malformed_response",
            Self::NotConfigured(_) => "not_configured",
        }
    }

    /// Classify an HTTP status code. The response body is deliberately not
    /// carried so provider dumps never reach clients.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(format!("status {status}")),
            400 | 404 | 422 => Self::InvalidRequest(format!("status {status}")),
            429 => Self::RateLimited { retry_after: None },
            _ => Self::ServerError { status },
        }
    }
}

/// Errors raised by retrieval tools. The executor treats every variant the
/// same way as an empty result plus a logged failure.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("upstream error: {0}")]
    Upstream(#[from] CollaboratorError),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_failure_classification() {
        assert!(CollaboratorError::ServerError { status: 500 }.is_dependency_failure());
        assert!(CollaboratorError::NetworkError("reset".into()).is_dependency_failure());
        assert!(CollaboratorError::RateLimited { retry_after: None }.is_dependency_failure());
        assert!(!CollaboratorError::InvalidRequest("bad".into()).is_dependency_failure());
        assert!(!CollaboratorError::NotConfigured("key".into()).is_dependency_failure());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            CollaboratorError::from_status(401),
            CollaboratorError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            CollaboratorError::from_status(429),
            CollaboratorError::RateLimited { .. }
        ));
        assert!(matches!(
            CollaboratorError::from_status(503),
            CollaboratorError::ServerError { status: 503 }
        ));
    }

    #[test]
    fn tool_error_wraps_upstream() {
        let err: ToolError = CollaboratorError::ServerError { status: 502 }.into();
        assert_eq!(err.to_string(), "upstream error: server error 502");
    }
}
