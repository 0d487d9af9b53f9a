use thiserror::Error;

/// Every failure a queue operation can surface to a caller.
///
/// Admission denials are not part of this enum: `add` reports them as
/// [`AddOutcome::Rejected`](crate::domain::admission::AddOutcome).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    Conflict(String),

    /// Storage contention or timeout. Safe to retry.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl QueueError {
    /// Stable code exposed to callers.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "validation_error",
            QueueError::NotFound(_) => "not_found",
            QueueError::Forbidden(_) => "forbidden",
            QueueError::RateLimited { .. } => "rate_limited",
            QueueError::Conflict(_) => "conflict",
            QueueError::Transient(_) => "transient_error",
            QueueError::Internal(_) => "internal_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }

    /// Message safe to hand back to a caller. Internal details stay in the logs.
    pub fn public_reason(&self) -> String {
        match self {
            QueueError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = QueueError::from(anyhow!("connection reset by peer at 10.0.0.4"));
        assert_eq!(err.code(), "internal_error");
        assert_eq!(err.public_reason(), "internal error");
    }

    #[test]
    fn test_rate_limited_message() {
        let err = QueueError::RateLimited { retry_after_secs: 3 };
        assert_eq!(err.code(), "rate_limited");
        assert_eq!(err.public_reason(), "too many requests, retry in 3s");
    }
}
