use thiserror::Error;

/// Errors surfaced by the aggregation layer.
#[derive(Error, Debug)]
pub enum TollgateError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background thread error: {0}")]
    Thread(String),

    #[error("interrupted: {0}")]
    Interrupted(String),
}

/// Result type alias for tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

impl TollgateError {
    /// Creates a new invalid-request error.
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates a new transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a new illegal-state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Creates a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new thread error.
    pub fn thread<S: Into<String>>(msg: S) -> Self {
        Self::Thread(msg.into())
    }

    /// Returns true if the operation that produced this error may be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Interrupted(_))
    }

    /// Returns the error category for metrics/logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "validation",
            Self::Transport(_) => "transport",
            Self::IllegalState(_) => "lifecycle",
            Self::Config(_) => "config",
            Self::Thread(_) => "thread",
            Self::Interrupted(_) => "interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TollgateError::invalid_request("no operation");
        assert_eq!(err.to_string(), "invalid request: no operation");
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_error_recoverability() {
        assert!(TollgateError::transport("connection reset").is_recoverable());
        assert!(!TollgateError::config("bad num_entries").is_recoverable());
        assert!(!TollgateError::illegal_state("not running").is_recoverable());
    }
}
