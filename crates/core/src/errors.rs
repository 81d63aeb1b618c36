//! Error types for the rewards core.

use thiserror::Error;

/// Result type alias for rewards operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the ledger, sync, and watch-time layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Spend requested more points than the local balance holds.
    #[error("Insufficient points: requested {requested}, available {available}")]
    InsufficientPoints { requested: i64, available: i64 },

    /// Earn/spend amounts must be strictly positive.
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    /// Requested record does not exist on the remote store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote store lacks an optional capability (RPC, column).
    #[error("Unsupported by remote store: {0}")]
    Unsupported(String),

    /// The remote store refused the write.
    #[error("Rejected by remote store: {0}")]
    Rejected(String),

    /// Network failure or timeout; safe to absorb on the next cycle.
    #[error("Transient remote failure: {0}")]
    Transient(String),

    /// Change feed could not be opened or was interrupted.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::Subscription(message.into())
    }

    /// True for failures the next poll/flush cycle is expected to absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Subscription(_))
    }

    /// True when the remote lacks an optional operation or field.
    pub fn is_capability_mismatch(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_families() {
        assert!(Error::transient("timeout").is_transient());
        assert!(Error::subscription("closed").is_transient());
        assert!(!Error::rejected("constraint").is_transient());
        assert!(Error::unsupported("total_spent").is_capability_mismatch());
        assert!(!Error::InvalidAmount(0).is_capability_mismatch());
    }

    #[test]
    fn insufficient_points_message_names_both_amounts() {
        let err = Error::InsufficientPoints {
            requested: 50,
            available: 20,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient points: requested 50, available 20"
        );
    }
}
