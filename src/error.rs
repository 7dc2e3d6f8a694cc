//! Error types for the reward ledger

use thiserror::Error;

use crate::amount::Amount;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the reward ledger
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    // Validation errors (rendered directly to the user)
    #[error("User {0} is not an admin")]
    Unauthorized(i64),

    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: Amount, required: Amount },

    #[error("Amount {amount} is below the minimum withdrawal of {minimum}")]
    BelowMinimum { amount: Amount, minimum: Amount },

    #[error("Task unavailable: {0}")]
    TaskUnavailable(String),

    #[error("Transaction {0} is not pending")]
    NotPending(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },

    // Storage contention
    #[error("Storage conflict on {0}")]
    Conflict(String),

    #[error("Retries exhausted after {attempts} attempts on {key}")]
    RetryExhausted { key: String, attempts: u32 },

    // Collaborator errors
    #[error("External collaborator unavailable: {0}")]
    ExternalUnavailable(String),

    // Persistence errors
    #[error("Snapshot persistence failed: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Check if this error is retryable (transient storage contention)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this error should be shown to the user as-is
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized(_)
                | Error::InsufficientFunds { .. }
                | Error::BelowMinimum { .. }
                | Error::TaskUnavailable(_)
                | Error::NotPending(_)
                | Error::InvalidInput(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflict_is_retryable() {
        assert!(Error::Conflict("account:1".to_string()).is_retryable());
        assert!(!Error::RetryExhausted {
            key: "account:1".to_string(),
            attempts: 5
        }
        .is_retryable());
        assert!(!Error::Unauthorized(7).is_retryable());
    }

    #[test]
    fn test_validation_errors_are_user_facing() {
        let err = Error::BelowMinimum {
            amount: Amount::from_units(5_000),
            minimum: Amount::from_units(10_000),
        };
        assert!(err.is_user_facing());
        assert_eq!(
            err.to_string(),
            "Amount 0.5000 is below the minimum withdrawal of 1.0000"
        );
        assert!(!Error::Persistence("disk full".to_string()).is_user_facing());
    }
}
