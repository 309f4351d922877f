//! Store error taxonomy.
//!
//! Every database failure is folded into one of a small set of kinds so
//! that callers can decide between retrying (operational problems and
//! query timeouts), skipping the offending input (data errors), reusing
//! an existing row (duplicate keys) and giving up.

use tokio_postgres::error::SqlState;

/// Discriminated store error, matched exhaustively by callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection lost or other transient server condition. Retry with
    /// reconnect and backoff.
    #[error("operational database error: {0}")]
    Operational(String),

    /// The payload or row violated a constraint. Drop the input and
    /// carry on.
    #[error("bad data: {0}")]
    Data(String),

    /// A unique constraint fired. For stream inserts this means the
    /// stream already exists and its id should be reused.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The statement exceeded the configured statement timeout.
    #[error("query timed out")]
    Timeout,

    /// Shutdown was requested while a statement was in flight.
    #[error("interrupted")]
    Interrupted,

    /// A malformed query or misuse of the driver. Not recoverable by
    /// retrying; indicates a bug.
    #[error("programming error: {0}")]
    Coding(String),

    /// Anything that does not fit the kinds above.
    #[error("database error: {0}")]
    Generic(String),
}

impl StoreError {
    /// True when the caller should reconnect and run the operation
    /// again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Operational(_) | StoreError::Timeout)
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        let Some(state) = err.code() else {
            // No SQLSTATE means the failure happened client-side,
            // typically a dropped socket.
            return StoreError::Operational(err.to_string());
        };

        if *state == SqlState::UNIQUE_VIOLATION {
            return StoreError::DuplicateKey(err.to_string());
        }
        if *state == SqlState::QUERY_CANCELED {
            return StoreError::Timeout;
        }

        match state.code() {
            // Connection exceptions, insufficient resources, crash
            // shutdown: worth reconnecting for.
            c if c.starts_with("08") || c.starts_with("53") || c.starts_with("57") => {
                StoreError::Operational(err.to_string())
            }
            // Data exceptions and the remaining integrity violations.
            c if c.starts_with("22") || c.starts_with("23") => StoreError::Data(err.to_string()),
            // Syntax errors and driver misuse.
            c if c.starts_with("42") || c.starts_with("26") || c.starts_with("34") => {
                StoreError::Coding(err.to_string())
            }
            _ => StoreError::Generic(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(StoreError::Operational("gone".into()).is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(!StoreError::Data("bad".into()).is_transient());
        assert!(!StoreError::DuplicateKey("dup".into()).is_transient());
        assert!(!StoreError::Interrupted.is_transient());
    }
}
