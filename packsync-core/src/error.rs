//! Error taxonomy shared by every store and by the coordinator.

/// Result type for packsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while storing packs or advancing refs
///
/// None of these leave partial side effects behind: a failed call
/// leaves every store exactly as it was.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Malformed input: missing field, empty name/oid, malformed pack id
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The stated previous oid does not match the ref's current oid
    #[error("NonFastForward: ref '{name}' expected '{expected}' but is at '{actual}'")]
    NonFastForward {
        name: String,
        expected: String,
        actual: String,
    },

    /// Referenced or requested pack does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Delta-chain base is not part of the ref's recorded history
    #[error("BaseNotFound: '{base}' is not on the history of ref '{name}'")]
    BaseNotFound {
        name: String,
        base: String,
        final_oid: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether the error is the caller's fault (as opposed to a storage fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::BadRequest(_)
                | SyncError::NonFastForward { .. }
                | SyncError::NotFound(_)
                | SyncError::BaseNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(SyncError::BadRequest("x".into()).is_client_error());
        assert!(SyncError::NotFound("p".into()).is_client_error());
        assert!(
            SyncError::NonFastForward {
                name: "main".into(),
                expected: "a".into(),
                actual: "b".into(),
            }
            .is_client_error()
        );
        assert!(!SyncError::Storage("disk gone".into()).is_client_error());
    }

    #[test]
    fn test_non_fast_forward_message() {
        let err = SyncError::NonFastForward {
            name: "main".into(),
            expected: "".into(),
            actual: "abc".into(),
        };
        assert!(err.to_string().starts_with("NonFastForward"));
    }
}
