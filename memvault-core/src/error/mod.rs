//! Error taxonomy for the memory plane.
//!
//! Semantic errors (denied access, integrity failures, invalid input) are
//! never retried; transport errors (`*Unavailable`) are, with backoff, by
//! [`crate::retry::RetryPolicy`].

/// Result type alias for memory-plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced to hosts of the memory plane
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied for scope {scope}: {reason}")]
    NoAccess { scope: String, reason: String },

    #[error("Session expired for {address}; re-sign the session challenge")]
    SessionExpired { address: String },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Ciphertext integrity check failed")]
    IntegrityError,

    #[error("Key servers returned inconsistent shares ({agreeing} agreeing of {responding} responding)")]
    InconsistentKeyServers { agreeing: u32, responding: u32 },

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Blob store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Key server unavailable: {0}")]
    KeyServerUnavailable(String),

    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("LLM provider unavailable: {0}")]
    LlmUnavailable(String),

    #[error("Batcher back-pressure: kind {kind} over capacity for longer than the enqueue timeout")]
    Backpressure { kind: String },

    #[error("Index snapshot failed integrity check for user {user}: {reason}")]
    IndexCorrupted { user: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution timeout")]
    ExecutionTimeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot codec error: {0}")]
    SnapshotCodec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check whether this error is recoverable (worth retrying with backoff).
    ///
    /// Only transport-layer faults qualify; semantic errors such as
    /// [`Error::NoAccess`] or [`Error::IntegrityError`] are final.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::StorageUnavailable(_)
            | Error::KeyServerUnavailable(_)
            | Error::EmbeddingUnavailable(_)
            | Error::LlmUnavailable(_)
            | Error::ExecutionTimeout
            | Error::Io(_) => true,
            Error::InvalidInput(_)
            | Error::NotFound(_)
            | Error::NoAccess { .. }
            | Error::SessionExpired { .. }
            | Error::EncryptionFailed(_)
            | Error::DecryptionFailed(_)
            | Error::IntegrityError
            | Error::InconsistentKeyServers { .. }
            | Error::InvalidCiphertext(_)
            | Error::Backpressure { .. }
            | Error::IndexCorrupted { .. }
            | Error::InvalidState(_)
            | Error::Configuration(_)
            | Error::Serialization(_)
            | Error::SnapshotCodec(_) => false,
        }
    }

    /// Check whether this is an envelope (encryption/decryption) fault.
    #[must_use]
    pub fn is_envelope_error(&self) -> bool {
        matches!(
            self,
            Error::EncryptionFailed(_)
                | Error::DecryptionFailed(_)
                | Error::IntegrityError
                | Error::InconsistentKeyServers { .. }
                | Error::InvalidCiphertext(_)
                | Error::SessionExpired { .. }
        )
    }

    /// Shorthand for a [`Error::NotFound`] over a typed id.
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    /// Shorthand for a denial at a given scope.
    pub fn no_access(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::NoAccess {
            scope: scope.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_recoverable() {
        assert!(Error::StorageUnavailable("conn reset".into()).is_recoverable());
        assert!(Error::KeyServerUnavailable("timeout".into()).is_recoverable());
        assert!(Error::EmbeddingUnavailable("503".into()).is_recoverable());
        assert!(Error::LlmUnavailable("overloaded".into()).is_recoverable());
        assert!(Error::ExecutionTimeout.is_recoverable());
    }

    #[test]
    fn semantic_errors_are_final() {
        assert!(!Error::IntegrityError.is_recoverable());
        assert!(!Error::no_access("read:memories", "no grant").is_recoverable());
        assert!(!Error::InvalidInput("bad filter".into()).is_recoverable());
        assert!(!Error::InconsistentKeyServers {
            agreeing: 1,
            responding: 3
        }
        .is_recoverable());
        assert!(!Error::IndexCorrupted {
            user: "0xabc".into(),
            reason: "truncated".into()
        }
        .is_recoverable());
    }

    #[test]
    fn envelope_error_classification() {
        assert!(Error::IntegrityError.is_envelope_error());
        assert!(Error::SessionExpired {
            address: "0xabc".into()
        }
        .is_envelope_error());
        assert!(!Error::NotFound("blob".into()).is_envelope_error());
    }

    #[test]
    fn backpressure_names_the_kind() {
        let err = Error::Backpressure {
            kind: "vec-add:0xabc".into(),
        };
        assert!(err.to_string().contains("vec-add:0xabc"));
        assert!(!err.is_recoverable());
    }
}
