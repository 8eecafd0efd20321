//! Error types for Chanweave

use thiserror::Error;

/// Main error type for channel orchestration operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Network or RPC failure talking to the substrate
    #[error("Substrate unavailable: {0}")]
    SubstrateUnavailable(String),

    /// The substrate reported a failure for an operation that actually committed
    #[error("Partial creation conflict on {0}")]
    PartialCreationConflict(String),

    /// Principal identifier is not a valid substrate address
    #[error("Invalid principal: {0}")]
    InvalidPrincipal(String),

    /// Decryption failed (wrong secret, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    /// The substrate refused the operation for the acting identity
    #[error("Permission denied: {operation} on {target}")]
    PermissionDenied {
        /// Substrate operation that was refused
        operation: String,
        /// Topic the operation targeted
        target: String,
    },

    /// Topic identifier lacks the persistent/ephemeral suffix
    #[error("Invalid topic identifier format: {0}")]
    InvalidIdentifierFormat(String),

    /// Topic does not exist on the substrate
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Topic already exists on the substrate
    #[error("Topic already exists: {0}")]
    TopicExists(String),

    /// A retried operation used up its attempt budget
    #[error("{operation} on {target} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Logical operation name (e.g. "create_topic")
        operation: String,
        /// Topic the operation targeted
        target: String,
        /// Number of attempts made
        attempts: u32,
        /// The failure of the final attempt
        last: Box<ChannelError>,
    },

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed (not a decryption of received data)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The substrate does not implement the requested capability
    #[error("Unsupported by substrate: {0}")]
    Unsupported(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl ChannelError {
    /// Whether a retry has a chance of succeeding.
    ///
    /// Only transport-level failures qualify; everything else is a definite
    /// answer from the substrate or a local validation failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::SubstrateUnavailable(_) | ChannelError::PartialCreationConflict(_)
        )
    }

    /// The underlying failure, looking through `RetriesExhausted`.
    pub fn root(&self) -> &ChannelError {
        match self {
            ChannelError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Shorthand for a `PermissionDenied` error.
    pub fn denied(operation: impl Into<String>, target: impl Into<String>) -> Self {
        ChannelError::PermissionDenied {
            operation: operation.into(),
            target: target.into(),
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

/// Result type alias using ChannelError
pub type ChannelResult<T> = Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChannelError::TopicNotFound("0xabc/room-1".to_string());
        assert_eq!(format!("{}", err), "Topic not found: 0xabc/room-1");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ChannelError::SubstrateUnavailable("timeout".into()).is_transient());
        assert!(!ChannelError::InvalidPrincipal("bob".into()).is_transient());
        assert!(!ChannelError::denied("publish", "t-1").is_transient());
    }

    #[test]
    fn test_root_unwraps_exhaustion() {
        let err = ChannelError::RetriesExhausted {
            operation: "create_topic".into(),
            target: "t-2".into(),
            attempts: 3,
            last: Box::new(ChannelError::SubstrateUnavailable("rpc down".into())),
        };
        assert_eq!(
            err.root(),
            &ChannelError::SubstrateUnavailable("rpc down".into())
        );
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ChannelError = json_err.into();
        assert!(matches!(err, ChannelError::Serialization(_)));
    }
}
