use std::time::Duration;

use iris_core::{BiometricError, ErrorClass};
use thiserror::Error;

use crate::store::StoreError;

/// Longest accepted identity, in bytes.
pub const MAX_IDENTITY_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Biometric(#[from] BiometricError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no templates enrolled for identity {0:?}")]
    UnknownIdentity(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("processing timed out after {0:?}")]
    Timeout(Duration),
    #[error("pipeline worker failed: {0}")]
    Worker(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Biometric(e) => e.class(),
            EngineError::Store(e) => e.class(),
            EngineError::UnknownIdentity(_) => ErrorClass::Storage,
            EngineError::InvalidIdentity(_) => ErrorClass::Input,
            EngineError::Timeout(_) => ErrorClass::Processing,
            EngineError::Worker(_) => ErrorClass::Internal,
        }
    }

    pub fn retry_may_help(&self) -> bool {
        self.class() == ErrorClass::Processing
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Biometric(e) => e.code(),
            EngineError::Store(StoreError::AlreadyEnrolled(_)) => "AlreadyEnrolled",
            EngineError::Store(_) => "StorageFailure",
            EngineError::UnknownIdentity(_) => "UnknownIdentity",
            EngineError::InvalidIdentity(_) => "InvalidIdentity",
            EngineError::Timeout(_) => "Timeout",
            EngineError::Worker(_) => "Internal",
        }
    }
}

/// Identities are opaque strings: non-empty, bounded, printable.
pub fn validate_identity(identity: &str) -> Result<(), EngineError> {
    if identity.trim().is_empty() {
        return Err(EngineError::InvalidIdentity("identity is empty".into()));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::InvalidIdentity(format!(
            "identity is {} bytes, limit is {MAX_IDENTITY_LEN}",
            identity.len()
        )));
    }
    if identity.chars().any(char::is_control) {
        return Err(EngineError::InvalidIdentity(
            "identity contains control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("user@example.org").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("   ").is_err());
        assert!(validate_identity("a\nb").is_err());
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LEN)).is_ok());
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }

    #[test]
    fn test_classes_follow_taxonomy() {
        let timeout = EngineError::Timeout(Duration::from_secs(1));
        assert_eq!(timeout.class(), ErrorClass::Processing);
        assert!(timeout.retry_may_help());

        let spoof = EngineError::from(BiometricError::LivenessRejected {
            score: 0.2,
            threshold: 0.5,
        });
        assert_eq!(spoof.class(), ErrorClass::Trust);
        assert_eq!(spoof.code(), "LivenessRejected");

        let dup = EngineError::from(StoreError::AlreadyEnrolled("alice".into()));
        assert_eq!(dup.class(), ErrorClass::Storage);
        assert_eq!(dup.code(), "AlreadyEnrolled");

        assert_eq!(
            EngineError::InvalidIdentity("x".into()).class(),
            ErrorClass::Input
        );
        assert_eq!(
            EngineError::UnknownIdentity("bob".into()).class(),
            ErrorClass::Storage
        );
        assert!(!EngineError::Worker("panic".into()).retry_may_help());
    }
}
