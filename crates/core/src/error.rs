//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only: validation and malformed identifiers. Storage
/// and delivery failures have their own error types in `identityd-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. a zero lockout threshold).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_build_matching_variants() {
        assert_eq!(
            DomainError::validation("max_failures must be at least 1"),
            DomainError::Validation("max_failures must be at least 1".to_string())
        );
        assert_eq!(
            DomainError::invalid_id("AliasId: bad").to_string(),
            "invalid identifier: AliasId: bad"
        );
    }
}
