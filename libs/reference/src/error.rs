//! Error types for image reference parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating an image reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The reference string is empty.
    #[error("image reference cannot be empty")]
    Empty,

    /// The reference does not follow `[registry/]repository[:tag|@digest]`.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidFormat { reference: String, reason: String },

    /// The registry component is not a valid host[:port].
    #[error("invalid registry '{0}'")]
    InvalidRegistry(String),

    /// The repository component contains invalid characters or separators.
    #[error("invalid repository '{0}'")]
    InvalidRepository(String),

    /// The tag is too long or contains invalid characters.
    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    /// The digest is not `<algorithm>:<hex>`.
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),
}

impl ReferenceError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, ReferenceError::Empty)
    }

    /// Returns the offending component for component-level errors.
    pub fn component(&self) -> Option<&str> {
        match self {
            ReferenceError::InvalidRegistry(c)
            | ReferenceError::InvalidRepository(c)
            | ReferenceError::InvalidTag(c)
            | ReferenceError::InvalidDigest(c) => Some(c),
            ReferenceError::Empty | ReferenceError::InvalidFormat { .. } => None,
        }
    }
}
