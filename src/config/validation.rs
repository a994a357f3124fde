use thiserror::Error;

/// Construction-time validation failures.
///
/// Raised before an entity or policy becomes observable; never defaulted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("required configuration '{0}' is missing")]
    MissingRequired(String),

    #[error("configuration '{key}' must be of type {expected}")]
    InvalidType { key: String, expected: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("tags must not be null")]
    NullTag,

    #[error("configuration of '{entity}' is immutable after init")]
    Immutable { entity: String },
}

impl ValidationError {
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
