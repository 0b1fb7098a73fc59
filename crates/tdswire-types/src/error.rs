//! Type conversion error types.

use thiserror::Error;

/// Errors that can occur during type conversion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// Value is null when non-null was expected.
    #[error("unexpected null value")]
    UnexpectedNull,

    /// Type mismatch during conversion.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        actual: &'static str,
    },

    /// Value cannot be represented in the target type without loss.
    #[error("value out of range for {target_type}")]
    OutOfRange {
        /// Target type name.
        target_type: &'static str,
    },

    /// Invalid date/time value.
    #[error("invalid date/time: {0}")]
    InvalidDateTime(String),

    /// Invalid numeric literal or scale.
    #[error("invalid numeric: {0}")]
    InvalidNumeric(String),

    /// Invalid UUID value.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}
