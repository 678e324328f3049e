//! Core error types.

use thiserror::Error;

/// Why a projected value could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Null read for a non-nullable projection.
    NullValue,
    /// The stored value has the wrong type.
    TypeMismatch { expected: String, actual: String },
    /// The value converter rejected the stored value.
    Conversion(String),
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorKind::NullValue => write!(f, "null value for non-nullable projection"),
            DecodeErrorKind::TypeMismatch { expected, actual } => {
                write!(f, "expected {expected}, found {actual}")
            }
            DecodeErrorKind::Conversion(reason) => write!(f, "conversion failed: {reason}"),
        }
    }
}

/// Errors surfaced by compilation and enumeration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A row's data disagrees with the projected shape.
    #[error("failed to decode column '{column}' at ordinal {ordinal}: {kind}")]
    Decode {
        column: String,
        ordinal: usize,
        kind: DecodeErrorKind,
    },

    /// The data source failed to execute a command or read a row.
    #[error("provider error: {message}")]
    Provider { message: String, transient: bool },

    /// A second operation started on an enumeration whose previous one has not finished.
    #[error(
        "a second operation was started on this query context before a previous operation completed"
    )]
    ConcurrencyViolation,

    /// The requested operation is not supported.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A shaper does not match its query.
    #[error("invalid shaper: {0}")]
    InvalidShaper(String),

    /// An expression cannot be evaluated or rewritten.
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The enumeration failed earlier and cannot continue.
    #[error("enumeration faulted by an earlier error")]
    Faulted,

    /// The enumeration has been disposed.
    #[error("enumeration has been disposed")]
    Disposed,

    /// IR error.
    #[error("ir error: {0}")]
    Ir(#[from] relshape_ir::Error),
}

impl Error {
    /// Create a provider error that a retrying strategy may retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Provider {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a provider error that is never retried.
    pub fn provider(message: impl Into<String>) -> Self {
        Error::Provider {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the failed operation might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Provider { transient: true, .. })
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_message_names_column() {
        let err = Error::Decode {
            column: "IsActive".into(),
            ordinal: 2,
            kind: DecodeErrorKind::Conversion("bad literal".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("'IsActive'"));
        assert!(msg.contains("ordinal 2"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("timeout").is_transient());
        assert!(!Error::provider("syntax").is_transient());
        assert!(!Error::ConcurrencyViolation.is_transient());
    }
}
