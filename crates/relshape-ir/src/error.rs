//! IR error types.

use thiserror::Error;

/// Errors raised while converting values or validating trees.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A value converter could not translate a value.
    #[error("cannot convert {value} using {converter}: {reason}")]
    Conversion {
        converter: &'static str,
        value: String,
        reason: String,
    },

    /// A tree does not satisfy a structural requirement.
    #[error("invalid expression tree: {0}")]
    InvalidTree(String),

    /// Serialized IR could not be parsed.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}
