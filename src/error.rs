//! Error types for hybridex

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unknown index name: {0}")]
    UnknownIndex(String),

    #[error("Index already exists: {0}")]
    IndexExists(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Duplicate field in schema: {0}")]
    DuplicateField(String),

    #[error("Bad arguments: {0}")]
    BadArgument(String),

    #[error("Bad vector size: expected {expected} bytes, got {actual}")]
    BadVectorSize { expected: usize, actual: usize },

    #[error("Vector element too large: {0}")]
    ElementTooLarge(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Invalid dialect: {0}")]
    InvalidDialect(String),

    #[error("Timeout limit was reached")]
    Timeout,

    #[error("Not enough memory available to execute the query")]
    OutOfMemory,

    #[error("Cursor not found, id: {0}")]
    CursorNotFound(u64),

    #[error("Policy mismatch: {0}")]
    PolicyMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn syntax(msg: impl Into<String>) -> Self {
        Error::Syntax(msg.into())
    }

    pub fn bad_argument(msg: impl Into<String>) -> Self {
        Error::BadArgument(msg.into())
    }

    pub fn unknown_field(name: impl Into<String>) -> Self {
        Error::UnknownField(name.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Leading token of the wire error reply.
    pub fn kind_token(&self) -> &'static str {
        match self {
            Error::Syntax(_) => "SYNTAX",
            Error::UnknownIndex(_) => "NOINDEX",
            Error::IndexExists(_) => "EXISTS",
            Error::UnknownField(_) => "NOFIELD",
            Error::DuplicateField(_) => "DUPFIELD",
            Error::BadArgument(_) => "BADARGS",
            Error::BadVectorSize { .. } => "BADVECSIZE",
            Error::ElementTooLarge(_) => "ELEMTOOLARGE",
            Error::UnsupportedType(_) => "UNSUPPORTED",
            Error::InvalidDialect(_) => "DIALECT",
            Error::Timeout => "TIMEOUT",
            Error::OutOfMemory => "OOM",
            Error::CursorNotFound(_) => "NOCURSOR",
            Error::PolicyMismatch(_) => "POLICY",
            Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => "ERR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tokens_are_distinct_for_user_errors() {
        let errors = [
            Error::syntax("x"),
            Error::UnknownIndex("x".into()),
            Error::unknown_field("x"),
            Error::DuplicateField("x".into()),
            Error::bad_argument("x"),
            Error::BadVectorSize {
                expected: 8,
                actual: 4,
            },
            Error::ElementTooLarge("x".into()),
            Error::UnsupportedType("x".into()),
            Error::InvalidDialect("x".into()),
            Error::Timeout,
            Error::OutOfMemory,
            Error::CursorNotFound(1),
            Error::PolicyMismatch("x".into()),
        ];
        let mut tokens: Vec<_> = errors.iter().map(|e| e.kind_token()).collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), errors.len());
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(Error::Timeout.to_string(), "Timeout limit was reached");
    }
}
