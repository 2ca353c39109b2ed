//! Error types for KVSQL
//!
//! Every failure in the engine resolves to one of these variants. Statement
//! execution turns them into failure responses; nothing here aborts the
//! process.

use thiserror::Error;

/// The main error type for KVSQL
#[derive(Error, Debug)]
pub enum Error {
    // ========== Lexer Errors ==========
    #[error("Lexer error: unexpected character '{0}' at position {1}")]
    UnexpectedCharacter(char, usize),

    #[error("Lexer error: unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("Lexer error: invalid number format at position {0}")]
    InvalidNumber(usize),

    // ========== Parser Errors ==========
    #[error("Parse error: unexpected token '{found}', expected {expected}")]
    UnexpectedToken { expected: String, found: String },

    #[error("Parse error: unexpected end of input, expected {0}")]
    UnexpectedEof(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ========== Planning Errors ==========
    #[error("Planning error: {0}")]
    Plan(String),

    #[error("Planning error: unknown function '{0}'")]
    UnknownFunction(String),

    // ========== Catalog Errors ==========
    #[error("Catalog error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Catalog error: index '{0}' not found")]
    IndexNotFound(String),

    #[error("Catalog error: index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Catalog error: notification '{0}' not found")]
    NotificationNotFound(String),

    #[error("Catalog error: notification '{0}' already exists")]
    NotificationAlreadyExists(String),

    #[error("Catalog error: field name '{0}' is reserved")]
    ReservedField(String),

    // ========== Evaluation Errors ==========
    #[error("Type error: {0}")]
    TypeMismatch(String),

    #[error("Execution error: division by zero")]
    DivisionByZero,

    #[error("Execution error: cannot order by {0} value")]
    UnorderableValue(&'static str),

    /// Raised while a compiled program runs. The op position and stage name
    /// are diagnostic context only; `user_message` drops them.
    #[error("Runtime error: op {op} ({stage}): {message}")]
    Runtime {
        op: usize,
        stage: String,
        message: String,
    },

    // ========== Storage Errors ==========
    #[error("Storage error on '{key}': {message}")]
    Storage { key: String, message: String },

    #[error("Storage error: corrupt record in '{key}': {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Transaction Errors ==========
    #[error("Transaction error: record {id} in '{table}' was modified by transaction {xid}")]
    WriteConflict { table: String, id: i64, xid: i64 },

    // ========== Configuration Errors ==========
    #[error("Configuration error: {0}")]
    Config(String),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Message suitable for a client response, without internal diagnostic
    /// prefixes.
    pub fn user_message(&self) -> String {
        match self {
            Error::Runtime { message, .. } => message.clone(),
            Error::Storage { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn storage(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Storage {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for KVSQL operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::IndexNotFound("idx".to_string());
        assert_eq!(err.to_string(), "Catalog error: index 'idx' not found");

        let err = Error::UnexpectedCharacter('@', 5);
        assert_eq!(
            err.to_string(),
            "Lexer error: unexpected character '@' at position 5"
        );
    }

    #[test]
    fn test_user_message_strips_diagnostics() {
        let err = Error::Runtime {
            op: 3,
            stage: "OrderStage".to_string(),
            message: "Execution error: cannot order by list value".to_string(),
        };
        assert!(err.to_string().starts_with("Runtime error: op 3 (OrderStage)"));
        assert_eq!(
            err.user_message(),
            "Execution error: cannot order by list value"
        );

        let err = Error::storage("seq:t", "counter overflow");
        assert_eq!(err.user_message(), "counter overflow");
    }
}
