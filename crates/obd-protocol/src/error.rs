//! Error types for ELM327 response decoding

use thiserror::Error;

/// Errors that can occur while turning adapter text into values
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The adapter answered with one of its error lines (`NO DATA`, `?`, ...)
    #[error("adapter reported: {0}")]
    AdapterError(String),

    /// No hex payload was found in the response
    #[error("empty response")]
    Empty,

    /// Response contained a dangling nibble or otherwise malformed hex
    #[error("invalid hex in response: {0}")]
    InvalidHex(String),

    /// Formula evaluation failed
    #[error(transparent)]
    Formula(#[from] FormulaError),

    /// Unknown protocol code
    #[error("unknown protocol code: {0}")]
    UnknownProtocol(String),

    /// The data answers a different request
    #[error("expected a response to {expected}, got {found}")]
    UnexpectedResponse { expected: String, found: String },

    /// Trouble code text that is not `P0133`-shaped
    #[error("invalid trouble code: {0}")]
    InvalidDtc(String),

    /// The vehicle identification did not carry 17 characters
    #[error("invalid VIN: {0}")]
    InvalidVin(String),
}

/// Errors produced while compiling or evaluating a PID formula
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    /// Formula text could not be parsed
    #[error("invalid formula at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    /// The formula references a byte the response did not carry
    #[error("formula needs byte {variable} but response has {available} data bytes")]
    MissingByte { variable: char, available: usize },

    /// Division by zero during evaluation
    #[error("division by zero")]
    DivisionByZero,
}

pub type Result<T> = std::result::Result<T, ParseError>;
