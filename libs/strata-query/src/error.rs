use thiserror::Error;

/// Errors raised while validating or decoding a query.
///
/// All of them are detected before a backend sees the query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("field path is empty")]
    EmptyPath,

    #[error("field path '{0}' has an empty or reserved segment")]
    EmptySegment(String),

    #[error("field path '{0}' contains a quote or backslash")]
    IllegalCharacter(String),

    #[error("operand for '{path}' must be a scalar, got {found}")]
    NonScalarOperand { path: String, found: &'static str },

    #[error("range comparison on '{0}' cannot use a null operand")]
    NullRangeOperand(String),

    #[error("invalid pattern for '{path}': {message}")]
    InvalidPattern { path: String, message: String },

    #[error("unknown query operator '{0}'")]
    UnknownOperator(String),

    #[error("query object is missing '{0}'")]
    MissingField(&'static str),
}

pub type QueryResult<T> = Result<T, QueryError>;
