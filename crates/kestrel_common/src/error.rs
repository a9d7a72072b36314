//! Error taxonomy for the broker pipeline.
//!
//! Every error kind carries a stable numeric code for wire compatibility;
//! codes never change meaning across releases. Errors that correspond to a
//! subset of shards are collected into the response's exception list, never
//! thrown: only whole-query compile/validate failures short-circuit the
//! pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for `Result<T, QueryError>`.
pub type QueryResult<T> = Result<T, QueryError>;

/// Stable numeric error codes, shared with the servers over the wire.
pub const JSON_PARSING_ERROR_CODE: i32 = 100;
pub const PQL_PARSING_ERROR_CODE: i32 = 150;
pub const QUERY_VALIDATION_ERROR_CODE: i32 = 230;
pub const BROKER_GATHER_ERROR_CODE: i32 = 427;
pub const DATA_TABLE_DESERIALIZATION_ERROR_CODE: i32 = 450;
pub const MERGE_RESPONSE_ERROR_CODE: i32 = 500;
pub const INTERNAL_ERROR_CODE: i32 = 550;

/// Top-level error type for the broker query pipeline.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("JSON parsing error: {0}")]
    JsonParsing(String),

    #[error("PQL parsing error: {0}")]
    PqlParsing(String),

    #[error("Query validation error: {0}")]
    QueryValidation(String),

    /// A shard timed out or its transport failed during gather.
    #[error("Broker gather error: {0}")]
    BrokerGather(String),

    /// A shard's response payload could not be decoded.
    #[error("Data table deserialization error: {0}")]
    DataTableDeserialization(String),

    /// A shard's data schema conflicted with the reference schema during reduce.
    #[error("Merge response error: {0}")]
    MergeResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// The stable numeric code carried on the wire for this error kind.
    pub fn error_code(&self) -> i32 {
        match self {
            QueryError::JsonParsing(_) => JSON_PARSING_ERROR_CODE,
            QueryError::PqlParsing(_) => PQL_PARSING_ERROR_CODE,
            QueryError::QueryValidation(_) => QUERY_VALIDATION_ERROR_CODE,
            QueryError::BrokerGather(_) => BROKER_GATHER_ERROR_CODE,
            QueryError::DataTableDeserialization(_) => DATA_TABLE_DESERIALIZATION_ERROR_CODE,
            QueryError::MergeResponse(_) => MERGE_RESPONSE_ERROR_CODE,
            QueryError::Internal(_) => INTERNAL_ERROR_CODE,
        }
    }

    /// Short tag used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::JsonParsing(_) => "json_parsing",
            QueryError::PqlParsing(_) => "pql_parsing",
            QueryError::QueryValidation(_) => "query_validation",
            QueryError::BrokerGather(_) => "broker_gather",
            QueryError::DataTableDeserialization(_) => "data_table_deserialization",
            QueryError::MergeResponse(_) => "merge_response",
            QueryError::Internal(_) => "internal",
        }
    }
}

/// A single processing exception attached to a broker response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingException {
    #[serde(rename = "errorCode")]
    pub error_code: i32,
    pub message: String,
}

impl ProcessingException {
    pub fn new(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }
}

impl From<&QueryError> for ProcessingException {
    fn from(e: &QueryError) -> Self {
        ProcessingException::new(e.error_code(), e.to_string())
    }
}

impl From<QueryError> for ProcessingException {
    fn from(e: QueryError) -> Self {
        ProcessingException::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(QueryError::PqlParsing("x".into()).error_code(), 150);
        assert_eq!(QueryError::QueryValidation("x".into()).error_code(), 230);
        assert_eq!(QueryError::BrokerGather("x".into()).error_code(), 427);
        assert_eq!(QueryError::MergeResponse("x".into()).error_code(), 500);
    }

    #[test]
    fn exception_carries_code_and_message() {
        let exc = ProcessingException::from(QueryError::BrokerGather("server s1 timed out".into()));
        assert_eq!(exc.error_code, 427);
        assert!(exc.message.contains("s1 timed out"));
    }
}
