//! JSON codec for operations.
//!
//! Decoding rejects anything that would otherwise reach the merge logic in
//! an undefined shape: a missing or non-string payload `id`, an unknown
//! `kind`, or an id that does not match `{siteId}-{vectorClock[siteId]}`.

use boardsync_core::{Operation, OperationError};
use serde_json::error::Category;

/// Decode and validate one operation.
///
/// # Errors
///
/// - [`CodecError::Json`] if the input is not well-formed JSON.
/// - [`CodecError::InvalidOperation`] if it is JSON but not a valid operation.
pub fn decode_operation(json: &str) -> Result<Operation, CodecError> {
    let op: Operation = serde_json::from_str(json).map_err(CodecError::from_json)?;
    op.validate()?;
    Ok(op)
}

/// Decode and validate a JSON array of operations.
///
/// # Errors
///
/// Fails on the first malformed element; see [`decode_operation`].
pub fn decode_batch(json: &str) -> Result<Vec<Operation>, CodecError> {
    let ops: Vec<Operation> = serde_json::from_str(json).map_err(CodecError::from_json)?;
    for op in &ops {
        op.validate()?;
    }
    Ok(ops)
}

/// Encode an operation in its interop shape.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_operation(op: &Operation) -> Result<String, CodecError> {
    serde_json::to_string(op).map_err(|e| CodecError::Serialize(e.to_string()))
}

/// Errors at the JSON boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Input is not well-formed JSON
    #[error("malformed JSON: {0}")]
    Json(String),
    /// Well-formed JSON that is not a valid operation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Serialization failed
    #[error("serialize error: {0}")]
    Serialize(String),
}

impl CodecError {
    fn from_json(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Data => CodecError::InvalidOperation(err.to_string()),
            Category::Io | Category::Syntax | Category::Eof => CodecError::Json(err.to_string()),
        }
    }
}

impl From<OperationError> for CodecError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::InvalidOperation(msg) => CodecError::InvalidOperation(msg),
        }
    }
}
