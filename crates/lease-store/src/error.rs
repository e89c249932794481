use thiserror::Error;

/// Error encoding or decoding a persisted lease record.
#[derive(Debug, Error)]
#[error("malformed lease record: {0}")]
pub struct CodecError(#[from] serde_json::Error);
