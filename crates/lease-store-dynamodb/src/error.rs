use leasehold_lease_store::LeaseStoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid store options.
    #[error("config error: {0}")]
    Config(String),

    /// A DynamoDB request failed.
    #[error("DynamoDB {operation} failed: {source}")]
    Request {
        /// The DynamoDB operation that failed.
        operation: &'static str,
        /// Whether the failure is transient.
        retriable: bool,
        /// The SDK error.
        #[source]
        source: Box<aws_sdk_dynamodb::Error>,
    },

    /// An item in the table is not a lease record.
    #[error("malformed lease item: {0}")]
    MalformedItem(String),
}

impl LeaseStoreError for Error {
    fn is_retriable(&self) -> bool {
        match self {
            Self::Request { retriable, .. } => *retriable,
            Self::Config(_) | Self::MalformedItem(_) => false,
        }
    }
}
