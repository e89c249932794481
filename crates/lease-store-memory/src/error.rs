use leasehold_lease_store::{CodecError, LeaseStoreError};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Injected transient failure.
    #[error("memory lease store unavailable")]
    Unavailable,

    /// Injected permanent failure.
    #[error("memory lease store rejected the request")]
    Rejected,

    /// A stored value is not a lease record.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl LeaseStoreError for Error {
    fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}
