//! Registry error domain.
//!
//! Every kind the proxy recognizes is a distinct variant so callers can
//! branch on it; the HTTP layer maps each variant to an OCI error-envelope
//! code and status.  `BlobMounted` is a control-flow carrier, not a failure:
//! it signals that a `create` with a mount option linked an existing public
//! blob into the requested repository.

use thiserror::Error;

use crate::digest::{Descriptor, Digest};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(Digest),

    #[error("manifest unknown to registry: {0}")]
    ManifestUnknown(String),

    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    #[error("invalid tag: {0}")]
    TagInvalid(String),

    #[error("upstream rejected credentials: {0}")]
    Unauthorized(String),

    #[error("operation unsupported")]
    Unsupported,

    #[error("blob mounted from existing repository content")]
    BlobMounted(Descriptor),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::UpstreamUnavailable(err.to_string())
    }
}

impl Error {
    /// OCI error-envelope code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BlobUnknown(_) => "BLOB_UNKNOWN",
            Error::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            Error::DigestInvalid(_) => "DIGEST_INVALID",
            Error::NameInvalid(_) => "NAME_INVALID",
            Error::TagInvalid(_) => "TAG_INVALID",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Unsupported => "UNSUPPORTED",
            Error::BlobMounted(_) => "BLOB_MOUNTED",
            Error::UpstreamUnavailable(_) => "UNAVAILABLE",
            Error::Storage(_) => "UNKNOWN",
        }
    }
}
