//! Storage driver abstraction.
//!
//! The registry persists everything (blob data, link files, the descriptor
//! cache, the scheduler snapshot) through this driver, keyed by opaque
//! slash-separated paths.  One production backend exists: the local
//! filesystem.

pub mod filesystem;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use filesystem::FilesystemDriver;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Metadata for a stored object.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Byte-oriented key-value storage with streaming reads and writes.
///
/// Keys are slash-separated relative paths.  `rename` is atomic on the
/// filesystem backend and is what makes blob commits and snapshot writes
/// safe against torn state.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Read the full content at `key`.
    async fn get_content(&self, key: &str) -> StorageResult<Bytes>;

    /// Write `content` at `key`, atomically replacing any previous value.
    async fn put_content(&self, key: &str, content: Bytes) -> StorageResult<()>;

    /// Open a streaming reader for the object at `key`.
    async fn reader(&self, key: &str) -> StorageResult<Box<dyn AsyncRead + Send + Unpin>>;

    /// Open a streaming writer at `key`, truncating any previous value.
    async fn writer(&self, key: &str) -> StorageResult<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Open a writer on a fresh uniquely-named scratch object in the
    /// driver's upload area, returning its key.  The caller finishes the
    /// write by renaming the key into place, or discards it with `delete`.
    async fn scratch_writer(&self)
        -> StorageResult<(String, Box<dyn AsyncWrite + Send + Unpin>)>;

    /// Stat the object or directory at `key`.
    async fn stat(&self, key: &str) -> StorageResult<FileInfo>;

    /// Delete the object at `key`; directories are removed recursively.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Atomically move `from` to `to`.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// List every object key below `prefix`, sorted.
    async fn walk(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
