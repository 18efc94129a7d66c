//! Local registry namespace.
//!
//! Content-addressable storage plus per-repository link trees, laid out on
//! the storage driver:
//!
//! - `blobs/{algo}/{hex[..2]}/{hex}/data` - shared CAS data
//! - `repositories/{name}/_layers/{algo}/{hex}/link` - blob membership
//! - `repositories/{name}/_manifests/revisions/{algo}/{hex}/link` - manifests
//! - `repositories/{name}/_tags/{tag}/current/link` - tags
//! - `descriptors/{algo}/{hex}.json` - descriptor cache (incl. `public`)
//!
//! A repository "has" a blob when its link file exists; the bytes live once
//! in the CAS.  Cross-repository mounts are link writes, never byte copies.

pub mod blobs;
pub mod manifests;
pub mod tags;

use std::sync::Arc;

use tracing::debug;

use crate::digest::{Descriptor, Digest, OCTET_STREAM};
use crate::error::{Error, Result};
use crate::reference::RepositoryName;
use crate::storage::{StorageDriver, StorageError};

pub use blobs::{BlobWriter, CreateOptions, LocalBlobStore};
pub use manifests::{LocalManifestStore, Manifest};
pub use tags::LocalTagStore;

// ---------------------------------------------------------------------------
// Path layout
// ---------------------------------------------------------------------------

pub(crate) fn blob_data_path(digest: &Digest) -> String {
    format!(
        "blobs/{}/{}/{}/data",
        digest.algorithm(),
        &digest.hex()[..2],
        digest.hex()
    )
}

pub(crate) fn blob_dir_path(digest: &Digest) -> String {
    format!(
        "blobs/{}/{}/{}",
        digest.algorithm(),
        &digest.hex()[..2],
        digest.hex()
    )
}

pub(crate) fn layer_link_path(name: &RepositoryName, digest: &Digest) -> String {
    format!(
        "repositories/{}/_layers/{}/{}/link",
        name,
        digest.algorithm(),
        digest.hex()
    )
}

pub(crate) fn revision_link_path(name: &RepositoryName, digest: &Digest) -> String {
    format!(
        "repositories/{}/_manifests/revisions/{}/{}/link",
        name,
        digest.algorithm(),
        digest.hex()
    )
}

pub(crate) fn tags_root_path(name: &RepositoryName) -> String {
    format!("repositories/{name}/_tags")
}

pub(crate) fn tag_dir_path(name: &RepositoryName, tag: &str) -> String {
    format!("repositories/{name}/_tags/{tag}")
}

pub(crate) fn tag_link_path(name: &RepositoryName, tag: &str) -> String {
    format!("repositories/{name}/_tags/{tag}/current/link")
}

pub(crate) fn descriptor_path(digest: &Digest) -> String {
    format!("descriptors/{}/{}.json", digest.algorithm(), digest.hex())
}

// ---------------------------------------------------------------------------
// LocalRegistry
// ---------------------------------------------------------------------------

/// The embedded local namespace: hands out per-repository stores and owns
/// the cross-repository facilities (descriptor cache, CAS vacuum,
/// enumeration).
#[derive(Clone)]
pub struct LocalRegistry {
    driver: Arc<dyn StorageDriver>,
    descriptors: DescriptorCache,
}

impl LocalRegistry {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        let descriptors = DescriptorCache {
            driver: Arc::clone(&driver),
        };
        LocalRegistry {
            driver,
            descriptors,
        }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn descriptors(&self) -> &DescriptorCache {
        &self.descriptors
    }

    pub fn repository(&self, name: RepositoryName) -> LocalRepository {
        LocalRepository {
            driver: Arc::clone(&self.driver),
            descriptors: self.descriptors.clone(),
            name,
        }
    }

    /// Enumerate every blob digest present in the CAS.
    pub async fn enumerate_blobs(&self) -> Result<Vec<Digest>> {
        let keys = self.driver.walk("blobs").await.map_err(Error::from)?;
        let mut digests = Vec::new();
        for key in keys {
            let parts: Vec<&str> = key.split('/').collect();
            // blobs/{algo}/{prefix}/{hex}/data
            if parts.len() == 5 && parts[4] == "data" {
                match format!("{}:{}", parts[1], parts[3]).parse::<Digest>() {
                    Ok(digest) => digests.push(digest),
                    Err(_) => debug!(key, "skipping non-digest entry in blob store"),
                }
            }
        }
        Ok(digests)
    }

    /// Remove a blob's data from the CAS.  Link files are left to the
    /// per-repository delete; a dangling link reads as blob-unknown.
    pub async fn remove_blob_data(&self, digest: &Digest) -> Result<()> {
        match self.driver.delete(&blob_dir_path(digest)).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle for one repository's local stores.
#[derive(Clone)]
pub struct LocalRepository {
    driver: Arc<dyn StorageDriver>,
    descriptors: DescriptorCache,
    name: RepositoryName,
}

impl LocalRepository {
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    pub fn blobs(&self) -> LocalBlobStore {
        LocalBlobStore::new(
            Arc::clone(&self.driver),
            self.name.clone(),
            self.descriptors.clone(),
        )
    }

    pub fn manifests(&self) -> LocalManifestStore {
        LocalManifestStore::new(
            Arc::clone(&self.driver),
            self.name.clone(),
            self.descriptors.clone(),
        )
    }

    pub fn tags(&self) -> LocalTagStore {
        LocalTagStore::new(Arc::clone(&self.driver), self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Descriptor cache
// ---------------------------------------------------------------------------

/// Digest-keyed descriptor records, shared across all repositories.
///
/// Reads-then-writes are not compare-and-swapped; the double-write race on
/// the `public` annotation is benign because both writers store the same
/// value.
#[derive(Clone)]
pub struct DescriptorCache {
    driver: Arc<dyn StorageDriver>,
}

impl DescriptorCache {
    pub async fn get(&self, digest: &Digest) -> Result<Option<Descriptor>> {
        match self.driver.get_content(&descriptor_path(digest)).await {
            Ok(raw) => match serde_json::from_slice::<Descriptor>(&raw) {
                Ok(desc) => Ok(Some(desc)),
                Err(e) => {
                    debug!(%digest, error = %e, "discarding unparseable descriptor record");
                    Ok(None)
                }
            },
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set(&self, descriptor: &Descriptor) -> Result<()> {
        let raw = serde_json::to_vec(descriptor)
            .map_err(|e| Error::Storage(StorageError::Io(std::io::Error::other(e))))?;
        self.driver
            .put_content(&descriptor_path(&descriptor.digest), raw.into())
            .await?;
        Ok(())
    }

    /// Mark a blob as publicly obtainable, making it eligible for the
    /// cross-repository auto-mount path.  Returns `true` if the annotation
    /// was newly added.
    pub async fn set_public(&self, digest: &Digest, size_hint: u64) -> Result<bool> {
        let mut desc = match self.get(digest).await? {
            Some(desc) => desc,
            None => Descriptor::new(digest.clone(), size_hint, OCTET_STREAM),
        };
        if desc.is_public() {
            return Ok(false);
        }
        desc.annotations
            .insert("public".to_string(), "true".to_string());
        self.set(&desc).await?;
        Ok(true)
    }

    pub async fn remove(&self, digest: &Digest) -> Result<()> {
        match self.driver.delete(&descriptor_path(digest)).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemDriver;
    use bytes::Bytes;

    async fn registry() -> (tempfile::TempDir, LocalRegistry) {
        let temp = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(temp.path().join("registry"))
            .await
            .unwrap();
        (temp, LocalRegistry::new(Arc::new(driver)))
    }

    #[tokio::test]
    async fn descriptor_cache_set_get_remove() {
        let (_temp, registry) = registry().await;
        let digest = Digest::from_bytes(b"blob");
        let desc = Descriptor::new(digest.clone(), 4, OCTET_STREAM);

        assert!(registry.descriptors().get(&digest).await.unwrap().is_none());
        registry.descriptors().set(&desc).await.unwrap();
        assert_eq!(registry.descriptors().get(&digest).await.unwrap(), Some(desc));
        registry.descriptors().remove(&digest).await.unwrap();
        assert!(registry.descriptors().get(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_public_is_idempotent() {
        let (_temp, registry) = registry().await;
        let digest = Digest::from_bytes(b"blob");

        assert!(registry.descriptors().set_public(&digest, 4).await.unwrap());
        assert!(!registry.descriptors().set_public(&digest, 4).await.unwrap());
        let desc = registry.descriptors().get(&digest).await.unwrap().unwrap();
        assert!(desc.is_public());
    }

    #[tokio::test]
    async fn enumerate_blobs_finds_cas_entries() {
        let (_temp, registry) = registry().await;
        let digest = Digest::from_bytes(b"enumerate-me");
        registry
            .driver()
            .put_content(&blob_data_path(&digest), Bytes::from_static(b"enumerate-me"))
            .await
            .unwrap();

        let found = registry.enumerate_blobs().await.unwrap();
        assert_eq!(found, vec![digest]);
    }

    #[tokio::test]
    async fn remove_blob_data_vacuums_cas() {
        let (_temp, registry) = registry().await;
        let digest = Digest::from_bytes(b"vacuum-me");
        registry
            .driver()
            .put_content(&blob_data_path(&digest), Bytes::from_static(b"vacuum-me"))
            .await
            .unwrap();

        registry.remove_blob_data(&digest).await.unwrap();
        assert!(registry.enumerate_blobs().await.unwrap().is_empty());
        // removing an already-absent blob is not an error
        registry.remove_blob_data(&digest).await.unwrap();
    }
}
