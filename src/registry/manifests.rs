//! Local manifest store.
//!
//! Manifest payloads are stored whole in the CAS (they are small) with a
//! per-repository revision link.  The media type is recorded in the
//! descriptor cache at put time; older records fall back to sniffing the
//! payload's `mediaType` field.

use std::sync::Arc;

use bytes::Bytes;

use crate::digest::{Descriptor, Digest};
use crate::error::{Error, Result};
use crate::reference::RepositoryName;
use crate::storage::{StorageDriver, StorageError};

use super::{blob_data_path, revision_link_path, DescriptorCache};

/// Default media type for manifests with no recorded type.
pub const MANIFEST_V2_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A manifest payload and its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub digest: Digest,
    pub media_type: String,
    pub payload: Bytes,
}

pub struct LocalManifestStore {
    driver: Arc<dyn StorageDriver>,
    name: RepositoryName,
    descriptors: DescriptorCache,
}

impl LocalManifestStore {
    pub(super) fn new(
        driver: Arc<dyn StorageDriver>,
        name: RepositoryName,
        descriptors: DescriptorCache,
    ) -> Self {
        LocalManifestStore {
            driver,
            name,
            descriptors,
        }
    }

    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        match self
            .driver
            .stat(&revision_link_path(&self.name, digest))
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, digest: &Digest) -> Result<Manifest> {
        if !self.exists(digest).await? {
            return Err(Error::ManifestUnknown(digest.to_string()));
        }

        let payload = match self.driver.get_content(&blob_data_path(digest)).await {
            Ok(payload) => payload,
            Err(StorageError::NotFound(_)) => {
                return Err(Error::ManifestUnknown(digest.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let media_type = match self.descriptors.get(digest).await? {
            Some(desc) => desc.media_type,
            None => sniff_media_type(&payload),
        };

        Ok(Manifest {
            digest: digest.clone(),
            media_type,
            payload,
        })
    }

    /// Store a manifest payload and link it into this repository.
    pub async fn put(&self, payload: Bytes, media_type: &str) -> Result<Descriptor> {
        let digest = Digest::from_bytes(&payload);
        let size = payload.len() as u64;

        self.driver
            .put_content(&blob_data_path(&digest), payload)
            .await?;
        self.driver
            .put_content(
                &revision_link_path(&self.name, &digest),
                digest.to_string().into_bytes().into(),
            )
            .await?;

        // Record the media type, preserving any annotations already present.
        let mut descriptor = match self.descriptors.get(&digest).await? {
            Some(existing) => existing,
            None => Descriptor::new(digest.clone(), size, media_type),
        };
        descriptor.size = size;
        descriptor.media_type = media_type.to_string();
        self.descriptors.set(&descriptor).await?;

        Ok(descriptor)
    }

    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        match self
            .driver
            .delete(&revision_link_path(&self.name, digest))
            .await
        {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => Err(Error::ManifestUnknown(digest.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

fn sniff_media_type(payload: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("mediaType")?.as_str().map(String::from))
        .unwrap_or_else(|| MANIFEST_V2_TYPE.to_string())
}
