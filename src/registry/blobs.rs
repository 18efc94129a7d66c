//! Local blob store: digest-verified writes into the CAS plus per-repository
//! link management, including the cross-repository mount path.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::digest::{Algorithm, Descriptor, Digest, Digester, OCTET_STREAM};
use crate::error::{Error, Result};
use crate::reference::RepositoryName;
use crate::storage::{StorageDriver, StorageError};

use super::{blob_data_path, layer_link_path, DescriptorCache};

/// Options for [`LocalBlobStore::create`].
#[derive(Debug, Default)]
pub struct CreateOptions {
    /// Attempt a cross-repository mount of this digest instead of opening a
    /// writer.  When set, `create` always returns an error: the
    /// `BlobMounted` sentinel on success, `BlobUnknown` otherwise.
    pub mount: Option<Digest>,
    /// Digest algorithm for a new write.
    pub algorithm: Option<Algorithm>,
}

impl CreateOptions {
    pub fn mount(digest: Digest) -> Self {
        CreateOptions {
            mount: Some(digest),
            algorithm: None,
        }
    }

    pub fn for_digest(digest: &Digest) -> Self {
        CreateOptions {
            mount: None,
            algorithm: Some(digest.algorithm()),
        }
    }
}

/// One repository's view of the blob CAS.
pub struct LocalBlobStore {
    driver: Arc<dyn StorageDriver>,
    name: RepositoryName,
    descriptors: DescriptorCache,
}

impl LocalBlobStore {
    pub(super) fn new(
        driver: Arc<dyn StorageDriver>,
        name: RepositoryName,
        descriptors: DescriptorCache,
    ) -> Self {
        LocalBlobStore {
            driver,
            name,
            descriptors,
        }
    }

    /// Stat a blob in this repository.  Requires both the repository link
    /// and the CAS data; a dangling link (data vacuumed through another
    /// repository) reads as unknown so the caller re-fetches.
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        self.require_link(digest).await?;
        let info = match self.driver.stat(&blob_data_path(digest)).await {
            Ok(info) => info,
            Err(StorageError::NotFound(_)) => return Err(Error::BlobUnknown(digest.clone())),
            Err(e) => return Err(e.into()),
        };

        let media_type = match self.descriptors.get(digest).await? {
            Some(desc) => desc.media_type,
            None => OCTET_STREAM.to_string(),
        };
        Ok(Descriptor::new(digest.clone(), info.size, media_type))
    }

    /// Open a streaming reader over a blob's bytes.
    pub async fn open(
        &self,
        digest: &Digest,
    ) -> Result<(Descriptor, Box<dyn AsyncRead + Send + Unpin>)> {
        let descriptor = self.stat(digest).await?;
        let reader = match self.driver.reader(&blob_data_path(digest)).await {
            Ok(reader) => reader,
            Err(StorageError::NotFound(_)) => return Err(Error::BlobUnknown(digest.clone())),
            Err(e) => return Err(e.into()),
        };
        Ok((descriptor, reader))
    }

    /// Begin a blob write, or attempt a mount when [`CreateOptions::mount`]
    /// is set.
    ///
    /// The mount path consults the descriptor cache: if the digest is known,
    /// annotated `public=true`, and its data is present in the CAS, the blob
    /// is linked into this repository and the `BlobMounted` sentinel is
    /// returned carrying the mounted descriptor.
    pub async fn create(&self, options: CreateOptions) -> Result<BlobWriter> {
        if let Some(digest) = options.mount {
            return Err(self.mount_existing(&digest).await);
        }

        let algorithm = options.algorithm.unwrap_or(Algorithm::Sha256);
        let (key, file) = self.driver.scratch_writer().await?;
        Ok(BlobWriter {
            driver: Arc::clone(&self.driver),
            name: self.name.clone(),
            key,
            file,
            digester: Digester::new(algorithm),
            size: 0,
        })
    }

    /// Remove this repository's link to a blob.  The CAS data is left for
    /// the vacuum run by the expiry callback.
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        match self.driver.delete(&layer_link_path(&self.name, digest)).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => Err(Error::BlobUnknown(digest.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn require_link(&self, digest: &Digest) -> Result<()> {
        match self.driver.stat(&layer_link_path(&self.name, digest)).await {
            Ok(_) => Ok(()),
            Err(StorageError::NotFound(_)) => Err(Error::BlobUnknown(digest.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn mount_existing(&self, digest: &Digest) -> Error {
        let descriptor = match self.descriptors.get(digest).await {
            Ok(Some(desc)) if desc.is_public() => desc,
            Ok(_) => return Error::BlobUnknown(digest.clone()),
            Err(e) => return e,
        };

        if self.driver.stat(&blob_data_path(digest)).await.is_err() {
            return Error::BlobUnknown(digest.clone());
        }

        if let Err(e) = self
            .driver
            .put_content(
                &layer_link_path(&self.name, digest),
                digest.to_string().into_bytes().into(),
            )
            .await
        {
            return e.into();
        }

        debug!(repo = %self.name, %digest, "mounted public blob");
        Error::BlobMounted(descriptor)
    }
}

/// In-progress blob write.  Bytes land in a uniquely-named scratch object
/// in the driver's upload area and are hashed as they arrive; `commit`
/// renames them into the CAS only when the computed digest equals the
/// expected one, so a partial or corrupt blob is never observable at its
/// content address.
pub struct BlobWriter {
    driver: Arc<dyn StorageDriver>,
    name: RepositoryName,
    key: String,
    file: Box<dyn AsyncWrite + Send + Unpin>,
    digester: Digester,
    size: u64,
}

impl BlobWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| Error::Storage(StorageError::Io(e)))?;
        self.digester.update(chunk);
        self.size += chunk.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish the write: verify the digest, move the data into the CAS, and
    /// link it into the repository.
    pub async fn commit(mut self, expected: &Digest) -> Result<Descriptor> {
        self.file
            .shutdown()
            .await
            .map_err(|e| Error::Storage(StorageError::Io(e)))?;

        let computed = self.digester.finalize();
        if computed != *expected {
            let _ = self.driver.delete(&self.key).await;
            return Err(Error::DigestInvalid(format!(
                "content digest {computed} does not match requested {expected}"
            )));
        }

        self.driver
            .rename(&self.key, &blob_data_path(expected))
            .await?;

        self.driver
            .put_content(
                &layer_link_path(&self.name, expected),
                expected.to_string().into_bytes().into(),
            )
            .await?;

        Ok(Descriptor::new(expected.clone(), self.size, OCTET_STREAM))
    }

    /// Abandon the write and discard the scratch object.
    pub async fn cancel(mut self) {
        let _ = self.file.shutdown().await;
        let _ = self.driver.delete(&self.key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;
    use crate::storage::FilesystemDriver;
    use tokio::io::AsyncReadExt;

    async fn fixture() -> (tempfile::TempDir, LocalRegistry) {
        let temp = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(temp.path().join("registry"))
            .await
            .unwrap();
        (temp, LocalRegistry::new(Arc::new(driver)))
    }

    async fn write_blob(registry: &LocalRegistry, repo: &str, data: &[u8]) -> Descriptor {
        let store = registry.repository(repo.parse().unwrap()).blobs();
        let digest = Digest::from_bytes(data);
        let mut writer = store.create(CreateOptions::for_digest(&digest)).await.unwrap();
        writer.write(data).await.unwrap();
        writer.commit(&digest).await.unwrap()
    }

    #[tokio::test]
    async fn commit_then_stat_and_open() {
        let (_temp, registry) = fixture().await;
        let desc = write_blob(&registry, "library/app", b"layer-bytes").await;
        assert_eq!(desc.size, 11);

        let store = registry.repository("library/app".parse().unwrap()).blobs();
        let stat = store.stat(&desc.digest).await.unwrap();
        assert_eq!(stat.size, 11);

        let (_, mut reader) = store.open(&desc.digest).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"layer-bytes");
        assert_eq!(Digest::from_bytes(&buf), desc.digest);
    }

    #[tokio::test]
    async fn digest_mismatch_discards_the_write() {
        let (_temp, registry) = fixture().await;
        let store = registry.repository("library/app".parse().unwrap()).blobs();
        let wrong = Digest::from_bytes(b"something-else");

        let mut writer = store.create(CreateOptions::for_digest(&wrong)).await.unwrap();
        writer.write(b"actual-bytes").await.unwrap();
        let err = writer.commit(&wrong).await.unwrap_err();
        assert!(matches!(err, Error::DigestInvalid(_)));

        // No partial blob is observable, and the upload area is gone.
        assert!(matches!(store.stat(&wrong).await, Err(Error::BlobUnknown(_))));
        assert!(registry.driver().walk("_uploads").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stat_unlinked_blob_is_unknown() {
        let (_temp, registry) = fixture().await;
        write_blob(&registry, "library/app", b"data").await;

        // Same digest, different repository: no link, so unknown.
        let other = registry.repository("library/other".parse().unwrap()).blobs();
        let digest = Digest::from_bytes(b"data");
        assert!(matches!(other.stat(&digest).await, Err(Error::BlobUnknown(_))));
    }

    #[tokio::test]
    async fn mount_links_public_blob_into_other_repository() {
        let (_temp, registry) = fixture().await;
        let desc = write_blob(&registry, "library/origin", b"shared-layer").await;
        registry
            .descriptors()
            .set_public(&desc.digest, desc.size)
            .await
            .unwrap();

        let target = registry.repository("mirror/copy".parse().unwrap()).blobs();
        let err = target
            .create(CreateOptions::mount(desc.digest.clone()))
            .await
            .err()
            .expect("mount create always returns a sentinel or failure");
        let mounted = match err {
            Error::BlobMounted(d) => d,
            other => panic!("expected BlobMounted, got {other:?}"),
        };
        assert_eq!(mounted.digest, desc.digest);

        // Readable under both names with identical bytes.
        for repo in ["library/origin", "mirror/copy"] {
            let store = registry.repository(repo.parse().unwrap()).blobs();
            let (_, mut reader) = store.open(&desc.digest).await.unwrap();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            assert_eq!(buf, b"shared-layer");
        }
    }

    #[tokio::test]
    async fn mount_of_non_public_blob_is_unknown() {
        let (_temp, registry) = fixture().await;
        let desc = write_blob(&registry, "library/origin", b"private-layer").await;

        let target = registry.repository("mirror/copy".parse().unwrap()).blobs();
        let err = target
            .create(CreateOptions::mount(desc.digest.clone()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::BlobUnknown(_)));
    }

    #[tokio::test]
    async fn delete_removes_only_this_repositorys_link() {
        let (_temp, registry) = fixture().await;
        let desc = write_blob(&registry, "library/app", b"bytes").await;
        registry
            .descriptors()
            .set_public(&desc.digest, desc.size)
            .await
            .unwrap();

        let mirror = registry.repository("mirror/app".parse().unwrap()).blobs();
        let _ = mirror.create(CreateOptions::mount(desc.digest.clone())).await;

        let origin = registry.repository("library/app".parse().unwrap()).blobs();
        origin.delete(&desc.digest).await.unwrap();
        assert!(matches!(
            origin.stat(&desc.digest).await,
            Err(Error::BlobUnknown(_))
        ));
        assert!(mirror.stat(&desc.digest).await.is_ok());

        // Deleting again reports unknown.
        assert!(matches!(
            origin.delete(&desc.digest).await,
            Err(Error::BlobUnknown(_))
        ));
    }
}
