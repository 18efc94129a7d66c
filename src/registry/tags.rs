//! Local tag store: tag name -> manifest digest links.

use std::sync::Arc;

use crate::digest::{Descriptor, Digest};
use crate::error::{Error, Result};
use crate::reference::{is_valid_tag, RepositoryName};
use crate::storage::{StorageDriver, StorageError};

use super::manifests::MANIFEST_V2_TYPE;
use super::{blob_data_path, tag_dir_path, tag_link_path, tags_root_path};

pub struct LocalTagStore {
    driver: Arc<dyn StorageDriver>,
    name: RepositoryName,
}

impl LocalTagStore {
    pub(super) fn new(driver: Arc<dyn StorageDriver>, name: RepositoryName) -> Self {
        LocalTagStore { driver, name }
    }

    /// Resolve a tag to the descriptor of the manifest it points at.
    pub async fn get(&self, tag: &str) -> Result<Descriptor> {
        if !is_valid_tag(tag) {
            return Err(Error::TagInvalid(tag.to_string()));
        }

        let raw = match self.driver.get_content(&tag_link_path(&self.name, tag)).await {
            Ok(raw) => raw,
            Err(StorageError::NotFound(_)) => {
                return Err(Error::ManifestUnknown(format!("{}:{}", self.name, tag)))
            }
            Err(e) => return Err(e.into()),
        };

        let digest: Digest = std::str::from_utf8(&raw)
            .map_err(|_| Error::DigestInvalid("tag link is not utf-8".to_string()))?
            .trim()
            .parse()?;

        let size = match self.driver.stat(&blob_data_path(&digest)).await {
            Ok(info) => info.size,
            Err(_) => 0,
        };
        Ok(Descriptor::new(digest, size, MANIFEST_V2_TYPE))
    }

    /// Point a tag at a manifest descriptor.
    pub async fn tag(&self, tag: &str, descriptor: &Descriptor) -> Result<()> {
        if !is_valid_tag(tag) {
            return Err(Error::TagInvalid(tag.to_string()));
        }
        self.driver
            .put_content(
                &tag_link_path(&self.name, tag),
                descriptor.digest.to_string().into_bytes().into(),
            )
            .await?;
        Ok(())
    }

    pub async fn untag(&self, tag: &str) -> Result<()> {
        match self.driver.delete(&tag_dir_path(&self.name, tag)).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                Err(Error::ManifestUnknown(format!("{}:{}", self.name, tag)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All tag names in this repository, sorted.
    pub async fn all(&self) -> Result<Vec<String>> {
        let root = tags_root_path(&self.name);
        let keys = self.driver.walk(&root).await.map_err(Error::from)?;
        let mut tags: Vec<String> = keys
            .into_iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(&root)?.strip_prefix('/')?;
                let (tag, remainder) = rest.split_once('/')?;
                (remainder == "current/link").then(|| tag.to_string())
            })
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// All tags currently pointing at the given descriptor's digest.
    pub async fn lookup(&self, descriptor: &Descriptor) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for tag in self.all().await? {
            if let Ok(resolved) = self.get(&tag).await {
                if resolved.digest == descriptor.digest {
                    found.push(tag);
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::OCTET_STREAM;
    use crate::registry::LocalRegistry;
    use crate::storage::FilesystemDriver;

    async fn store() -> (tempfile::TempDir, LocalTagStore) {
        let temp = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(temp.path().join("registry"))
            .await
            .unwrap();
        let registry = LocalRegistry::new(Arc::new(driver));
        let tags = registry.repository("library/app".parse().unwrap()).tags();
        (temp, tags)
    }

    fn descriptor(data: &[u8]) -> Descriptor {
        Descriptor::new(Digest::from_bytes(data), data.len() as u64, OCTET_STREAM)
    }

    #[tokio::test]
    async fn tag_then_get_resolves_digest() {
        let (_temp, tags) = store().await;
        let desc = descriptor(b"manifest-a");

        tags.tag("latest", &desc).await.unwrap();
        let resolved = tags.get("latest").await.unwrap();
        assert_eq!(resolved.digest, desc.digest);
    }

    #[tokio::test]
    async fn get_unknown_tag_fails() {
        let (_temp, tags) = store().await;
        assert!(matches!(
            tags.get("missing").await,
            Err(Error::ManifestUnknown(_))
        ));
        assert!(matches!(
            tags.get("bad tag!").await,
            Err(Error::TagInvalid(_))
        ));
    }

    #[tokio::test]
    async fn all_lists_tags_sorted() {
        let (_temp, tags) = store().await;
        let desc = descriptor(b"manifest-a");
        for tag in ["v2", "latest", "v1"] {
            tags.tag(tag, &desc).await.unwrap();
        }
        assert_eq!(tags.all().await.unwrap(), vec!["latest", "v1", "v2"]);
    }

    #[tokio::test]
    async fn lookup_finds_tags_for_digest() {
        let (_temp, tags) = store().await;
        let a = descriptor(b"manifest-a");
        let b = descriptor(b"manifest-b");
        tags.tag("latest", &a).await.unwrap();
        tags.tag("stable", &a).await.unwrap();
        tags.tag("edge", &b).await.unwrap();

        assert_eq!(tags.lookup(&a).await.unwrap(), vec!["latest", "stable"]);
        assert_eq!(tags.lookup(&b).await.unwrap(), vec!["edge"]);
    }

    #[tokio::test]
    async fn untag_removes_the_tag() {
        let (_temp, tags) = store().await;
        let desc = descriptor(b"manifest-a");
        tags.tag("latest", &desc).await.unwrap();
        tags.untag("latest").await.unwrap();
        assert!(tags.get("latest").await.is_err());
        assert!(matches!(
            tags.untag("latest").await,
            Err(Error::ManifestUnknown(_))
        ));
    }
}
