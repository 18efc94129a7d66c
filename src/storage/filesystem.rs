//! Local filesystem storage backend.
//!
//! Objects live under a single root directory; keys map directly to
//! relative paths.  Whole-object writes go through a temporary sibling file
//! followed by an atomic rename, so a torn write never leaves a partial
//! object at its final key.  Scratch objects for in-progress uploads are
//! uniquely-named temp files inside the root, so renaming them into place
//! stays on one filesystem.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{FileInfo, StorageDriver, StorageError, StorageResult};

/// Directory (relative to the root) holding in-progress scratch writes.
const UPLOADS_DIR: &str = "_uploads";

/// Filesystem-backed [`StorageDriver`] rooted at one directory.
#[derive(Debug, Clone)]
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(FilesystemDriver { root })
    }

    /// Resolve a key to an absolute path, rejecting traversal components.
    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn map_io(err: std::io::Error, key: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    async fn get_content(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.resolve(key)?;
        let data = fs::read(&path).await.map_err(|e| map_io(e, key))?;
        Ok(Bytes::from(data))
    }

    async fn put_content(&self, key: &str, content: Bytes) -> StorageResult<()> {
        let path = self.resolve(key)?;
        self.ensure_parent(&path).await?;

        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        let scratch = NamedTempFile::new_in(&parent)?;
        fs::write(scratch.path(), &content).await?;
        scratch
            .persist(&path)
            .map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    async fn reader(&self, key: &str) -> StorageResult<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self.resolve(key)?;
        let file = fs::File::open(&path).await.map_err(|e| map_io(e, key))?;
        Ok(Box::new(file))
    }

    async fn writer(&self, key: &str) -> StorageResult<Box<dyn AsyncWrite + Send + Unpin>> {
        let path = self.resolve(key)?;
        self.ensure_parent(&path).await?;
        let file = fs::File::create(&path).await?;
        Ok(Box::new(file))
    }

    async fn scratch_writer(
        &self,
    ) -> StorageResult<(String, Box<dyn AsyncWrite + Send + Unpin>)> {
        let dir = self.root.join(UPLOADS_DIR);
        fs::create_dir_all(&dir).await?;

        let scratch = NamedTempFile::new_in(&dir)?;
        let (file, path) = scratch.keep().map_err(|e| StorageError::Io(e.error))?;
        let key = path
            .strip_prefix(&self.root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .map_err(|_| StorageError::InvalidKey(path.to_string_lossy().into_owned()))?;
        Ok((key, Box::new(fs::File::from_std(file))))
    }

    async fn stat(&self, key: &str) -> StorageResult<FileInfo> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| map_io(e, key))?;
        Ok(FileInfo {
            path: key.to_string(),
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| map_io(e, key))?;
        if meta.is_dir() {
            fs::remove_dir_all(&path).await.map_err(|e| map_io(e, key))?;
        } else {
            fs::remove_file(&path).await.map_err(|e| map_io(e, key))?;
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        self.ensure_parent(&dst).await?;
        fs::rename(&src, &dst).await.map_err(|e| map_io(e, from))?;
        Ok(())
    }

    async fn walk(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let start = self.resolve(prefix)?;
        let mut keys = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    keys.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn driver() -> (tempfile::TempDir, FilesystemDriver) {
        let temp = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(temp.path().join("root")).await.unwrap();
        (temp, driver)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (_temp, driver) = driver().await;
        driver
            .put_content("a/b/c", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(driver.get_content("a/b/c").await.unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_temp, driver) = driver().await;
        assert!(matches!(
            driver.get_content("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let (_temp, driver) = driver().await;
        assert!(matches!(
            driver.get_content("../outside").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn rename_moves_content() {
        let (_temp, driver) = driver().await;
        driver
            .put_content("tmp/upload", Bytes::from_static(b"x"))
            .await
            .unwrap();
        driver.rename("tmp/upload", "blobs/final").await.unwrap();
        assert!(driver.get_content("tmp/upload").await.is_err());
        assert_eq!(driver.get_content("blobs/final").await.unwrap().as_ref(), b"x");
    }

    #[tokio::test]
    async fn walk_lists_nested_files_sorted() {
        let (_temp, driver) = driver().await;
        for key in ["tree/b/2", "tree/a/1", "tree/a/0"] {
            driver.put_content(key, Bytes::from_static(b"d")).await.unwrap();
        }
        let keys = driver.walk("tree").await.unwrap();
        assert_eq!(keys, vec!["tree/a/0", "tree/a/1", "tree/b/2"]);
    }

    #[tokio::test]
    async fn walk_missing_prefix_is_empty() {
        let (_temp, driver) = driver().await;
        assert!(driver.walk("absent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_directories_recursively() {
        let (_temp, driver) = driver().await;
        driver.put_content("d/x/1", Bytes::from_static(b"1")).await.unwrap();
        driver.put_content("d/y/2", Bytes::from_static(b"2")).await.unwrap();
        driver.delete("d").await.unwrap();
        assert!(driver.stat("d").await.is_err());
    }

    #[tokio::test]
    async fn scratch_writer_yields_unique_renameable_keys() {
        let (_temp, driver) = driver().await;
        let (key_a, mut writer) = driver.scratch_writer().await.unwrap();
        let (key_b, _other) = driver.scratch_writer().await.unwrap();
        assert_ne!(key_a, key_b);
        assert!(key_a.starts_with("_uploads/"));

        writer.write_all(b"scratch-bytes").await.unwrap();
        writer.shutdown().await.unwrap();
        driver.rename(&key_a, "blobs/final").await.unwrap();
        assert_eq!(
            driver.get_content("blobs/final").await.unwrap().as_ref(),
            b"scratch-bytes"
        );
    }

    #[tokio::test]
    async fn streaming_writer_and_reader() {
        let (_temp, driver) = driver().await;
        let mut writer = driver.writer("stream/data").await.unwrap();
        writer.write_all(b"chunk-one ").await.unwrap();
        writer.write_all(b"chunk-two").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = driver.reader("stream/data").await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "chunk-one chunk-two");
    }
}
