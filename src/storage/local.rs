use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

use super::{ObjectStore, StorageError, BUCKET_OUTPUT, BUCKET_PAGES, BUCKET_PDFS};

/// Local filesystem object store backend (development and tests).
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(storage_path: &str) -> Self {
        let base_path = PathBuf::from(storage_path);
        std::fs::create_dir_all(&base_path).ok();
        Self { base_path }
    }

    fn resolve_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.base_path.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.resolve_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve_path(bucket, key);
        if !path.exists() {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(fs::read(&path).await?)
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.resolve_path(bucket, key).exists())
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let bucket_dir = self.base_path.join(bucket);
        let mut keys = Vec::new();
        let mut pending = vec![bucket_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&bucket_dir) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<(), StorageError> {
        for key in self.list_prefix(bucket, prefix).await? {
            let path = self.resolve_path(bucket, &key);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(())
    }

    async fn ensure_buckets(&self) -> Result<(), StorageError> {
        for bucket in [BUCKET_PDFS, BUCKET_PAGES, BUCKET_OUTPUT] {
            fs::create_dir_all(self.base_path.join(bucket)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap());

        let data = b"hello world";
        store
            .put(BUCKET_PAGES, "up1/page_001.png", data, "image/png")
            .await
            .unwrap();

        let fetched = store.get(BUCKET_PAGES, "up1/page_001.png").await.unwrap();
        assert_eq!(fetched, data);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap());

        let result = store.get(BUCKET_PDFS, "nope/original.pdf").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_prefix_sorted() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap());

        for n in [3, 1, 2] {
            store
                .put(
                    BUCKET_PAGES,
                    &format!("up1/page_{n:03}.png"),
                    b"png",
                    "image/png",
                )
                .await
                .unwrap();
        }
        store
            .put(BUCKET_PAGES, "up2/page_001.png", b"png", "image/png")
            .await
            .unwrap();

        let keys = store.list_prefix(BUCKET_PAGES, "up1/").await.unwrap();
        assert_eq!(
            keys,
            vec!["up1/page_001.png", "up1/page_002.png", "up1/page_003.png"]
        );
    }

    #[tokio::test]
    async fn test_delete_prefix_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap());

        store
            .put(BUCKET_PAGES, "up1/page_001.png", b"png", "image/png")
            .await
            .unwrap();

        store.delete_prefix(BUCKET_PAGES, "up1/").await.unwrap();
        assert!(!store.exists(BUCKET_PAGES, "up1/page_001.png").await.unwrap());

        // Deleting again is a no-op.
        store.delete_prefix(BUCKET_PAGES, "up1/").await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_buckets() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap());
        store.ensure_buckets().await.unwrap();

        assert!(dir.path().join(BUCKET_PDFS).is_dir());
        assert!(dir.path().join(BUCKET_PAGES).is_dir());
        assert!(dir.path().join(BUCKET_OUTPUT).is_dir());
    }
}
