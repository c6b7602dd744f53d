pub mod local;
pub mod s3;

use async_trait::async_trait;
use thiserror::Error;

/// Bucket holding original uploaded documents.
pub const BUCKET_PDFS: &str = "pdfs";
/// Bucket holding rendered page rasters.
pub const BUCKET_PAGES: &str = "pages";
/// Bucket holding cached extraction CSVs.
pub const BUCKET_OUTPUT: &str = "output";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("S3 error: {0}")]
    S3(String),
    #[error("{0}")]
    Other(String),
}

/// Abstract object store over the three logical buckets.
///
/// Keys are forward-slash paths; the store is flat and listed by prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an opaque blob.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Fetch a blob. A missing object is `StorageError::NotFound`.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Check whether a key exists.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// List keys under a prefix, sorted.
    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Delete every object under a prefix. Best-effort idempotent.
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<(), StorageError>;

    /// Create the three logical buckets if they do not exist yet.
    async fn ensure_buckets(&self) -> Result<(), StorageError>;
}

/// Detect the upload extension from raw bytes.
pub fn detect_file_extension(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"%PDF") {
        Some("pdf")
    } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if data.starts_with(b"\xff\xd8") {
        Some("jpg")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_file_extension() {
        assert_eq!(detect_file_extension(b"%PDF-1.7 rest"), Some("pdf"));
        assert_eq!(
            detect_file_extension(b"\x89PNG\r\n\x1a\nrest"),
            Some("png")
        );
        assert_eq!(detect_file_extension(b"\xff\xd8\xff\xe0"), Some("jpg"));
        assert_eq!(detect_file_extension(b"plain text"), None);
    }
}
