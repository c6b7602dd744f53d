use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{error, info};

use super::{ObjectStore, StorageError, BUCKET_OUTPUT, BUCKET_PAGES, BUCKET_PDFS};

/// MinIO (S3-compatible) object store backend.
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str, secure: bool) -> Self {
        let creds = aws_sdk_s3::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "pricewatch",
        );

        let scheme = if secure { "https" } else { "http" };
        let endpoint_url = if endpoint.starts_with("http") {
            endpoint.to_string()
        } else {
            format!("{scheme}://{endpoint}")
        };

        let config = aws_sdk_s3::config::Builder::new()
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .endpoint_url(endpoint_url)
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
        }
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(_) => match self.client.create_bucket().bucket(bucket).send().await {
                Ok(_) => {
                    info!("Created bucket {bucket}");
                    Ok(())
                }
                Err(e) => {
                    let msg = format!("{e}");
                    if msg.contains("BucketAlreadyOwnedByYou") || msg.contains("BucketAlreadyExists")
                    {
                        Ok(())
                    } else {
                        Err(StorageError::S3(msg))
                    }
                }
            },
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let body = aws_sdk_s3::primitives::ByteStream::from(data.to_vec());
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("S3 upload error: {e}");
                StorageError::S3(format!("{e}"))
            })?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = format!("{e}");
                if msg.contains("NoSuchKey") || msg.contains("404") {
                    StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::S3(msg)
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(format!("failed to read S3 body: {e}")))?;

        Ok(bytes.to_vec())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let msg = format!("{e}");
                if msg.contains("NotFound") || msg.contains("404") {
                    Ok(false)
                } else {
                    Err(StorageError::S3(msg))
                }
            }
        }
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| StorageError::S3(format!("{e}")))?;

            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<(), StorageError> {
        let keys = self.list_prefix(bucket, prefix).await?;
        for key in keys {
            if let Err(e) = self
                .client
                .delete_object()
                .bucket(bucket)
                .key(&key)
                .send()
                .await
            {
                error!("S3 delete error for {bucket}/{key}: {e}");
            }
        }
        Ok(())
    }

    async fn ensure_buckets(&self) -> Result<(), StorageError> {
        for bucket in [BUCKET_PDFS, BUCKET_PAGES, BUCKET_OUTPUT] {
            self.ensure_bucket(bucket).await?;
        }
        Ok(())
    }
}
