use super::bounded;
use crate::config::S3Config;
use crate::error::StorageError;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Content type for an image id, derived from its extension
pub fn content_type_for(id: &str) -> &'static str {
    let extension = id.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// S3-compatible object storage (AWS or MinIO)
#[derive(Clone)]
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    region: String,
    multipart_threshold: usize,
    part_size: usize,
}

impl S3BlobStore {
    pub async fn new(config: &S3Config, path_style: bool) -> Result<Self> {
        let bucket = config.bucket.clone().context("s3.bucket is not configured")?;

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if path_style || config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "pixora-config",
            ));
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 blob store configured"
        );

        Ok(Self {
            client,
            bucket,
            region: config.region.clone(),
            multipart_threshold: config.multipart_threshold_bytes,
            part_size: config.part_size_bytes.max(5 * 1024 * 1024),
        })
    }

    /// Create the bucket if it does not exist yet
    async fn initialize(&self) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "Bucket exists");
                return Ok(());
            }
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => {}
            Err(e) => return Err(StorageError::backend("s3.head_bucket", DisplayErrorContext(&e))),
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e)
                if e
                    .as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
                    .unwrap_or(false) =>
            {
                Ok(())
            }
            Err(e) => Err(StorageError::backend("s3.create_bucket", DisplayErrorContext(&e))),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let content_type = content_type_for(key);
        if data.len() > self.multipart_threshold {
            self.multipart_upload(key, data, content_type).await
        } else {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(data.to_vec()))
                .content_type(content_type)
                .send()
                .await
                .map_err(|e| StorageError::backend("s3.put_object", DisplayErrorContext(&e)))?;
            Ok(())
        }
    }

    /// Multipart upload for large images; aborted on any part failure
    async fn multipart_upload(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::backend("s3.create_multipart_upload", DisplayErrorContext(&e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::backend("s3.create_multipart_upload", "no upload id in response"))?;

        match self.upload_parts(key, upload_id, data).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        StorageError::backend("s3.complete_multipart_upload", DisplayErrorContext(&e))
                    })?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: &[u8],
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in data.chunks(self.part_size).enumerate() {
            let part_number = index as i32 + 1;
            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| StorageError::backend("s3.upload_part", DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::backend("s3.get_object", DisplayErrorContext(&e))
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend("s3.get_object", e))?;

        Ok(body.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::backend("s3.delete_object", DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(StorageError::backend("s3.head_object", DisplayErrorContext(&e))),
        }
    }
}

/// Process-local blob store
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

#[derive(Clone)]
pub enum BlobBackend {
    S3(S3BlobStore),
    Memory(MemoryBlobStore),
}

/// Blob side of the storage abstraction
#[derive(Clone)]
pub struct BlobStore {
    backend: BlobBackend,
    timeout: Duration,
}

impl BlobStore {
    pub fn new(backend: BlobBackend, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn in_memory() -> Self {
        Self::new(
            BlobBackend::Memory(MemoryBlobStore::default()),
            DEFAULT_OPERATION_TIMEOUT,
        )
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            BlobBackend::S3(_) => "s3",
            BlobBackend::Memory(_) => "memory",
        }
    }

    pub async fn initialize(&self) -> Result<(), StorageError> {
        match &self.backend {
            BlobBackend::S3(s3) => bounded("blob.initialize", self.timeout, s3.initialize()).await,
            BlobBackend::Memory(_) => Ok(()),
        }
    }

    /// Store `data` under `id`, replacing any previous content
    #[instrument(skip(self, data), fields(backend = self.backend_name(), size_bytes = data.len()))]
    pub async fn put(&self, id: &str, data: &[u8]) -> Result<(), StorageError> {
        let call = async {
            match &self.backend {
                BlobBackend::S3(s3) => s3.put(id, data).await,
                BlobBackend::Memory(memory) => {
                    memory.objects.write().await.insert(id.to_string(), data.to_vec());
                    Ok(())
                }
            }
        };
        bounded("blob.put", self.timeout, call).await?;

        metrics::counter!("storage.blobs.written").increment(1);
        debug!(id, "Blob stored");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        let call = async {
            match &self.backend {
                BlobBackend::S3(s3) => s3.get(id).await,
                BlobBackend::Memory(memory) => memory
                    .objects
                    .read()
                    .await
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StorageError::NotFound(id.to_string())),
            }
        };
        bounded("blob.get", self.timeout, call).await
    }

    /// Remove the blob; a missing id is not an error
    #[instrument(skip(self), fields(backend = self.backend_name()))]
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let call = async {
            match &self.backend {
                BlobBackend::S3(s3) => s3.delete(id).await,
                BlobBackend::Memory(memory) => {
                    memory.objects.write().await.remove(id);
                    Ok(())
                }
            }
        };
        bounded("blob.delete", self.timeout, call).await?;

        metrics::counter!("storage.blobs.deleted").increment(1);
        debug!(id, "Blob deleted");
        Ok(())
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let call = async {
            match &self.backend {
                BlobBackend::S3(s3) => s3.exists(id).await,
                BlobBackend::Memory(memory) => Ok(memory.objects.read().await.contains_key(id)),
            }
        };
        bounded("blob.exists", self.timeout, call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("A.JPG"), "image/jpeg");
        assert_eq!(content_type_for("cat.png"), "image/png");
        assert_eq!(content_type_for("archive.tar.gz"), "application/octet-stream");
        assert_eq!(content_type_for("no-extension"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_put_is_an_upsert() {
        let store = BlobStore::in_memory();
        store.put("a.jpg", &[1, 2, 3]).await.unwrap();
        store.put("a.jpg", &[4, 5]).await.unwrap();

        assert_eq!(store.get("a.jpg").await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = BlobStore::in_memory();
        let err = store.get("nope.jpg").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(ref id) if id == "nope.jpg"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = BlobStore::in_memory();
        store.put("a.jpg", &[1]).await.unwrap();

        tokio_test::assert_ok!(store.delete("a.jpg").await);
        tokio_test::assert_ok!(store.delete("a.jpg").await);
        assert!(!store.exists("a.jpg").await.unwrap());
    }
}
