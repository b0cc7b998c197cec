//! Storage Abstraction: a blob store and a metadata store, each with a
//! closed set of backends chosen once at startup.
//!
//! Every backend call is bounded by the configured operation timeout, so a
//! degraded dependency stalls the consumer loop for at most that long.

pub mod blob;
pub mod database;
pub mod metadata;

pub use blob::{content_type_for, BlobBackend, BlobStore, MemoryBlobStore, S3BlobStore};
pub use metadata::{MemoryMetadataStore, MetadataBackend, MetadataStore, PgMetadataStore};

use crate::config::{BlobBackendKind, Config, MetadataBackendKind};
use crate::error::StorageError;
use anyhow::{Context, Result};
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attribute map stored per image
pub type Attributes = HashMap<String, String>;

/// Run a backend call under `limit`
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "Storage call timed out");
            metrics::counter!("storage.timeouts", "operation" => operation).increment(1);
            Err(StorageError::Timeout {
                operation,
                after: limit,
            })
        }
    }
}

/// Blob and metadata handles, built once and shared by every component
#[derive(Clone)]
pub struct Storage {
    pub blobs: BlobStore,
    pub metadata: MetadataStore,
}

impl Storage {
    pub fn new(blobs: BlobStore, metadata: MetadataStore) -> Self {
        Self { blobs, metadata }
    }

    /// Both surfaces in memory
    pub fn in_memory() -> Self {
        Self::new(BlobStore::in_memory(), MetadataStore::in_memory())
    }

    /// Build the configured backends. `pool` must be present when the
    /// metadata backend is Postgres.
    pub async fn from_config(
        config: &Config,
        blob: BlobBackendKind,
        metadata: MetadataBackendKind,
        pool: Option<&PgPool>,
    ) -> Result<Self> {
        let timeout = config.operation_timeout();

        let blob_backend = match blob {
            BlobBackendKind::S3 => BlobBackend::S3(S3BlobStore::new(&config.s3, false).await?),
            BlobBackendKind::Minio => BlobBackend::S3(S3BlobStore::new(&config.s3, true).await?),
            BlobBackendKind::Memory => BlobBackend::Memory(MemoryBlobStore::default()),
        };

        let metadata_backend = match metadata {
            MetadataBackendKind::Postgres => {
                let pool = pool.context("Postgres metadata backend needs a database pool")?;
                MetadataBackend::Postgres(PgMetadataStore::new(pool.clone()))
            }
            MetadataBackendKind::Memory => MetadataBackend::Memory(MemoryMetadataStore::default()),
        };

        Ok(Self::new(
            BlobStore::new(blob_backend, timeout),
            MetadataStore::new(metadata_backend, timeout),
        ))
    }

    /// Prepare both surfaces (bucket creation, schema check)
    pub async fn initialize(&self) -> Result<(), StorageError> {
        self.blobs.initialize().await?;
        self.metadata.initialize().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_maps_expiry_to_timeout() {
        let result: Result<(), StorageError> = bounded("blob.get", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(StorageError::Timeout { operation, after }) => {
                assert_eq!(operation, "blob.get");
                assert_eq!(after, Duration::from_millis(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bounded_passes_results_through() {
        let ok = bounded("blob.put", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<(), _> = bounded("blob.get", Duration::from_secs(1), async {
            Err(StorageError::NotFound("a.jpg".to_string()))
        })
        .await;
        assert!(err.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_from_config_in_memory() {
        let config = Config::in_memory();
        let storage = Storage::from_config(
            &config,
            BlobBackendKind::Memory,
            MetadataBackendKind::Memory,
            None,
        )
        .await
        .unwrap();

        tokio_test::assert_ok!(storage.initialize().await);
    }

    #[tokio::test]
    async fn test_postgres_metadata_without_pool_is_rejected() {
        let config = Config::in_memory();
        let result = Storage::from_config(
            &config,
            BlobBackendKind::Memory,
            MetadataBackendKind::Postgres,
            None,
        )
        .await;
        assert!(result.is_err());
    }
}
