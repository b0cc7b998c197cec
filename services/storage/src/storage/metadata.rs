use super::{bounded, Attributes};
use crate::error::StorageError;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Attribute maps in the `image_metadata` table
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1 FROM image_metadata LIMIT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::backend("metadata.initialize", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Attributes, StorageError> {
        let row: Option<(Json<Attributes>,)> =
            sqlx::query_as("SELECT metadata FROM image_metadata WHERE image_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::backend("metadata.get", e))?;

        row.map(|(Json(attributes),)| attributes)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn set(&self, id: &str, attributes: &Attributes) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO image_metadata (image_id, metadata, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (image_id)
            DO UPDATE SET metadata = EXCLUDED.metadata, updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(Json(attributes))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::backend("metadata.set", e))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM image_metadata WHERE image_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::backend("metadata.delete", e))?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    entries: Arc<RwLock<HashMap<String, Attributes>>>,
}

#[derive(Clone)]
pub enum MetadataBackend {
    Postgres(PgMetadataStore),
    Memory(MemoryMetadataStore),
}

/// Metadata side of the storage abstraction
#[derive(Clone)]
pub struct MetadataStore {
    backend: MetadataBackend,
    timeout: Duration,
}

impl MetadataStore {
    pub fn new(backend: MetadataBackend, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn in_memory() -> Self {
        Self::new(
            MetadataBackend::Memory(MemoryMetadataStore::default()),
            DEFAULT_OPERATION_TIMEOUT,
        )
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            MetadataBackend::Postgres(_) => "postgres",
            MetadataBackend::Memory(_) => "memory",
        }
    }

    pub async fn initialize(&self) -> Result<(), StorageError> {
        match &self.backend {
            MetadataBackend::Postgres(pg) => {
                bounded("metadata.initialize", self.timeout, pg.initialize()).await
            }
            MetadataBackend::Memory(_) => Ok(()),
        }
    }

    pub async fn get_attributes(&self, id: &str) -> Result<Attributes, StorageError> {
        let call = async {
            match &self.backend {
                MetadataBackend::Postgres(pg) => pg.get(id).await,
                MetadataBackend::Memory(memory) => memory
                    .entries
                    .read()
                    .await
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StorageError::NotFound(id.to_string())),
            }
        };
        bounded("metadata.get", self.timeout, call).await
    }

    /// Replace the whole attribute map for `id`
    #[instrument(skip(self, attributes), fields(backend = self.backend_name(), count = attributes.len()))]
    pub async fn set_attributes(&self, id: &str, attributes: &Attributes) -> Result<(), StorageError> {
        let call = async {
            match &self.backend {
                MetadataBackend::Postgres(pg) => pg.set(id, attributes).await,
                MetadataBackend::Memory(memory) => {
                    memory
                        .entries
                        .write()
                        .await
                        .insert(id.to_string(), attributes.clone());
                    Ok(())
                }
            }
        };
        bounded("metadata.set", self.timeout, call).await?;

        debug!(id, "Metadata stored");
        Ok(())
    }

    pub async fn delete_attributes(&self, id: &str) -> Result<(), StorageError> {
        let call = async {
            match &self.backend {
                MetadataBackend::Postgres(pg) => pg.delete(id).await,
                MetadataBackend::Memory(memory) => {
                    memory.entries.write().await.remove(id);
                    Ok(())
                }
            }
        };
        bounded("metadata.delete", self.timeout, call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_set_replaces_whole_map() {
        let store = MetadataStore::in_memory();
        store
            .set_attributes("a.jpg", &attrs(&[("filename", "a.jpg"), ("likes", "1")]))
            .await
            .unwrap();
        store
            .set_attributes("a.jpg", &attrs(&[("filename", "a.jpg")]))
            .await
            .unwrap();

        let stored = store.get_attributes("a.jpg").await.unwrap();
        assert_eq!(stored, attrs(&[("filename", "a.jpg")]));
    }

    #[tokio::test]
    async fn test_missing_metadata_is_not_found() {
        let store = MetadataStore::in_memory();
        assert!(store.get_attributes("x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_attributes() {
        let store = MetadataStore::in_memory();
        store.set_attributes("a.jpg", &attrs(&[("k", "v")])).await.unwrap();

        tokio_test::assert_ok!(store.delete_attributes("a.jpg").await);
        tokio_test::assert_ok!(store.delete_attributes("a.jpg").await);
        assert!(store.get_attributes("a.jpg").await.is_err());
    }
}
