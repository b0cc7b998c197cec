//! Lifecycle handlers: apply upload, update and delete intents to storage.
//!
//! Blob and metadata writes are separate calls with no rollback between
//! them. A metadata failure after a successful blob write leaves the blob
//! orphaned, and an update failing between delete and put leaves the id
//! without a blob.

use crate::error::StorageError;
use crate::storage::{content_type_for, Attributes, Storage};
use chrono::{DateTime, SecondsFormat, Utc};
use pixora_pipeline::EngagementStats;
use tracing::{info, instrument};

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone)]
pub struct LifecycleHandlers {
    storage: Storage,
}

impl LifecycleHandlers {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Store the blob under `filename`, then its initial metadata. Every
    /// attribute derives from the event, so a redelivered upload writes
    /// identical state.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn upload(
        &self,
        filename: &str,
        data: &[u8],
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.storage.blobs.put(filename, data).await?;

        let attributes: Attributes = [
            ("filename", filename.to_string()),
            ("content_type", content_type_for(filename).to_string()),
            ("size_bytes", data.len().to_string()),
            ("uploaded_at", timestamp(occurred_at)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        self.storage.metadata.set_attributes(filename, &attributes).await?;

        info!(filename, "Image uploaded");
        Ok(())
    }

    /// Delete then put under the same id. Existing metadata is refreshed;
    /// absent metadata stays absent.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn update(
        &self,
        id: &str,
        data: &[u8],
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.storage.blobs.delete(id).await?;
        self.storage.blobs.put(id, data).await?;

        match self.storage.metadata.get_attributes(id).await {
            Ok(mut attributes) => {
                attributes.insert("size_bytes".to_string(), data.len().to_string());
                attributes.insert("content_type".to_string(), content_type_for(id).to_string());
                attributes.insert("updated_at".to_string(), timestamp(occurred_at));
                self.storage.metadata.set_attributes(id, &attributes).await?;
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(id, "Image updated");
        Ok(())
    }

    /// Remove the blob only; metadata goes through [`Self::purge_metadata`]
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.storage.blobs.delete(id).await?;
        info!(id, "Image deleted");
        Ok(())
    }

    /// Copy engagement counts into existing metadata
    #[instrument(skip(self, stats))]
    pub async fn refresh_stats(&self, id: &str, stats: &EngagementStats) -> Result<(), StorageError> {
        let mut attributes = self.storage.metadata.get_attributes(id).await?;
        attributes.insert("likes".to_string(), stats.likes.to_string());
        attributes.insert("dislikes".to_string(), stats.dislikes.to_string());
        attributes.insert("views".to_string(), stats.views.to_string());
        attributes.insert("comments".to_string(), stats.comments.to_string());
        self.storage.metadata.set_attributes(id, &attributes).await
    }

    /// Merge caller attributes over the stored map, creating it if absent
    #[instrument(skip(self, updates), fields(count = updates.len()))]
    pub async fn merge_metadata(&self, id: &str, updates: &Attributes) -> Result<(), StorageError> {
        let mut attributes = match self.storage.metadata.get_attributes(id).await {
            Ok(attributes) => attributes,
            Err(StorageError::NotFound(_)) => Attributes::new(),
            Err(e) => return Err(e),
        };
        attributes.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.storage.metadata.set_attributes(id, &attributes).await
    }

    #[instrument(skip(self))]
    pub async fn purge_metadata(&self, id: &str) -> Result<(), StorageError> {
        self.storage.metadata.delete_attributes(id).await
    }
}
