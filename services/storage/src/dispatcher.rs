use crate::aggregator::EngagementAggregator;
use crate::error::DispatchError;
use crate::lifecycle::LifecycleHandlers;
use async_trait::async_trait;
use pixora_pipeline::{
    EngagementEvent, EventHandler, LifecycleEvent, LifecyclePayload, MessageMetadata,
    PipelineEvent,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Routes each decoded event to its lifecycle handler or the aggregator
pub struct EventDispatcher {
    lifecycle: LifecycleHandlers,
    aggregator: Arc<EngagementAggregator>,
}

impl EventDispatcher {
    pub fn new(lifecycle: LifecycleHandlers, aggregator: Arc<EngagementAggregator>) -> Self {
        Self {
            lifecycle,
            aggregator,
        }
    }

    async fn lifecycle(&self, event: LifecycleEvent) -> Result<(), DispatchError> {
        let kind = event.kind();
        let id = event.target_id.as_str();

        let result = match &event.payload {
            LifecyclePayload::Upload { filename, data } => {
                self.lifecycle.upload(filename, data, event.occurred_at).await
            }
            LifecyclePayload::Update { data } => {
                self.lifecycle.update(id, data, event.occurred_at).await
            }
            LifecyclePayload::Delete => self.lifecycle.delete(id).await,
            LifecyclePayload::StatsRefresh { stats } => self.lifecycle.refresh_stats(id, stats).await,
            LifecyclePayload::MetadataUpdate { attributes } => {
                self.lifecycle.merge_metadata(id, attributes).await
            }
            LifecyclePayload::PurgeMetadata => self.lifecycle.purge_metadata(id).await,
        };

        result.map_err(|source| DispatchError::Lifecycle {
            kind,
            target_id: event.target_id.clone(),
            source,
        })
    }

    async fn engagement(&self, event: EngagementEvent) -> Result<(), DispatchError> {
        self.aggregator
            .apply(&event)
            .await
            .map(|_| ())
            .map_err(|source| DispatchError::Engagement {
                kind: event.kind,
                target_id: event.target_id.clone(),
                source,
            })
    }
}

#[async_trait]
impl EventHandler for EventDispatcher {
    type Error = DispatchError;

    async fn handle(&self, event: PipelineEvent, metadata: &MessageMetadata) -> Result<(), DispatchError> {
        debug!(
            event_id = %event.id(),
            message_type = %event.message_type(),
            partition = metadata.partition,
            offset = metadata.offset,
            "Dispatching event"
        );

        match event {
            PipelineEvent::Lifecycle(event) => self.lifecycle(event).await,
            PipelineEvent::Engagement(event) => self.engagement(event).await,
        }
    }

    async fn on_error(&self, event: &PipelineEvent, metadata: &MessageMetadata, reason: &str) {
        error!(
            event_id = %event.id(),
            message_type = %event.message_type(),
            target_id = %event.target_id(),
            offset = metadata.offset,
            error = %reason,
            "Abandoned event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::LockingStrategy;
    use crate::engagement::EngagementLog;
    use crate::error::StorageError;
    use crate::storage::Storage;
    use pixora_pipeline::{EngagementKind, EngagementStats};
    use std::collections::HashMap;
    use std::time::Duration;

    fn metadata() -> MessageMetadata {
        MessageMetadata {
            topic: "events".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    fn dispatcher() -> (EventDispatcher, Storage, Arc<EngagementAggregator>) {
        let storage = Storage::in_memory();
        let aggregator = Arc::new(EngagementAggregator::new(
            EngagementLog::in_memory(),
            LockingStrategy::RowLocking,
            Duration::from_millis(200),
            Duration::from_secs(2),
        ));
        (
            EventDispatcher::new(LifecycleHandlers::new(storage.clone()), aggregator.clone()),
            storage,
            aggregator,
        )
    }

    #[tokio::test]
    async fn test_routes_lifecycle_events() {
        let (dispatcher, storage, _) = dispatcher();

        dispatcher
            .handle(LifecycleEvent::upload("a.jpg", vec![1, 2]).into(), &metadata())
            .await
            .unwrap();
        dispatcher
            .handle(
                LifecycleEvent::stats_refresh("a.jpg", EngagementStats { likes: 2, ..Default::default() }).into(),
                &metadata(),
            )
            .await
            .unwrap();
        dispatcher
            .handle(LifecycleEvent::delete("a.jpg").into(), &metadata())
            .await
            .unwrap();

        assert!(!storage.blobs.exists("a.jpg").await.unwrap());
        assert_eq!(storage.metadata.get_attributes("a.jpg").await.unwrap()["likes"], "2");
    }

    #[tokio::test]
    async fn test_routes_engagement_events() {
        let (dispatcher, _, aggregator) = dispatcher();

        dispatcher
            .handle(EngagementEvent::new(EngagementKind::View, "u1", "a.jpg").into(), &metadata())
            .await
            .unwrap();

        assert_eq!(aggregator.get_stats("a.jpg").await.unwrap().views, 1);
    }

    #[tokio::test]
    async fn test_failure_carries_kind_and_target() {
        let (dispatcher, _, _) = dispatcher();

        let err = dispatcher
            .handle(
                LifecycleEvent::stats_refresh("ghost.jpg", EngagementStats::default()).into(),
                &metadata(),
            )
            .await
            .unwrap_err();

        match err {
            DispatchError::Lifecycle { target_id, source, .. } => {
                assert_eq!(target_id, "ghost.jpg");
                assert!(matches!(source, StorageError::NotFound(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
