//! End-to-end runs through the in-memory topic: producer, consumer,
//! dispatcher and the memory backends.

use pixora_pipeline::{
    memory_topic, EngagementEvent, EngagementKind, EngagementStats, EventConsumer, EventProducer,
    LifecycleEvent, OutgoingMessage, PipelineEvent,
};
use pixora_storage::{
    EngagementAggregator, EngagementLog, EventDispatcher, LifecycleHandlers, LockingStrategy,
    Storage,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    producer: EventProducer,
    consumer: EventConsumer,
    dispatcher: Arc<EventDispatcher>,
    storage: Storage,
    aggregator: Arc<EngagementAggregator>,
}

fn harness(strategy: LockingStrategy) -> Harness {
    let (writer, reader) = memory_topic("pixora.image-events");
    let storage = Storage::in_memory();
    let aggregator = Arc::new(EngagementAggregator::new(
        EngagementLog::in_memory(),
        strategy,
        Duration::from_millis(500),
        Duration::from_secs(5),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        LifecycleHandlers::new(storage.clone()),
        aggregator.clone(),
    ));

    Harness {
        producer: EventProducer::in_memory(writer),
        consumer: EventConsumer::in_memory(reader),
        dispatcher,
        storage,
        aggregator,
    }
}

async fn publish_all(producer: &EventProducer, events: Vec<PipelineEvent>) {
    for event in events {
        producer.publish(&event).await.unwrap();
    }
}

#[tokio::test]
async fn test_upload_then_read_back() {
    let h = harness(LockingStrategy::RowLocking);

    publish_all(&h.producer, vec![LifecycleEvent::upload("cat.jpg", vec![0xff, 0xd8, 0xff]).into()]).await;
    drop(h.producer);

    let summary = h.consumer.run(h.dispatcher).await.unwrap();
    assert_eq!(summary.dispatched, 1);

    assert_eq!(h.storage.blobs.get("cat.jpg").await.unwrap(), vec![0xff, 0xd8, 0xff]);
    let attributes = h.storage.metadata.get_attributes("cat.jpg").await.unwrap();
    assert_eq!(attributes["filename"], "cat.jpg");
    assert_eq!(attributes["content_type"], "image/jpeg");
    assert_eq!(attributes["size_bytes"], "3");
}

#[tokio::test]
async fn test_engagement_counts_and_comments() {
    for strategy in [
        LockingStrategy::RowLocking,
        LockingStrategy::EnhancedList,
        LockingStrategy::Combined,
    ] {
        let h = harness(strategy);

        let mut events: Vec<PipelineEvent> = (0..3)
            .map(|i| EngagementEvent::new(EngagementKind::Like, format!("u{i}"), "cat.jpg").into())
            .collect();
        events.push(EngagementEvent::comment("u9", "cat.jpg", "nice").into());
        publish_all(&h.producer, events).await;
        drop(h.producer);

        h.consumer.run(h.dispatcher).await.unwrap();

        assert_eq!(
            h.aggregator.get_stats("cat.jpg").await.unwrap(),
            EngagementStats { likes: 3, dislikes: 0, views: 0, comments: 1 },
            "{strategy}"
        );
        let comments = h.aggregator.get_comments("cat.jpg").await.unwrap();
        let texts: Vec<_> = comments.iter().map(|c| c.comment.as_str()).collect();
        assert_eq!(texts, vec!["nice"], "{strategy}");
        assert_eq!(comments[0].user_id, "u9");
    }
}

#[tokio::test]
async fn test_update_of_unknown_id_stores_bytes_without_metadata() {
    let h = harness(LockingStrategy::RowLocking);

    publish_all(&h.producer, vec![LifecycleEvent::update("ghost.png", vec![1, 2]).into()]).await;
    drop(h.producer);

    let summary = h.consumer.run(h.dispatcher).await.unwrap();
    assert_eq!(summary.failed, 0);

    assert_eq!(h.storage.blobs.get("ghost.png").await.unwrap(), vec![1, 2]);
    assert!(h.storage.metadata.get_attributes("ghost.png").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_redelivered_upload_is_idempotent() {
    let h = harness(LockingStrategy::RowLocking);
    let upload: PipelineEvent = LifecycleEvent::upload("cat.jpg", vec![7; 16]).into();

    publish_all(&h.producer, vec![upload.clone()]).await;
    drop(h.producer);
    let storage = h.storage.clone();
    h.consumer.run(h.dispatcher.clone()).await.unwrap();
    let first = storage.metadata.get_attributes("cat.jpg").await.unwrap();

    // a second consumer sees the same event again
    let (writer, reader) = memory_topic("pixora.image-events");
    let producer = EventProducer::in_memory(writer);
    producer.publish(&upload).await.unwrap();
    drop(producer);
    EventConsumer::in_memory(reader).run(h.dispatcher).await.unwrap();

    assert_eq!(storage.metadata.get_attributes("cat.jpg").await.unwrap(), first);
    assert_eq!(storage.blobs.get("cat.jpg").await.unwrap(), vec![7; 16]);
}

#[tokio::test]
async fn test_malformed_message_does_not_stop_consumption() {
    let (writer, reader) = memory_topic("pixora.image-events");
    let storage = Storage::in_memory();
    let aggregator = Arc::new(EngagementAggregator::new(
        EngagementLog::in_memory(),
        LockingStrategy::RowLocking,
        Duration::from_millis(500),
        Duration::from_secs(5),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        LifecycleHandlers::new(storage.clone()),
        aggregator.clone(),
    ));

    writer
        .append(OutgoingMessage {
            topic: writer.topic().to_string(),
            key: None,
            payload: b"{not json".to_vec(),
            headers: Vec::new(),
        })
        .unwrap();
    let producer = EventProducer::in_memory(writer);
    producer
        .publish(&EngagementEvent::new(EngagementKind::View, "u1", "cat.jpg").into())
        .await
        .unwrap();
    drop(producer);

    let consumer = EventConsumer::in_memory(reader);
    let summary = consumer.run(dispatcher).await.unwrap();

    assert_eq!(summary.consumed, 2);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(aggregator.get_stats("cat.jpg").await.unwrap().views, 1);
}

#[tokio::test]
async fn test_failed_event_is_skipped_and_later_events_apply() {
    let h = harness(LockingStrategy::RowLocking);

    publish_all(
        &h.producer,
        vec![
            // no metadata yet, so the refresh fails
            LifecycleEvent::stats_refresh("cat.jpg", EngagementStats::default()).into(),
            LifecycleEvent::upload("cat.jpg", vec![1]).into(),
            LifecycleEvent::stats_refresh(
                "cat.jpg",
                EngagementStats { likes: 4, dislikes: 0, views: 9, comments: 1 },
            )
            .into(),
        ],
    )
    .await;
    drop(h.producer);

    let summary = h.consumer.run(h.dispatcher).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.dispatched, 2);

    let attributes = h.storage.metadata.get_attributes("cat.jpg").await.unwrap();
    assert_eq!(attributes["likes"], "4");
    assert_eq!(attributes["views"], "9");
}

#[tokio::test]
async fn test_delete_then_purge_metadata() {
    let h = harness(LockingStrategy::RowLocking);

    publish_all(
        &h.producer,
        vec![
            LifecycleEvent::upload("cat.jpg", vec![1]).into(),
            LifecycleEvent::delete("cat.jpg").into(),
        ],
    )
    .await;

    let consumer = Arc::new(h.consumer);
    let running = {
        let consumer = consumer.clone();
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move { consumer.run(dispatcher).await })
    };

    // blob gone, metadata kept until purged
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.storage.blobs.exists("cat.jpg").await.unwrap()
            || h.storage.metadata.get_attributes("cat.jpg").await.is_err()
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.producer
        .publish(&LifecycleEvent::purge_metadata("cat.jpg").into())
        .await
        .unwrap();
    drop(h.producer);

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.dispatched, 3);
    assert!(h.storage.metadata.get_attributes("cat.jpg").await.unwrap_err().is_not_found());
}
