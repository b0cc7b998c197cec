//! Event consumer for the Pixora pipeline.
//!
//! [`EventConsumer::run`] is the long-lived loop that pulls messages from the
//! topic, decodes them and hands each event to an [`EventHandler`]. Each
//! iteration is strictly sequential: fetch, commit, decode, dispatch. The
//! loop is the error boundary for everything downstream of the topic; only a
//! shutdown signal or the end of the stream stops it.

use crate::config::KafkaConfig;
use crate::event::PipelineEvent;
use crate::topic::MemoryTopicReader;
use futures::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Pause after a failed fetch before polling the broker again
const FETCH_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Errors that can occur while consuming
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header("correlation-id")
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header("message-type")
    }
}

/// Receives every decoded event, one at a time
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply a single event
    async fn handle(
        &self,
        event: PipelineEvent,
        metadata: &MessageMetadata,
    ) -> Result<(), Self::Error>;

    /// Called when `handle` fails; the event is not retried
    async fn on_error(&self, event: &PipelineEvent, metadata: &MessageMetadata, error: &str) {
        warn!(
            event_id = %event.id(),
            message_type = %event.message_type(),
            partition = metadata.partition,
            offset = metadata.offset,
            error = %error,
            "Event handling failed"
        );
    }
}

/// Counters reported when the consumer loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    /// Messages fetched from the topic
    pub consumed: u64,
    /// Events handled successfully
    pub dispatched: u64,
    /// Messages skipped because they did not decode
    pub malformed: u64,
    /// Events whose handler failed or panicked
    pub failed: u64,
}

enum TopicSource {
    Kafka(StreamConsumer),
    Memory(MemoryTopicReader),
}

/// Outcome of one dispatch attempt
enum Dispatch {
    Handled,
    Failed(String),
}

/// Consumer loop private to the storage dispatcher
pub struct EventConsumer {
    source: TopicSource,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl EventConsumer {
    /// Create a Kafka consumer and subscribe it to the event topic
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            topic = %config.topic,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        Ok(Self::with_source(TopicSource::Kafka(consumer)))
    }

    /// Consume from an in-process topic
    pub fn in_memory(reader: MemoryTopicReader) -> Self {
        Self::with_source(TopicSource::Memory(reader))
    }

    fn with_source(source: TopicSource) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Handle for signaling shutdown from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Ask the loop to stop before its next fetch
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    /// Run the consume loop until shutdown is signaled or the stream ends
    #[instrument(skip(self, handler))]
    pub async fn run<H: EventHandler>(
        &self,
        handler: Arc<H>,
    ) -> Result<ConsumerSummary, ConsumerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut summary = ConsumerSummary::default();

        info!("Starting event consumption loop");

        loop {
            // Idle -> Fetching. Shutdown wins over a ready message so that a
            // signal is honored before any further work is started.
            if *shutdown_rx.borrow_and_update() {
                info!("Received shutdown signal");
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Received shutdown signal");
                    break;
                }
                fetched = self.fetch() => fetched,
            };

            let message = match fetched {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!(error = %e, "Topic fetch error");
                    metrics::counter!("pipeline.fetch.errors").increment(1);
                    if !Self::back_off(&mut shutdown_rx).await {
                        info!("Received shutdown signal");
                        break;
                    }
                    continue;
                }
                None => {
                    debug!("Stream ended");
                    break;
                }
            };

            summary.consumed += 1;
            metrics::counter!("pipeline.events.consumed").increment(1);

            // The read position moves on as soon as the message is fetched;
            // a crash before the commit lands redelivers it.
            self.commit(&message.metadata);

            // Decoding
            let event = match PipelineEvent::decode(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        topic = %message.metadata.topic,
                        partition = message.metadata.partition,
                        offset = message.metadata.offset,
                        error = %e,
                        "Skipping malformed message"
                    );
                    summary.malformed += 1;
                    metrics::counter!("pipeline.events.malformed").increment(1);
                    continue;
                }
            };

            // Dispatching runs to completion even if shutdown arrives meanwhile
            match Self::dispatch(handler.as_ref(), event.clone(), &message.metadata).await {
                Dispatch::Handled => summary.dispatched += 1,
                Dispatch::Failed(reason) => {
                    summary.failed += 1;
                    metrics::counter!("pipeline.events.failed").increment(1);
                    handler.on_error(&event, &message.metadata, &reason).await;
                }
            }
        }

        info!(
            consumed = summary.consumed,
            dispatched = summary.dispatched,
            malformed = summary.malformed,
            failed = summary.failed,
            "Event consumption loop stopped"
        );

        Ok(summary)
    }

    /// Sleep out the fetch backoff. Returns `false` if shutdown arrived first.
    async fn back_off(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => false,
            _ = tokio::time::sleep(FETCH_ERROR_BACKOFF) => true,
        }
    }

    async fn dispatch<H: EventHandler>(
        handler: &H,
        event: PipelineEvent,
        metadata: &MessageMetadata,
    ) -> Dispatch {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(event, metadata))
            .catch_unwind()
            .await;
        metrics::histogram!("pipeline.dispatch.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(())) => Dispatch::Handled,
            Ok(Err(e)) => Dispatch::Failed(e.to_string()),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Dispatch::Failed(format!("handler panicked: {reason}"))
            }
        }
    }

    async fn fetch(&self) -> Option<Result<IncomingMessage, ConsumerError>> {
        match &self.source {
            TopicSource::Kafka(consumer) => Some(
                consumer
                    .recv()
                    .await
                    .map(|message| convert_message(&message))
                    .map_err(|e| ConsumerError::PollError(e.to_string())),
            ),
            TopicSource::Memory(reader) => reader.next().await.map(Ok),
        }
    }

    fn commit(&self, metadata: &MessageMetadata) {
        let result = match &self.source {
            TopicSource::Kafka(consumer) => {
                let mut positions = TopicPartitionList::new();
                positions
                    .add_partition_offset(
                        &metadata.topic,
                        metadata.partition,
                        Offset::Offset(metadata.offset + 1),
                    )
                    .and_then(|_| consumer.commit(&positions, CommitMode::Async))
                    .map_err(|e| ConsumerError::CommitError(e.to_string()))
            }
            TopicSource::Memory(reader) => {
                reader.commit(metadata.offset);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(offset = metadata.offset, error = %e, "Failed to commit offset");
        }
    }
}

/// Cloneable shutdown trigger for a running [`EventConsumer`]
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        self.tx.send_replace(true);
    }
}

fn convert_message(msg: &BorrowedMessage<'_>) -> IncomingMessage {
    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload: msg.payload().unwrap_or(&[]).to_vec(),
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

/// Builder for Kafka consumers with custom settings
pub struct ConsumerBuilder {
    config: KafkaConfig,
}

impl ConsumerBuilder {
    pub fn from_config(config: KafkaConfig) -> Self {
        Self { config }
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.consumer.group_id = group_id.into();
        self
    }

    /// Auto offset reset: earliest, latest, none
    pub fn auto_offset_reset(mut self, reset: impl Into<String>) -> Self {
        self.config.consumer.auto_offset_reset = reset.into();
        self
    }

    pub fn build(self) -> Result<EventConsumer, ConsumerError> {
        EventConsumer::new(&self.config)
    }
}

pub use async_trait::async_trait;
