//! Event producer for the Pixora pipeline.
//!
//! The producer is the request path's only contact with the pipeline: it
//! encodes an event, hands it to the topic and waits for the broker's
//! acknowledgment. It never waits for the event to be consumed and never
//! touches storage.

use crate::config::KafkaConfig;
use crate::event::PipelineEvent;
use crate::topic::MemoryTopicWriter;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Broker acknowledgment for a published message
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    /// Offset the broker assigned within `partition`
    pub offset: i64,
    pub key: Option<String>,
}

/// Raw message handed to the topic
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Encode a pipeline event with its key and routing headers
    pub fn from_event(topic: impl Into<String>, event: &PipelineEvent) -> Self {
        let mut message = Self {
            topic: topic.into(),
            key: None,
            payload: event.encode(),
            headers: Vec::new(),
        }
        .with_message_type(event.message_type())
        .with_correlation_id(event.id().to_string());

        if let Some(key) = event.message_key() {
            message = message.with_key(key);
        }
        message
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

enum TopicSink {
    Kafka(FutureProducer),
    Memory(MemoryTopicWriter),
}

/// Long-lived producer shared by every request handler
pub struct EventProducer {
    sink: TopicSink,
    topic: String,
    default_timeout: Duration,
}

impl EventProducer {
    /// Connect a Kafka producer
    pub fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        info!(
            brokers = %config.bootstrap_servers,
            topic = %config.topic,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| PublishError::CreationError(e.to_string()))?;

        Ok(Self {
            sink: TopicSink::Kafka(producer),
            topic: config.topic.clone(),
            default_timeout: config.publish_timeout(),
        })
    }

    /// Publish into an in-process topic
    pub fn in_memory(writer: MemoryTopicWriter) -> Self {
        Self {
            topic: writer.topic().to_string(),
            sink: TopicSink::Memory(writer),
            default_timeout: Duration::from_secs(5),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an event and wait for the broker acknowledgment
    #[instrument(skip(self, event), fields(event_id = %event.id(), target_id = %event.target_id()))]
    pub async fn publish(&self, event: &PipelineEvent) -> Result<DeliveryResult, PublishError> {
        let message = OutgoingMessage::from_event(&self.topic, event);
        let result = self.send(message).await;

        match result {
            Ok(_) => metrics::counter!("pipeline.events.published").increment(1),
            Err(ref e) => {
                warn!(error = %e, message_type = %event.message_type(), "Failed to publish event");
                metrics::counter!("pipeline.events.publish_failed").increment(1);
            }
        }

        result
    }

    /// Send a message with the default timeout
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, PublishError> {
        self.send_with_timeout(message, self.default_timeout).await
    }

    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send_with_timeout(
        &self,
        message: OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, PublishError> {
        debug!(
            "Sending message to topic {} (size: {} bytes)",
            message.topic,
            message.payload.len()
        );

        let result = match &self.sink {
            TopicSink::Kafka(producer) => {
                let mut headers = OwnedHeaders::new();
                for (key, value) in &message.headers {
                    headers = headers.insert(Header {
                        key: key.as_str(),
                        value: Some(value.as_str()),
                    });
                }

                let mut record = FutureRecord::to(&message.topic)
                    .payload(&message.payload)
                    .headers(headers);
                if let Some(ref key) = message.key {
                    record = record.key(key);
                }

                let (partition, offset) = producer
                    .send(record, Timeout::After(timeout))
                    .await
                    .map_err(|(e, _)| PublishError::SendError {
                        topic: message.topic.clone(),
                        message: e.to_string(),
                    })?;

                DeliveryResult {
                    topic: message.topic.clone(),
                    partition,
                    offset,
                    key: message.key.clone(),
                }
            }
            TopicSink::Memory(writer) => {
                let topic = message.topic.clone();
                writer
                    .append(message)
                    .map_err(|message| PublishError::SendError { topic, message })?
            }
        };

        debug!(
            "Message delivered to partition {} at offset {}",
            result.partition, result.offset
        );

        Ok(result)
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        match &self.sink {
            TopicSink::Kafka(producer) => producer
                .flush(Timeout::After(timeout))
                .map_err(|_| PublishError::Timeout(timeout)),
            TopicSink::Memory(_) => Ok(()),
        }
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        info!("Shutting down event producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

/// Builder for producers with custom settings
pub struct ProducerBuilder {
    config: KafkaConfig,
}

impl ProducerBuilder {
    pub fn from_config(config: KafkaConfig) -> Self {
        Self { config }
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.config.producer.publish_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<EventProducer, PublishError> {
        EventProducer::new(&self.config)
    }
}
