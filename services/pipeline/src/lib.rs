//! Pixora Pipeline - event pipeline for the Pixora image service
//!
//! This library carries image lifecycle events (upload, update, delete) and
//! user engagement events (like, dislike, view, comment) from the request
//! path to the storage service. It provides:
//!
//! - The event envelope and its JSON wire format
//! - A producer that publishes events and waits for the broker acknowledgment
//! - A sequential consumer loop that decodes events and hands them to a handler
//! - An in-process topic for running without a broker
//!
//! # Example
//!
//! ```rust,no_run
//! use pixora_pipeline::{EventProducer, KafkaConfig, LifecycleEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let producer = EventProducer::new(&config)?;
//!
//!     let bytes = std::fs::read("cat.jpg")?;
//!     producer
//!         .publish(&LifecycleEvent::upload("cat.jpg", bytes).into())
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod event;
pub mod producer;
pub mod topic;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, SaslMechanism, SecurityConfig,
    SecurityProtocol,
};
pub use consumer::{
    async_trait, ConsumerBuilder, ConsumerError, ConsumerSummary, EventConsumer, EventHandler,
    IncomingMessage, MessageMetadata, ShutdownHandle,
};
pub use event::{
    EngagementEvent, EngagementKind, EngagementStats, LifecycleEvent, LifecycleKind,
    LifecyclePayload, MalformedEventError, PipelineEvent,
};
pub use producer::{DeliveryResult, EventProducer, OutgoingMessage, ProducerBuilder, PublishError};
pub use topic::{memory_topic, MemoryTopicReader, MemoryTopicWriter};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{
        async_trait, ConsumerError, EventConsumer, EventHandler, MessageMetadata,
    };
    pub use crate::event::{
        EngagementEvent, EngagementKind, EngagementStats, LifecycleEvent, PipelineEvent,
    };
    pub use crate::producer::{EventProducer, PublishError};
}
