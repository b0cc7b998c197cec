//! Pixora Storage Service
//!
//! Consumes image lifecycle and engagement events from the pipeline topic,
//! applies them to blob storage, the metadata store and the engagement log,
//! and serves the read side over HTTP.
//!
//! ## Features
//!
//! - **Lifecycle handlers**: upload, update and delete of image bytes with
//!   derived metadata (filename, content type, size, timestamps)
//! - **Pluggable backends**: S3/MinIO or memory for blobs, PostgreSQL or
//!   memory for metadata and the engagement log
//! - **Engagement aggregation**: likes, dislikes, views and comments folded
//!   from an append-only log under a configurable locking strategy
//! - **HTTP API**: intents are published and acknowledged with 202, reads go
//!   straight to storage
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API ──publish──▶ pixora.image-events ──▶ EventConsumer
//!     │                                              │
//!     │ reads                                        ▼
//!     │                                       EventDispatcher
//!     │                                        │          │
//!     │                           LifecycleHandlers   EngagementAggregator
//!     │                              │        │              │
//!     └──────────────────────▶  BlobStore  MetadataStore  EngagementLog
//!                               (S3/mem)   (pg/mem)       (pg/mem)
//! ```

pub mod aggregator;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod engagement;
pub mod error;
pub mod lifecycle;
pub mod storage;

pub use aggregator::{EngagementAggregator, LockingStrategy};
pub use api::{create_router, start_api_server, AppState};
pub use config::{Backends, Config, ConfigurationError};
pub use dispatcher::EventDispatcher;
pub use engagement::{CommentEntry, EngagementLog};
pub use error::{AggregateError, ConflictError, DispatchError, StorageError};
pub use lifecycle::LifecycleHandlers;
pub use storage::{Attributes, BlobStore, MetadataStore, Storage};
