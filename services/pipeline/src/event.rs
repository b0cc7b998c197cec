//! Wire schema for pipeline events.
//!
//! Events travel as JSON objects tagged by `category`, and lifecycle payloads
//! by `kind`. Unknown fields are ignored so older consumers keep decoding
//! events written by newer producers. Binary image data is carried as base64.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A message payload that could not be decoded into a [`PipelineEvent`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed event: {reason}")]
pub struct MalformedEventError {
    pub reason: String,
}

/// Every event carried on the pipeline topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum PipelineEvent {
    Lifecycle(LifecycleEvent),
    Engagement(EngagementEvent),
}

impl PipelineEvent {
    /// Serialize to the wire format
    pub fn encode(&self) -> Vec<u8> {
        // Every field is a string, integer, map of strings or timestamp, so
        // serialization cannot fail for a constructed value.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a wire payload. Engagement events must also satisfy the
    /// comment rule the constructors enforce.
    pub fn decode(payload: &[u8]) -> Result<Self, MalformedEventError> {
        let event: Self = serde_json::from_slice(payload).map_err(|e| MalformedEventError {
            reason: e.to_string(),
        })?;

        if let PipelineEvent::Engagement(engagement) = &event {
            engagement.validate()?;
        }
        Ok(event)
    }

    pub fn id(&self) -> Uuid {
        match self {
            PipelineEvent::Lifecycle(event) => event.id,
            PipelineEvent::Engagement(event) => event.id,
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            PipelineEvent::Lifecycle(event) => &event.target_id,
            PipelineEvent::Engagement(event) => &event.target_id,
        }
    }

    /// Partition key: engagement events are keyed by target so that one
    /// target's counters are applied in publish order.
    pub fn message_key(&self) -> Option<&str> {
        match self {
            PipelineEvent::Lifecycle(_) => None,
            PipelineEvent::Engagement(event) => Some(&event.target_id),
        }
    }

    /// Value of the `message-type` header
    pub fn message_type(&self) -> String {
        match self {
            PipelineEvent::Lifecycle(event) => format!("lifecycle.{}", event.kind()),
            PipelineEvent::Engagement(event) => format!("engagement.{}", event.kind),
        }
    }
}

impl From<LifecycleEvent> for PipelineEvent {
    fn from(event: LifecycleEvent) -> Self {
        PipelineEvent::Lifecycle(event)
    }
}

impl From<EngagementEvent> for PipelineEvent {
    fn from(event: EngagementEvent) -> Self {
        PipelineEvent::Engagement(event)
    }
}

/// Intent to change an image or its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Unique event ID
    pub id: Uuid,
    /// Image id the event applies to
    pub target_id: String,
    /// When the intent was accepted; derived metadata timestamps use it
    pub occurred_at: DateTime<Utc>,
    /// What to do with the image
    pub payload: LifecyclePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Upload,
    Update,
    Delete,
    StatsRefresh,
    MetadataUpdate,
    PurgeMetadata,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleKind::Upload => "upload",
            LifecycleKind::Update => "update",
            LifecycleKind::Delete => "delete",
            LifecycleKind::StatsRefresh => "stats_refresh",
            LifecycleKind::MetadataUpdate => "metadata_update",
            LifecycleKind::PurgeMetadata => "purge_metadata",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecyclePayload {
    Upload {
        filename: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Update {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Delete,
    StatsRefresh {
        stats: EngagementStats,
    },
    MetadataUpdate {
        attributes: HashMap<String, String>,
    },
    PurgeMetadata,
}

impl LifecycleEvent {
    fn new(target_id: impl Into<String>, payload: LifecyclePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: target_id.into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// The uploaded image is stored under its filename
    pub fn upload(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        Self::new(
            filename.clone(),
            LifecyclePayload::Upload { filename, data },
        )
    }

    pub fn update(target_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(target_id, LifecyclePayload::Update { data })
    }

    pub fn delete(target_id: impl Into<String>) -> Self {
        Self::new(target_id, LifecyclePayload::Delete)
    }

    pub fn stats_refresh(target_id: impl Into<String>, stats: EngagementStats) -> Self {
        Self::new(target_id, LifecyclePayload::StatsRefresh { stats })
    }

    pub fn metadata_update(
        target_id: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> Self {
        Self::new(target_id, LifecyclePayload::MetadataUpdate { attributes })
    }

    pub fn purge_metadata(target_id: impl Into<String>) -> Self {
        Self::new(target_id, LifecyclePayload::PurgeMetadata)
    }

    pub fn kind(&self) -> LifecycleKind {
        match self.payload {
            LifecyclePayload::Upload { .. } => LifecycleKind::Upload,
            LifecyclePayload::Update { .. } => LifecycleKind::Update,
            LifecyclePayload::Delete => LifecycleKind::Delete,
            LifecyclePayload::StatsRefresh { .. } => LifecycleKind::StatsRefresh,
            LifecyclePayload::MetadataUpdate { .. } => LifecycleKind::MetadataUpdate,
            LifecyclePayload::PurgeMetadata => LifecycleKind::PurgeMetadata,
        }
    }
}

/// Kind of user interaction with an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Like,
    Dislike,
    View,
    Comment,
}

impl EngagementKind {
    pub const ALL: [EngagementKind; 4] = [
        EngagementKind::Like,
        EngagementKind::Dislike,
        EngagementKind::View,
        EngagementKind::Comment,
    ];

    /// Column value used by the relational engagement log
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EngagementKind::Like => "user-like",
            EngagementKind::Dislike => "user-dislike",
            EngagementKind::View => "user-view",
            EngagementKind::Comment => "user-comment",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_db_str() == value)
    }
}

impl fmt::Display for EngagementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngagementKind::Like => "like",
            EngagementKind::Dislike => "dislike",
            EngagementKind::View => "view",
            EngagementKind::Comment => "comment",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for EngagementKind {
    type Err = MalformedEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s.to_lowercase())
            .ok_or_else(|| MalformedEventError {
                reason: format!("unknown engagement kind '{s}'"),
            })
    }
}

/// A user action recorded against a target image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    /// Unique event ID, stored with the log row
    pub id: Uuid,
    pub kind: EngagementKind,
    /// User who acted
    pub user_id: String,
    /// Image the action targets; also the partition key
    pub target_id: String,
    /// Comment text; present exactly when `kind` is `Comment`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl EngagementEvent {
    /// Create a like, dislike or view. Use [`EngagementEvent::comment`] for
    /// comments, which are the only kind carrying text.
    pub fn new(
        kind: EngagementKind,
        user_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id: user_id.into(),
            target_id: target_id.into(),
            comment: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn comment(
        user_id: impl Into<String>,
        target_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            comment: Some(text.into()),
            ..Self::new(EngagementKind::Comment, user_id, target_id)
        }
    }

    /// Comments carry text, every other kind carries none
    pub fn validate(&self) -> Result<(), MalformedEventError> {
        match (self.kind, &self.comment) {
            (EngagementKind::Comment, None) => Err(MalformedEventError {
                reason: "comment event without text".to_string(),
            }),
            (EngagementKind::Comment, Some(_)) | (_, None) => Ok(()),
            (kind, Some(_)) => Err(MalformedEventError {
                reason: format!("{kind} event carries comment text"),
            }),
        }
    }
}

/// Per-target engagement counts derived from the event log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementStats {
    /// Number of like events
    pub likes: u64,
    pub dislikes: u64,
    pub views: u64,
    pub comments: u64,
}

impl EngagementStats {
    pub fn record(&mut self, kind: EngagementKind) {
        self.add(kind, 1);
    }

    pub fn add(&mut self, kind: EngagementKind, count: u64) {
        match kind {
            EngagementKind::Like => self.likes += count,
            EngagementKind::Dislike => self.dislikes += count,
            EngagementKind::View => self.views += count,
            EngagementKind::Comment => self.comments += count,
        }
    }

    pub fn fold<I: IntoIterator<Item = EngagementKind>>(kinds: I) -> Self {
        kinds.into_iter().fold(Self::default(), |mut stats, kind| {
            stats.record(kind);
            stats
        })
    }

    pub fn total(&self) -> u64 {
        self.likes + self.dislikes + self.views + self.comments
    }
}

/// Base64 (standard alphabet) representation for byte payloads
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
