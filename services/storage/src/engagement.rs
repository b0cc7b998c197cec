//! Append-only engagement log and the per-target row lock.
//!
//! The log is the source of truth for engagement stats. The aggregate row
//! (`engagement_stats` in Postgres, a mutex-guarded slot in memory) exists
//! so writers have something to lock; its counts are written back by the
//! row-locking strategy but never read to answer stats queries.

use crate::error::{AggregateError, ConflictError, StorageError};
use chrono::{DateTime, Utc};
use pixora_pipeline::{EngagementEvent, EngagementKind, EngagementStats};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Postgres codes that signal contention rather than failure:
/// lock_not_available, serialization_failure, deadlock_detected
const CONFLICT_CODES: [&str; 3] = ["55P03", "40001", "40P01"];

/// Projection of a comment event for the comments listing, oldest first
/// when listed. Kind and target are implied by the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CommentEntry {
    /// Id of the engagement event that carried the comment
    pub event_id: Uuid,
    /// Commenting user
    pub user_id: String,
    pub comment: String,
    /// When the comment was made, as stamped on the event
    pub created_at: DateTime<Utc>,
}

/// Log row as read back for the event listing
type EventRow = (Uuid, String, String, String, Option<String>, DateTime<Utc>);

fn classify(target_id: &str, operation: &'static str, error: sqlx::Error) -> AggregateError {
    let code = error
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned());

    match code {
        Some(code) if CONFLICT_CODES.contains(&code.as_str()) => ConflictError {
            target_id: target_id.to_string(),
            reason: format!("{operation}: {error}"),
        }
        .into(),
        _ => StorageError::backend(operation, error).into(),
    }
}

fn fold_rows(target_id: &str, rows: Vec<(String, i64)>) -> EngagementStats {
    let mut stats = EngagementStats::default();
    for (event_type, count) in rows {
        match EngagementKind::from_db_str(&event_type) {
            Some(kind) => stats.add(kind, count.max(0) as u64),
            None => warn!(target_id, event_type = %event_type, "Ignoring unknown event type in log"),
        }
    }
    stats
}

const INSERT_EVENT: &str = r#"
    INSERT INTO user_events (event_id, event_type, user_id, target_id, comment, created_at)
    VALUES ($1, $2, $3, $4, $5, $6)
"#;

const COUNT_BY_KIND: &str = r#"
    SELECT event_type, COUNT(*) FROM user_events
    WHERE target_id = $1
    GROUP BY event_type
"#;

/// Engagement log in the `user_events` table
#[derive(Clone)]
pub struct PgEngagementLog {
    pool: PgPool,
}

impl PgEngagementLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn append(&self, event: &EngagementEvent) -> Result<(), StorageError> {
        sqlx::query(INSERT_EVENT)
            .bind(event.id)
            .bind(event.kind.as_db_str())
            .bind(&event.user_id)
            .bind(&event.target_id)
            .bind(&event.comment)
            .bind(event.occurred_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::backend("engagement.append", e))?;
        Ok(())
    }

    async fn stats(&self, target_id: &str) -> Result<EngagementStats, StorageError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(COUNT_BY_KIND)
            .bind(target_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::backend("engagement.stats", e))?;
        Ok(fold_rows(target_id, rows))
    }

    async fn comments(&self, target_id: &str) -> Result<Vec<CommentEntry>, StorageError> {
        sqlx::query_as::<_, CommentEntry>(
            r#"
            SELECT event_id, user_id, COALESCE(comment, '') AS comment, created_at
            FROM user_events
            WHERE target_id = $1 AND event_type = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(target_id)
        .bind(EngagementKind::Comment.as_db_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::backend("engagement.comments", e))
    }

    async fn list_events(&self, limit: usize) -> Result<Vec<EngagementEvent>, StorageError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, user_id, target_id, comment, created_at
            FROM user_events
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::backend("engagement.list_events", e))?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, event_type, user_id, target_id, comment, occurred_at)| {
                match EngagementKind::from_db_str(&event_type) {
                    Some(kind) => Some(EngagementEvent {
                        id,
                        kind,
                        user_id,
                        target_id,
                        comment,
                        occurred_at,
                    }),
                    None => {
                        warn!(target_id = %target_id, event_type = %event_type, "Skipping unknown event type in log");
                        None
                    }
                }
            })
            .collect())
    }

    async fn stored_stats(&self, target_id: &str) -> Result<Option<EngagementStats>, StorageError> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT likes, dislikes, views, comments FROM engagement_stats WHERE target_id = $1",
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::backend("engagement.stored_stats", e))?;

        Ok(row.map(|(likes, dislikes, views, comments)| EngagementStats {
            likes: likes.max(0) as u64,
            dislikes: dislikes.max(0) as u64,
            views: views.max(0) as u64,
            comments: comments.max(0) as u64,
        }))
    }

    /// Open a transaction holding the target's aggregate row FOR UPDATE
    async fn lock_row(&self, target_id: &str, timeout: Duration) -> Result<PgRowLock, AggregateError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::backend("engagement.lock_row", e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(target_id, "engagement.lock_row", e))?;

        sqlx::query("INSERT INTO engagement_stats (target_id) VALUES ($1) ON CONFLICT (target_id) DO NOTHING")
            .bind(target_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(target_id, "engagement.lock_row", e))?;

        sqlx::query("SELECT target_id FROM engagement_stats WHERE target_id = $1 FOR UPDATE")
            .bind(target_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(target_id, "engagement.lock_row", e))?;

        Ok(PgRowLock {
            tx,
            target_id: target_id.to_string(),
        })
    }
}

/// Row lock held by an open Postgres transaction; dropping it rolls back
pub struct PgRowLock {
    tx: Transaction<'static, Postgres>,
    target_id: String,
}

impl PgRowLock {
    async fn append(&mut self, event: &EngagementEvent) -> Result<(), AggregateError> {
        sqlx::query(INSERT_EVENT)
            .bind(event.id)
            .bind(event.kind.as_db_str())
            .bind(&event.user_id)
            .bind(&event.target_id)
            .bind(&event.comment)
            .bind(event.occurred_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(&self.target_id, "engagement.append", e))?;
        Ok(())
    }

    async fn recompute(&mut self) -> Result<EngagementStats, AggregateError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(COUNT_BY_KIND)
            .bind(&self.target_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| classify(&self.target_id, "engagement.recompute", e))?;
        Ok(fold_rows(&self.target_id, rows))
    }

    async fn write_back(&mut self, stats: &EngagementStats) -> Result<(), AggregateError> {
        sqlx::query(
            r#"
            UPDATE engagement_stats
            SET likes = $2, dislikes = $3, views = $4, comments = $5, updated_at = NOW()
            WHERE target_id = $1
            "#,
        )
        .bind(&self.target_id)
        .bind(stats.likes as i64)
        .bind(stats.dislikes as i64)
        .bind(stats.views as i64)
        .bind(stats.comments as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(&self.target_id, "engagement.write_back", e))?;
        Ok(())
    }

    async fn release(self) -> Result<(), AggregateError> {
        let target_id = self.target_id;
        self.tx
            .commit()
            .await
            .map_err(|e| classify(&target_id, "engagement.release", e))
    }
}

#[derive(Default)]
struct MemoryLogInner {
    events: RwLock<Vec<EngagementEvent>>,
    rows: Mutex<HashMap<String, Arc<Mutex<EngagementStats>>>>,
}

/// Process-local engagement log
#[derive(Clone, Default)]
pub struct MemoryEngagementLog {
    inner: Arc<MemoryLogInner>,
}

impl MemoryEngagementLog {
    async fn append(&self, event: &EngagementEvent) -> Result<(), StorageError> {
        self.inner.events.write().await.push(event.clone());
        Ok(())
    }

    async fn stats(&self, target_id: &str) -> Result<EngagementStats, StorageError> {
        let events = self.inner.events.read().await;
        Ok(EngagementStats::fold(
            events
                .iter()
                .filter(|e| e.target_id == target_id)
                .map(|e| e.kind),
        ))
    }

    async fn comments(&self, target_id: &str) -> Result<Vec<CommentEntry>, StorageError> {
        let events = self.inner.events.read().await;
        let mut comments: Vec<CommentEntry> = events
            .iter()
            .filter(|e| e.target_id == target_id && e.kind == EngagementKind::Comment)
            .map(|e| CommentEntry {
                event_id: e.id,
                user_id: e.user_id.clone(),
                comment: e.comment.clone().unwrap_or_default(),
                created_at: e.occurred_at,
            })
            .collect();
        // stable: ties keep append order
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn list_events(&self, limit: usize) -> Result<Vec<EngagementEvent>, StorageError> {
        let events = self.inner.events.read().await;
        let mut newest: Vec<EngagementEvent> = events.iter().rev().cloned().collect();
        // stable: ties keep the later append first
        newest.sort_by_key(|e| std::cmp::Reverse(e.occurred_at));
        newest.truncate(limit);
        Ok(newest)
    }

    async fn row(&self, target_id: &str) -> Arc<Mutex<EngagementStats>> {
        self.inner
            .rows
            .lock()
            .await
            .entry(target_id.to_string())
            .or_default()
            .clone()
    }

    async fn stored_stats(&self, target_id: &str) -> Result<Option<EngagementStats>, StorageError> {
        let row = self.inner.rows.lock().await.get(target_id).cloned();
        match row {
            Some(row) => Ok(Some(*row.lock().await)),
            None => Ok(None),
        }
    }

    async fn lock_row(&self, target_id: &str, timeout: Duration) -> Result<MemoryRowLock, AggregateError> {
        let row = self.row(target_id).await;
        let guard = tokio::time::timeout(timeout, row.lock_owned())
            .await
            .map_err(|_| ConflictError {
                target_id: target_id.to_string(),
                reason: format!("row lock not acquired within {timeout:?}"),
            })?;

        Ok(MemoryRowLock {
            guard,
            log: self.clone(),
            target_id: target_id.to_string(),
        })
    }
}

/// Row lock held as an owned mutex guard
pub struct MemoryRowLock {
    guard: OwnedMutexGuard<EngagementStats>,
    log: MemoryEngagementLog,
    target_id: String,
}

/// Exclusive hold on one target's aggregate row
pub enum RowLock {
    Postgres(PgRowLock),
    Memory(MemoryRowLock),
}

impl RowLock {
    /// Append under the lock
    pub async fn append(&mut self, event: &EngagementEvent) -> Result<(), AggregateError> {
        match self {
            RowLock::Postgres(lock) => lock.append(event).await,
            RowLock::Memory(lock) => Ok(lock.log.append(event).await?),
        }
    }

    /// Fold the log for the locked target
    pub async fn recompute(&mut self) -> Result<EngagementStats, AggregateError> {
        match self {
            RowLock::Postgres(lock) => lock.recompute().await,
            RowLock::Memory(lock) => Ok(lock.log.stats(&lock.target_id).await?),
        }
    }

    /// Store `stats` in the aggregate row
    pub async fn write_back(&mut self, stats: &EngagementStats) -> Result<(), AggregateError> {
        match self {
            RowLock::Postgres(lock) => lock.write_back(stats).await,
            RowLock::Memory(lock) => {
                *lock.guard = *stats;
                Ok(())
            }
        }
    }

    /// Commit and let the next writer in
    pub async fn release(self) -> Result<(), AggregateError> {
        match self {
            RowLock::Postgres(lock) => lock.release().await,
            RowLock::Memory(lock) => {
                drop(lock.guard);
                Ok(())
            }
        }
    }
}

/// Engagement log over a closed set of backends
#[derive(Clone)]
pub enum EngagementLog {
    Postgres(PgEngagementLog),
    Memory(MemoryEngagementLog),
}

impl EngagementLog {
    pub fn in_memory() -> Self {
        EngagementLog::Memory(MemoryEngagementLog::default())
    }

    pub async fn append(&self, event: &EngagementEvent) -> Result<(), StorageError> {
        debug!(event_id = %event.id, kind = %event.kind, target_id = %event.target_id, "Appending engagement event");
        match self {
            EngagementLog::Postgres(log) => log.append(event).await,
            EngagementLog::Memory(log) => log.append(event).await,
        }
    }

    /// Fold the log for `target_id` by kind
    pub async fn stats(&self, target_id: &str) -> Result<EngagementStats, StorageError> {
        match self {
            EngagementLog::Postgres(log) => log.stats(target_id).await,
            EngagementLog::Memory(log) => log.stats(target_id).await,
        }
    }

    /// Comments in chronological order, ties in append order
    pub async fn comments(&self, target_id: &str) -> Result<Vec<CommentEntry>, StorageError> {
        match self {
            EngagementLog::Postgres(log) => log.comments(target_id).await,
            EngagementLog::Memory(log) => log.comments(target_id).await,
        }
    }

    /// Up to `limit` events across all targets, newest first
    pub async fn list_events(&self, limit: usize) -> Result<Vec<EngagementEvent>, StorageError> {
        match self {
            EngagementLog::Postgres(log) => log.list_events(limit).await,
            EngagementLog::Memory(log) => log.list_events(limit).await,
        }
    }

    /// Counts last written back to the aggregate row, if any
    pub async fn stored_stats(&self, target_id: &str) -> Result<Option<EngagementStats>, StorageError> {
        match self {
            EngagementLog::Postgres(log) => log.stored_stats(target_id).await,
            EngagementLog::Memory(log) => log.stored_stats(target_id).await,
        }
    }

    /// Wait up to `timeout` for exclusive hold of the target's row
    pub async fn lock_row(&self, target_id: &str, timeout: Duration) -> Result<RowLock, AggregateError> {
        match self {
            EngagementLog::Postgres(log) => Ok(RowLock::Postgres(log.lock_row(target_id, timeout).await?)),
            EngagementLog::Memory(log) => Ok(RowLock::Memory(log.lock_row(target_id, timeout).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn comment_at(user: &str, text: &str, secs: i64) -> EngagementEvent {
        let mut event = EngagementEvent::comment(user, "a.jpg", text);
        event.occurred_at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        event
    }

    #[tokio::test]
    async fn test_stats_fold_only_the_target() {
        let log = EngagementLog::in_memory();
        log.append(&EngagementEvent::new(EngagementKind::Like, "u1", "a.jpg")).await.unwrap();
        log.append(&EngagementEvent::new(EngagementKind::View, "u1", "a.jpg")).await.unwrap();
        log.append(&EngagementEvent::new(EngagementKind::Like, "u1", "b.jpg")).await.unwrap();

        let stats = log.stats("a.jpg").await.unwrap();
        assert_eq!(stats, EngagementStats { likes: 1, dislikes: 0, views: 1, comments: 0 });
        assert_eq!(log.stats("missing").await.unwrap(), EngagementStats::default());
    }

    #[tokio::test]
    async fn test_comments_are_chronological_with_append_order_ties() {
        let log = EngagementLog::in_memory();
        log.append(&comment_at("u3", "third", 20)).await.unwrap();
        log.append(&comment_at("u1", "first", 10)).await.unwrap();
        log.append(&comment_at("u2", "second", 10)).await.unwrap();
        log.append(&EngagementEvent::new(EngagementKind::Like, "u1", "a.jpg")).await.unwrap();

        let texts: Vec<String> = log
            .comments("a.jpg")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.comment)
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_list_events_newest_first_across_targets() {
        let log = EngagementLog::in_memory();
        log.append(&comment_at("u1", "old", 10)).await.unwrap();
        let mut like = EngagementEvent::new(EngagementKind::Like, "u2", "b.jpg");
        like.occurred_at = Utc.timestamp_opt(1_700_000_030, 0).unwrap();
        log.append(&like).await.unwrap();
        log.append(&comment_at("u3", "tied-first", 20)).await.unwrap();
        log.append(&comment_at("u4", "tied-second", 20)).await.unwrap();

        let events = log.list_events(10).await.unwrap();
        let users: Vec<&str> = events.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, vec!["u2", "u4", "u3", "u1"]);
        assert_eq!(events[0], like);
        assert_eq!(events[1].comment.as_deref(), Some("tied-second"));

        let page = log.list_events(2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].user_id, "u4");
        assert!(EngagementLog::in_memory().list_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_row_lock_excludes_second_writer() {
        let log = EngagementLog::in_memory();
        let held = log.lock_row("a.jpg", Duration::from_millis(50)).await.unwrap();

        let contended = log.lock_row("a.jpg", Duration::from_millis(20)).await;
        assert!(matches!(contended, Err(AggregateError::Conflict(_))));

        // other targets are unaffected
        let other = log.lock_row("b.jpg", Duration::from_millis(20)).await;
        assert!(other.is_ok());

        held.release().await.unwrap();
        assert!(log.lock_row("a.jpg", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_row_lock_write_back() {
        let log = EngagementLog::in_memory();
        assert_eq!(log.stored_stats("a.jpg").await.unwrap(), None);

        let mut lock = log.lock_row("a.jpg", Duration::from_millis(50)).await.unwrap();
        lock.append(&EngagementEvent::new(EngagementKind::Dislike, "u1", "a.jpg"))
            .await
            .unwrap();
        let stats = lock.recompute().await.unwrap();
        lock.write_back(&stats).await.unwrap();
        lock.release().await.unwrap();

        assert_eq!(log.stored_stats("a.jpg").await.unwrap(), Some(stats));
        assert_eq!(stats.dislikes, 1);
    }

    #[test]
    fn test_fold_rows_ignores_unknown_types() {
        let stats = fold_rows(
            "a.jpg",
            vec![
                ("user-like".to_string(), 3),
                ("user-comment".to_string(), 1),
                ("user-poke".to_string(), 9),
            ],
        );
        assert_eq!(stats, EngagementStats { likes: 3, dislikes: 0, views: 0, comments: 1 });
    }
}
