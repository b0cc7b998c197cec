//! Engagement aggregation under a configurable locking strategy.

use crate::engagement::{CommentEntry, EngagementLog};
use crate::error::{AggregateError, StorageError};
use crate::storage::bounded;
use pixora_pipeline::{EngagementEvent, EngagementStats};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// How concurrent writers to one target are serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingStrategy {
    /// Lock the aggregate row across append, recompute and write-back
    #[default]
    RowLocking,
    /// Append without locking; stats come from scanning the log
    EnhancedList,
    /// Lock only around the append, recompute outside the lock
    Combined,
}

impl LockingStrategy {
    /// Accepts the snake_case names and the legacy camelCase strategy names
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "row_locking" | "row-locking" | "rowLockingStrategy" => Some(LockingStrategy::RowLocking),
            "enhanced_list" | "enhanced-list" | "enhancedListStrategy" => {
                Some(LockingStrategy::EnhancedList)
            }
            "combined" | "combinedRowLockingEnhancedListStrategy" => Some(LockingStrategy::Combined),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockingStrategy::RowLocking => "row_locking",
            LockingStrategy::EnhancedList => "enhanced_list",
            LockingStrategy::Combined => "combined",
        }
    }

    /// Append `event` to the log and return the target's stats afterwards.
    /// Holds nothing across calls beyond the lock taken inside this one.
    pub async fn apply_and_recompute(
        &self,
        log: &EngagementLog,
        event: &EngagementEvent,
        lock_timeout: Duration,
    ) -> Result<EngagementStats, AggregateError> {
        match self {
            LockingStrategy::RowLocking => {
                let mut lock = log.lock_row(&event.target_id, lock_timeout).await?;
                lock.append(event).await?;
                let stats = lock.recompute().await?;
                lock.write_back(&stats).await?;
                lock.release().await?;
                Ok(stats)
            }
            LockingStrategy::EnhancedList => {
                log.append(event).await?;
                Ok(log.stats(&event.target_id).await?)
            }
            LockingStrategy::Combined => {
                let mut lock = log.lock_row(&event.target_id, lock_timeout).await?;
                lock.append(event).await?;
                lock.release().await?;
                Ok(log.stats(&event.target_id).await?)
            }
        }
    }
}

impl fmt::Display for LockingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies engagement events and serves the stats read path
pub struct EngagementAggregator {
    log: EngagementLog,
    strategy: LockingStrategy,
    lock_timeout: Duration,
    operation_timeout: Duration,
}

impl EngagementAggregator {
    pub fn new(
        log: EngagementLog,
        strategy: LockingStrategy,
        lock_timeout: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            log,
            strategy,
            lock_timeout,
            operation_timeout,
        }
    }

    pub fn strategy(&self) -> LockingStrategy {
        self.strategy
    }

    pub fn log(&self) -> &EngagementLog {
        &self.log
    }

    /// Apply one event, retrying once if the first attempt hits a conflict
    #[instrument(skip(self, event), fields(event_id = %event.id, kind = %event.kind, target_id = %event.target_id, strategy = %self.strategy))]
    pub async fn apply(&self, event: &EngagementEvent) -> Result<EngagementStats, AggregateError> {
        match self.attempt(event).await {
            Err(AggregateError::Conflict(conflict)) => {
                metrics::counter!("engagement.conflicts").increment(1);
                warn!(reason = %conflict.reason, "Conflict applying engagement event, retrying once");
                let result = self.attempt(event).await;
                if let Err(AggregateError::Conflict(_)) = result {
                    metrics::counter!("engagement.conflicts").increment(1);
                }
                result
            }
            other => other,
        }
    }

    async fn attempt(&self, event: &EngagementEvent) -> Result<EngagementStats, AggregateError> {
        let limit = self.operation_timeout + self.lock_timeout;
        match tokio::time::timeout(
            limit,
            self.strategy.apply_and_recompute(&self.log, event, self.lock_timeout),
        )
        .await
        {
            Ok(Ok(stats)) => {
                metrics::counter!("engagement.events.applied").increment(1);
                debug!(
                    likes = stats.likes,
                    dislikes = stats.dislikes,
                    views = stats.views,
                    comments = stats.comments,
                    "Engagement event applied"
                );
                Ok(stats)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StorageError::Timeout {
                operation: "engagement.apply",
                after: limit,
            }
            .into()),
        }
    }

    /// Stats folded from the log, never from the aggregate row
    pub async fn get_stats(&self, target_id: &str) -> Result<EngagementStats, StorageError> {
        bounded("engagement.stats", self.operation_timeout, self.log.stats(target_id)).await
    }

    pub async fn get_comments(&self, target_id: &str) -> Result<Vec<CommentEntry>, StorageError> {
        bounded(
            "engagement.comments",
            self.operation_timeout,
            self.log.comments(target_id),
        )
        .await
    }

    /// Recent engagement across every target, newest first
    pub async fn list_events(&self, limit: usize) -> Result<Vec<EngagementEvent>, StorageError> {
        bounded(
            "engagement.list_events",
            self.operation_timeout,
            self.log.list_events(limit),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixora_pipeline::EngagementKind;
    use std::sync::Arc;

    fn aggregator(strategy: LockingStrategy) -> EngagementAggregator {
        EngagementAggregator::new(
            EngagementLog::in_memory(),
            strategy,
            Duration::from_millis(500),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_parse_strategy_names() {
        assert_eq!(LockingStrategy::parse("row_locking"), Some(LockingStrategy::RowLocking));
        assert_eq!(LockingStrategy::parse("rowLockingStrategy"), Some(LockingStrategy::RowLocking));
        assert_eq!(LockingStrategy::parse("enhancedListStrategy"), Some(LockingStrategy::EnhancedList));
        assert_eq!(
            LockingStrategy::parse("combinedRowLockingEnhancedListStrategy"),
            Some(LockingStrategy::Combined)
        );
        assert_eq!(LockingStrategy::parse("optimistic"), None);
    }

    #[tokio::test]
    async fn test_every_strategy_counts_the_same() {
        for strategy in [
            LockingStrategy::RowLocking,
            LockingStrategy::EnhancedList,
            LockingStrategy::Combined,
        ] {
            let aggregator = aggregator(strategy);
            for _ in 0..3 {
                aggregator
                    .apply(&EngagementEvent::new(EngagementKind::Like, "u1", "a.jpg"))
                    .await
                    .unwrap();
            }
            let last = aggregator
                .apply(&EngagementEvent::comment("u2", "a.jpg", "nice"))
                .await
                .unwrap();

            let expected = EngagementStats { likes: 3, dislikes: 0, views: 0, comments: 1 };
            assert_eq!(last, expected, "{strategy}");
            assert_eq!(aggregator.get_stats("a.jpg").await.unwrap(), expected, "{strategy}");
        }
    }

    #[tokio::test]
    async fn test_only_row_locking_writes_back() {
        let row_locking = aggregator(LockingStrategy::RowLocking);
        let enhanced = aggregator(LockingStrategy::EnhancedList);
        let event = EngagementEvent::new(EngagementKind::View, "u1", "a.jpg");

        row_locking.apply(&event).await.unwrap();
        enhanced.apply(&event).await.unwrap();

        assert_eq!(
            row_locking.log().stored_stats("a.jpg").await.unwrap().map(|s| s.views),
            Some(1)
        );
        assert_eq!(enhanced.log().stored_stats("a.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_row_locking_is_linearizable() {
        let aggregator = Arc::new(aggregator(LockingStrategy::RowLocking));
        let kinds = [
            EngagementKind::Like,
            EngagementKind::Dislike,
            EngagementKind::View,
            EngagementKind::Comment,
        ];

        let mut tasks = Vec::new();
        for i in 0..40 {
            let aggregator = aggregator.clone();
            let kind = kinds[i % kinds.len()];
            tasks.push(tokio::spawn(async move {
                let event = match kind {
                    EngagementKind::Comment => EngagementEvent::comment(format!("u{i}"), "hot.jpg", "hi"),
                    kind => EngagementEvent::new(kind, format!("u{i}"), "hot.jpg"),
                };
                aggregator.apply(&event).await
            }));
        }

        let mut totals = Vec::new();
        for task in tasks {
            totals.push(task.await.unwrap().unwrap().total());
        }

        // each writer saw a distinct prefix of the log
        totals.sort_unstable();
        assert_eq!(totals, (1..=40).collect::<Vec<u64>>());

        let expected = EngagementStats { likes: 10, dislikes: 10, views: 10, comments: 10 };
        assert_eq!(aggregator.get_stats("hot.jpg").await.unwrap(), expected);
        assert_eq!(aggregator.log().stored_stats("hot.jpg").await.unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_once_then_surfaced() {
        let log = EngagementLog::in_memory();
        let aggregator = EngagementAggregator::new(
            log.clone(),
            LockingStrategy::RowLocking,
            Duration::from_millis(20),
            Duration::from_secs(1),
        );

        let held = log.lock_row("a.jpg", Duration::from_millis(20)).await.unwrap();
        let result = aggregator
            .apply(&EngagementEvent::new(EngagementKind::Like, "u1", "a.jpg"))
            .await;
        assert!(matches!(result, Err(AggregateError::Conflict(_))));
        held.release().await.unwrap();

        assert_eq!(aggregator.get_stats("a.jpg").await.unwrap().likes, 0);
    }

    #[tokio::test]
    async fn test_conflict_then_success_on_retry() {
        let log = EngagementLog::in_memory();
        let aggregator = EngagementAggregator::new(
            log.clone(),
            LockingStrategy::Combined,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        let held = log.lock_row("a.jpg", Duration::from_millis(20)).await.unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            held.release().await
        });

        let stats = aggregator
            .apply(&EngagementEvent::new(EngagementKind::Like, "u1", "a.jpg"))
            .await
            .unwrap();
        assert_eq!(stats.likes, 1);
        releaser.await.unwrap().unwrap();
    }
}
