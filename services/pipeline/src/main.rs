//! Pixora Pipeline - operator tool
//!
//! Publishes lifecycle and engagement events from the command line and tails
//! the event topic. Useful for poking a running deployment without going
//! through the HTTP surface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pixora_pipeline::prelude::*;
use pixora_pipeline::{ConsumerBuilder, ProducerBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pixora-pipeline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// How long a publish waits for the broker to acknowledge
    #[arg(long, global = true, default_value_t = 5000)]
    publish_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the topic with a throwaway group and log every event
    Tail {
        /// Consumer group to join
        #[arg(long, default_value = "pixora-tail")]
        group: String,
    },

    /// Publish an upload of a local file
    Upload {
        path: PathBuf,

        /// Image id; defaults to the file name
        #[arg(long)]
        id: Option<String>,
    },

    /// Publish a replacement of an existing image
    Update { id: String, path: PathBuf },

    /// Publish a delete of an image
    Delete { id: String },

    /// Publish a user engagement event
    Engage {
        /// like, dislike, view or comment
        kind: EngagementKind,
        target: String,
        user: String,

        /// Comment text, required for comment events
        #[arg(long)]
        comment: Option<String>,
    },
}

/// Logs every event it receives
struct TailHandler;

#[async_trait]
impl EventHandler for TailHandler {
    type Error = std::convert::Infallible;

    async fn handle(
        &self,
        event: PipelineEvent,
        metadata: &MessageMetadata,
    ) -> Result<(), Self::Error> {
        info!(
            partition = metadata.partition,
            offset = metadata.offset,
            event_id = %event.id(),
            message_type = %event.message_type(),
            target_id = %event.target_id(),
            "Event"
        );
        Ok(())
    }
}

async fn tail(config: KafkaConfig, group: String) -> Result<()> {
    let consumer = Arc::new(
        ConsumerBuilder::from_config(config)
            .group_id(group)
            .auto_offset_reset("latest")
            .build()?,
    );

    let shutdown = consumer.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, shutting down...");
        shutdown.shutdown();
    });

    let summary = consumer.run(Arc::new(TailHandler)).await?;
    info!(
        consumed = summary.consumed,
        malformed = summary.malformed,
        "Tail finished"
    );
    Ok(())
}

fn engagement(
    kind: EngagementKind,
    target: String,
    user: String,
    comment: Option<String>,
) -> Result<EngagementEvent> {
    match (kind, comment) {
        (EngagementKind::Comment, Some(text)) => Ok(EngagementEvent::comment(user, target, text)),
        (EngagementKind::Comment, None) => anyhow::bail!("comment events need --comment"),
        (_, Some(_)) => anyhow::bail!("only comment events carry text"),
        (kind, None) => Ok(EngagementEvent::new(kind, user, target)),
    }
}

fn producer(config: &KafkaConfig, publish_timeout_ms: u64) -> Result<EventProducer> {
    Ok(ProducerBuilder::from_config(config.clone())
        .client_id(format!("{}-cli", config.client_id))
        .publish_timeout(Duration::from_millis(publish_timeout_ms))
        .build()?)
}

async fn publish(producer: &EventProducer, event: PipelineEvent) -> Result<()> {
    let delivery = producer
        .publish(&event)
        .await
        .with_context(|| format!("publishing {}", event.message_type()))?;

    info!(
        event_id = %event.id(),
        partition = delivery.partition,
        offset = delivery.offset,
        "Published {}",
        event.message_type()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = KafkaConfig::from_env()?;
    info!(brokers = %config.bootstrap_servers, topic = %config.topic, "Using Kafka");

    let event: PipelineEvent = match cli.command {
        Commands::Tail { group } => return tail(config, group).await,
        Commands::Upload { path, id } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let filename = match id {
                Some(id) => id,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("path has no file name")?,
            };
            LifecycleEvent::upload(filename, data).into()
        }
        Commands::Update { id, path } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            LifecycleEvent::update(id, data).into()
        }
        Commands::Delete { id } => LifecycleEvent::delete(id).into(),
        Commands::Engage {
            kind,
            target,
            user,
            comment,
        } => engagement(kind, target, user, comment)?.into(),
    };

    publish(&producer(&config, cli.publish_timeout_ms)?, event).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_engage() {
        let cli = Cli::try_parse_from([
            "pixora-pipeline",
            "engage",
            "comment",
            "a.jpg",
            "u1",
            "--comment",
            "nice",
        ])
        .unwrap();

        match cli.command {
            Commands::Engage { kind, comment, .. } => {
                assert_eq!(kind, EngagementKind::Comment);
                assert_eq!(comment.as_deref(), Some("nice"));
            }
            _ => panic!("expected engage"),
        }
        assert_eq!(cli.publish_timeout_ms, 5000);
    }

    #[test]
    fn test_publish_timeout_flag_follows_subcommand() {
        let cli = Cli::try_parse_from([
            "pixora-pipeline",
            "delete",
            "a.jpg",
            "--publish-timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(cli.publish_timeout_ms, 250);
        assert!(matches!(cli.command, Commands::Delete { .. }));
    }

    #[test]
    fn test_only_comments_carry_text() {
        assert!(engagement(EngagementKind::Like, "a".into(), "u".into(), Some("x".into())).is_err());
        assert!(engagement(EngagementKind::Comment, "a".into(), "u".into(), None).is_err());

        let event = engagement(EngagementKind::View, "a".into(), "u".into(), None).unwrap();
        assert_eq!(event.kind, EngagementKind::View);
        assert_eq!(event.comment, None);
    }
}
