//! In-process topic used when no broker is configured and in tests.
//!
//! Behaves like a single-partition topic: messages are delivered in publish
//! order with increasing offsets, and the stream ends once every writer has
//! been dropped.

use crate::consumer::{IncomingMessage, MessageMetadata};
use crate::producer::{DeliveryResult, OutgoingMessage};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Create a connected writer/reader pair for `topic`
pub fn memory_topic(topic: impl Into<String>) -> (MemoryTopicWriter, MemoryTopicReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let topic = topic.into();
    let committed = Arc::new(AtomicI64::new(-1));

    (
        MemoryTopicWriter {
            topic: topic.clone(),
            tx,
            next_offset: Arc::new(SyncMutex::new(0)),
        },
        MemoryTopicReader {
            topic,
            rx: Mutex::new(rx),
            committed,
        },
    )
}

/// Producer half of a memory topic
#[derive(Clone, Debug)]
pub struct MemoryTopicWriter {
    topic: String,
    tx: mpsc::UnboundedSender<IncomingMessage>,
    /// Held across offset assignment and send so offsets reach the reader in order
    next_offset: Arc<SyncMutex<i64>>,
}

impl MemoryTopicWriter {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a message. Fails only when the reader has gone away, in which
    /// case no offset is consumed.
    pub fn append(&self, message: OutgoingMessage) -> Result<DeliveryResult, String> {
        let mut next_offset = self.next_offset.lock();
        let offset = *next_offset;
        let headers: HashMap<String, String> = message.headers.into_iter().collect();

        let incoming = IncomingMessage {
            payload: message.payload,
            metadata: MessageMetadata {
                topic: self.topic.clone(),
                partition: 0,
                offset,
                key: message.key.as_ref().map(|k| k.as_bytes().to_vec()),
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                headers,
            },
        };

        self.tx
            .send(incoming)
            .map_err(|_| format!("memory topic {} has no reader", self.topic))?;
        *next_offset += 1;

        Ok(DeliveryResult {
            topic: self.topic.clone(),
            partition: 0,
            offset,
            key: message.key,
        })
    }
}

/// Consumer half of a memory topic
#[derive(Debug)]
pub struct MemoryTopicReader {
    topic: String,
    rx: Mutex<mpsc::UnboundedReceiver<IncomingMessage>>,
    committed: Arc<AtomicI64>,
}

impl MemoryTopicReader {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message; `None` once all writers are dropped
    pub async fn next(&self) -> Option<IncomingMessage> {
        self.rx.lock().await.recv().await
    }

    pub fn commit(&self, offset: i64) {
        self.committed.fetch_max(offset, Ordering::SeqCst);
    }

    /// Highest committed offset, or -1 before the first commit
    pub fn committed_offset(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &[u8]) -> OutgoingMessage {
        OutgoingMessage {
            topic: "events".to_string(),
            key: Some("a.jpg".to_string()),
            payload: payload.to_vec(),
            headers: vec![("message-type".to_string(), "engagement.like".to_string())],
        }
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order_with_offsets() {
        let (writer, reader) = memory_topic("events");

        for i in 0..3u8 {
            let delivery = writer.append(message(&[i])).unwrap();
            assert_eq!(delivery.offset, i as i64);
        }

        for i in 0..3u8 {
            let incoming = reader.next().await.unwrap();
            assert_eq!(incoming.payload, vec![i]);
            assert_eq!(incoming.metadata.offset, i as i64);
            assert_eq!(incoming.key_str().as_deref(), Some("a.jpg"));
            assert_eq!(incoming.message_type(), Some("engagement.like"));
        }
    }

    #[tokio::test]
    async fn test_stream_ends_when_writers_dropped() {
        let (writer, reader) = memory_topic("events");
        let clone = writer.clone();
        drop(writer);
        clone.append(message(b"last")).unwrap();
        drop(clone);

        assert!(reader.next().await.is_some());
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn test_append_without_reader_fails() {
        let (writer, reader) = memory_topic("events");
        drop(reader);
        assert!(writer.append(message(b"x")).is_err());
        assert!(writer.append(message(b"y")).is_err());
        assert_eq!(*writer.next_offset.lock(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_deliver_offsets_in_order() {
        let (writer, reader) = memory_topic("events");

        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let writer = writer.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        writer.append(message(&[t])).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        drop(writer);

        let mut expected = 0;
        while let Some(incoming) = reader.next().await {
            assert_eq!(incoming.metadata.offset, expected);
            expected += 1;
        }
        assert_eq!(expected, 1000);
    }

    #[test]
    fn test_commit_is_monotonic() {
        let (_writer, reader) = memory_topic("events");
        assert_eq!(reader.committed_offset(), -1);
        reader.commit(4);
        reader.commit(2);
        assert_eq!(reader.committed_offset(), 4);
    }
}
