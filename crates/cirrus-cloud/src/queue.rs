//! Message-queue capability interface for interruption notices

use std::time::Duration;

use async_trait::async_trait;

use cirrus_common::Result;

/// A received queue message
#[derive(Clone, Debug, PartialEq)]
pub struct QueueMessage {
    /// Message id, stable across redeliveries
    pub message_id: String,
    /// Receipt handle for this delivery; required to delete
    pub receipt_handle: String,
    /// Message body
    pub body: String,
}

/// Interface to the interruption queue
///
/// The queue is read by a single consumer to preserve per-message
/// at-least-once semantics; deletion acknowledges a message.
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Long-poll up to `max_messages` messages
    async fn receive_messages(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Acknowledge (delete) a delivery
    async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<()>;
}
