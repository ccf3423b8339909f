//! Message types owned by the durable queue.

use crate::types::{Event, MessageId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Name used in diagnostics and dead-letter provenance.
    pub name: String,

    /// Deliveries allowed before a message is dead-lettered.
    /// Default: 3
    pub max_attempts: u32,

    /// How long a received message stays hidden from other receivers.
    /// Default: 30s
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue".to_string(),
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Where a dead-lettered message came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterOrigin {
    pub source_queue: String,
    pub source_message: MessageId,
    pub final_delivery_count: u32,
    pub dead_lettered_at: Timestamp,
}

/// Lifecycle position of a live message. Acked and dead-lettered messages
/// are removed from the queue, so they have no state here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageState {
    Visible,
    InFlight,
}

/// A message held by the queue.
#[derive(Clone, Debug)]
pub(crate) struct QueuedMessage {
    pub id: MessageId,
    pub event: Event,
    pub delivery_count: u32,
    pub first_enqueued_at: Timestamp,
    /// When visible: the time it became visible. When in flight: the deadline.
    pub visible_at: Timestamp,
    pub state: MessageState,
    pub origin: Option<DeadLetterOrigin>,
}

/// Proof of one specific delivery.
///
/// A receipt from an earlier delivery does not match once the message has
/// expired and been handed out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub message_id: MessageId,
    pub delivery: u32,
}

/// A message handed to a consumer by `receive`.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub receipt: Receipt,
    pub event: Event,
    pub delivery_count: u32,
    pub first_enqueued_at: Timestamp,
    pub deadline: Timestamp,
    /// Set when this queue is a dead-letter queue.
    pub origin: Option<DeadLetterOrigin>,
}

/// Result of a `nack` (or of a deadline expiring).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackOutcome {
    /// Visible again for redelivery.
    Requeued { delivery_count: u32 },
    /// Moved to the dead-letter queue under a new id.
    DeadLettered { dead_letter_id: MessageId },
    /// Retry budget exhausted and no dead-letter queue configured.
    Discarded,
    /// The receipt no longer matches a live delivery.
    Stale,
}

/// Counters for queue activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub expired: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
}
