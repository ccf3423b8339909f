//! Durable queue with retry and dead-lettering.
//!
//! Per-message lifecycle:
//!
//! ```text
//! enqueue ──▶ Visible ──receive──▶ InFlight ──ack──▶ (removed)
//!                ▲                    │
//!                │   nack / deadline  │
//!                └──── count < max ◀──┤
//!                                     └── count >= max ──▶ dead-letter queue
//! ```
//!
//! A dead-letter queue is just another [`DurableQueue`]; entries carry a
//! [`DeadLetterOrigin`] describing where they came from.

mod durable;
mod journal;
mod message;

pub use durable::DurableQueue;
pub use journal::{JournalOp, QueueJournal};
pub use message::{
    DeadLetterOrigin, NackOutcome, QueueConfig, QueueStats, Receipt, ReceivedMessage,
};
