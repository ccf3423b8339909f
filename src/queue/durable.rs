//! Durable queue with visibility deadlines, bounded redelivery and a
//! dead-letter queue.

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::types::{Event, MessageId, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::journal::{JournalOp, QueueJournal};
use super::message::{
    DeadLetterOrigin, MessageState, NackOutcome, QueueConfig, QueueStats, QueuedMessage, Receipt,
    ReceivedMessage,
};

/// State guarded by the queue lock.
#[derive(Default)]
struct QueueInner {
    /// Live messages keyed by id; ids are assigned in enqueue order.
    messages: BTreeMap<MessageId, QueuedMessage>,
    next_id: u64,
    stats: QueueStats,
}

/// A pull-based queue giving at-least-once delivery.
///
/// `receive`, `ack` and `nack` are atomic with respect to each other; a
/// message has at most one in-flight holder at a time.
pub struct DurableQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    dead_letter: Option<Arc<DurableQueue>>,
    clock: Arc<dyn Clock>,
    journal: Option<QueueJournal>,
    /// Wakes idle workers when something becomes visible.
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
}

impl DurableQueue {
    /// Create an in-memory queue on the system clock.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an in-memory queue on the given clock.
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let (ready_tx, ready_rx) = bounded(1);
        Self {
            config,
            inner: Mutex::new(QueueInner {
                next_id: 1,
                ..Default::default()
            }),
            dead_letter: None,
            clock,
            journal: None,
            ready_tx,
            ready_rx,
        }
    }

    /// Open a queue backed by a journal file, replaying what it holds.
    ///
    /// Messages that were in flight when the journal was last written come
    /// back already expired, so the next `receive` or `reap_expired` applies
    /// the normal retry rule to them.
    pub fn open_journaled(
        config: QueueConfig,
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (journal, ops) = QueueJournal::open(path)?;
        let now = clock.now();

        let mut queue = Self::with_clock(config, clock);
        {
            let inner = queue.inner.get_mut();
            Self::replay(inner, ops, now);
            info!(
                queue = %queue.config.name,
                messages = inner.messages.len(),
                "queue restored from journal"
            );
        }
        queue.journal = Some(journal);
        Ok(queue)
    }

    /// Route exhausted messages to `dead_letter`.
    pub fn with_dead_letter(mut self, dead_letter: Arc<DurableQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    fn replay(inner: &mut QueueInner, ops: Vec<JournalOp>, now: Timestamp) {
        for op in ops {
            match op {
                JournalOp::Enqueued {
                    id,
                    event,
                    enqueued_at,
                    origin,
                } => {
                    inner.next_id = inner.next_id.max(id.0 + 1);
                    inner.messages.insert(
                        id,
                        QueuedMessage {
                            id,
                            event,
                            delivery_count: 0,
                            first_enqueued_at: enqueued_at,
                            visible_at: enqueued_at,
                            state: MessageState::Visible,
                            origin,
                        },
                    );
                }
                JournalOp::Delivered { id, delivery_count } => {
                    if let Some(msg) = inner.messages.get_mut(&id) {
                        msg.delivery_count = delivery_count;
                        msg.state = MessageState::InFlight;
                        msg.visible_at = now;
                    }
                }
                JournalOp::Released { id } => {
                    if let Some(msg) = inner.messages.get_mut(&id) {
                        msg.state = MessageState::Visible;
                        msg.visible_at = now;
                    }
                }
                JournalOp::Removed { id } => {
                    inner.messages.remove(&id);
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn dead_letter_queue(&self) -> Option<&Arc<DurableQueue>> {
        self.dead_letter.as_ref()
    }

    /// Channel signalled whenever a message becomes visible.
    pub fn ready(&self) -> &Receiver<()> {
        &self.ready_rx
    }

    // --- Operations ---

    /// Add an event to the queue.
    pub fn enqueue(&self, event: Event) -> Result<MessageId> {
        self.enqueue_with_origin(event, None)
    }

    fn enqueue_with_origin(&self, event: Event, origin: Option<DeadLetterOrigin>) -> Result<MessageId> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let id = MessageId(inner.next_id);
        self.record(&[JournalOp::Enqueued {
            id,
            event: event.clone(),
            enqueued_at: now,
            origin: origin.clone(),
        }])?;
        inner.next_id += 1;

        debug!(queue = %self.config.name, message_id = %id, event_id = %event.id, "enqueued");
        inner.messages.insert(
            id,
            QueuedMessage {
                id,
                event,
                delivery_count: 0,
                first_enqueued_at: now,
                visible_at: now,
                state: MessageState::Visible,
                origin,
            },
        );
        inner.stats.enqueued += 1;
        drop(inner);

        self.signal_ready();
        Ok(id)
    }

    /// Hand out up to `batch_size` visible messages.
    ///
    /// Each returned message is in flight until acked, nacked, or its
    /// visibility deadline passes.
    pub fn receive(&self, batch_size: usize) -> Result<Vec<ReceivedMessage>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.expire_overdue(&mut inner, now)?;

        let selected: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.state == MessageState::Visible)
            .take(batch_size)
            .map(|m| m.id)
            .collect();

        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let ops: Vec<JournalOp> = selected
            .iter()
            .map(|id| JournalOp::Delivered {
                id: *id,
                delivery_count: inner.messages[id].delivery_count + 1,
            })
            .collect();
        self.record(&ops)?;

        let deadline = now.after(self.config.visibility_timeout);
        let mut received = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(msg) = inner.messages.get_mut(&id) {
                msg.delivery_count += 1;
                msg.state = MessageState::InFlight;
                msg.visible_at = deadline;

                received.push(ReceivedMessage {
                    receipt: Receipt {
                        message_id: id,
                        delivery: msg.delivery_count,
                    },
                    event: msg.event.clone(),
                    delivery_count: msg.delivery_count,
                    first_enqueued_at: msg.first_enqueued_at,
                    deadline,
                    origin: msg.origin.clone(),
                });
            }
        }
        inner.stats.delivered += received.len() as u64;

        debug!(queue = %self.config.name, count = received.len(), "received batch");
        Ok(received)
    }

    /// Acknowledge a delivery, removing the message for good.
    ///
    /// Returns `false` when the receipt is stale: the message was already
    /// acked, dead-lettered, or its deadline passed.
    pub fn ack(&self, receipt: &Receipt) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.expire_overdue(&mut inner, now)?;

        if !Self::is_current(&inner, receipt) {
            debug!(queue = %self.config.name, message_id = %receipt.message_id, "ack ignored for stale receipt");
            return Ok(false);
        }

        self.record(&[JournalOp::Removed {
            id: receipt.message_id,
        }])?;
        inner.messages.remove(&receipt.message_id);
        inner.stats.acked += 1;
        Ok(true)
    }

    /// Reject a delivery. The message is requeued, or dead-lettered once its
    /// delivery count has reached `max_attempts`.
    pub fn nack(&self, receipt: &Receipt) -> Result<NackOutcome> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.expire_overdue(&mut inner, now)?;

        if !Self::is_current(&inner, receipt) {
            return Ok(NackOutcome::Stale);
        }
        let outcome = self.release(&mut inner, receipt.message_id, now)?;
        drop(inner);

        if matches!(outcome, NackOutcome::Requeued { .. }) {
            self.signal_ready();
        }
        Ok(outcome)
    }

    /// Apply the expiry rule to every in-flight message past its deadline.
    pub fn reap_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired = self.expire_overdue(&mut inner, now)?;
        drop(inner);

        if expired > 0 {
            self.signal_ready();
        }
        Ok(expired)
    }

    /// Rewrite the journal so it holds only live messages.
    pub fn compact(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let inner = self.inner.lock();

        let mut ops = Vec::with_capacity(inner.messages.len() * 2);
        for msg in inner.messages.values() {
            ops.push(JournalOp::Enqueued {
                id: msg.id,
                event: msg.event.clone(),
                enqueued_at: msg.first_enqueued_at,
                origin: msg.origin.clone(),
            });
            if msg.delivery_count > 0 {
                ops.push(JournalOp::Delivered {
                    id: msg.id,
                    delivery_count: msg.delivery_count,
                });
                if msg.state == MessageState::Visible {
                    ops.push(JournalOp::Released { id: msg.id });
                }
            }
        }
        journal.rewrite(&ops)?;

        info!(queue = %self.config.name, messages = inner.messages.len(), "journal compacted");
        Ok(())
    }

    // --- Introspection ---

    /// Live messages (visible plus in flight).
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn visible_len(&self) -> usize {
        self.count_in(MessageState::Visible)
    }

    pub fn in_flight_len(&self) -> usize {
        self.count_in(MessageState::InFlight)
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }

    /// Events currently held, in enqueue order.
    pub fn peek_events(&self) -> Vec<Event> {
        self.inner
            .lock()
            .messages
            .values()
            .map(|m| m.event.clone())
            .collect()
    }

    fn count_in(&self, state: MessageState) -> usize {
        self.inner
            .lock()
            .messages
            .values()
            .filter(|m| m.state == state)
            .count()
    }

    // --- Internals ---

    fn is_current(inner: &QueueInner, receipt: &Receipt) -> bool {
        inner.messages.get(&receipt.message_id).map_or(false, |m| {
            m.state == MessageState::InFlight && m.delivery_count == receipt.delivery
        })
    }

    fn expire_overdue(&self, inner: &mut QueueInner, now: Timestamp) -> Result<usize> {
        let overdue: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.state == MessageState::InFlight && m.visible_at <= now)
            .map(|m| m.id)
            .collect();

        for id in &overdue {
            warn!(queue = %self.config.name, message_id = %id, "visibility deadline expired");
            inner.stats.expired += 1;
            self.release(inner, *id, now)?;
        }
        Ok(overdue.len())
    }

    /// Shared nack/expiry transition for an in-flight message.
    fn release(&self, inner: &mut QueueInner, id: MessageId, now: Timestamp) -> Result<NackOutcome> {
        let Some(msg) = inner.messages.get(&id) else {
            return Ok(NackOutcome::Stale);
        };
        let delivery_count = msg.delivery_count;

        if delivery_count < self.config.max_attempts {
            self.record(&[JournalOp::Released { id }])?;
            if let Some(msg) = inner.messages.get_mut(&id) {
                msg.state = MessageState::Visible;
                msg.visible_at = now;
            }
            inner.stats.requeued += 1;
            debug!(queue = %self.config.name, message_id = %id, delivery = delivery_count, "requeued");
            return Ok(NackOutcome::Requeued { delivery_count });
        }

        let Some(dead_letter) = &self.dead_letter else {
            self.record(&[JournalOp::Removed { id }])?;
            if let Some(msg) = inner.messages.remove(&id) {
                error!(
                    queue = %self.config.name,
                    message_id = %id,
                    event_id = %msg.event.id,
                    delivery = delivery_count,
                    "retry budget exhausted with no dead-letter queue, message discarded"
                );
            }
            inner.stats.discarded += 1;
            return Ok(NackOutcome::Discarded);
        };

        // Hand the message to the DLQ before forgetting it here, so a failure
        // leaves it in flight and it expires again later.
        let origin = DeadLetterOrigin {
            source_queue: self.config.name.clone(),
            source_message: id,
            final_delivery_count: delivery_count,
            dead_lettered_at: now,
        };
        let dead_letter_id = dead_letter.enqueue_with_origin(msg.event.clone(), Some(origin))?;

        self.record(&[JournalOp::Removed { id }])?;
        let removed = inner.messages.remove(&id);
        inner.stats.dead_lettered += 1;

        if let Some(msg) = removed {
            warn!(
                queue = %self.config.name,
                dead_letter_queue = %dead_letter.name(),
                message_id = %id,
                event_id = %msg.event.id,
                key = %msg.event.subject_key,
                delivery = delivery_count,
                "message dead-lettered"
            );
        }
        Ok(NackOutcome::DeadLettered { dead_letter_id })
    }

    /// Make the next `n` journal writes fail.
    #[cfg(test)]
    pub(crate) fn fail_next_journal_writes(&self, n: u32) {
        if let Some(journal) = &self.journal {
            journal.fail_next_appends(n);
        }
    }

    fn record(&self, ops: &[JournalOp]) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(ops),
            None => Ok(()),
        }
    }

    fn signal_ready(&self) {
        // A full channel already has a wakeup pending.
        let _ = self.ready_tx.try_send(());
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("name", &self.config.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{EventId, EventKind};
    use std::time::Duration;

    fn event(key: &str) -> Event {
        Event::new(EventId::new(format!("id-{key}")), EventKind::UploadCreated, key)
    }

    fn queue_with_dlq(clock: Arc<ManualClock>) -> (DurableQueue, Arc<DurableQueue>) {
        let dlq = Arc::new(DurableQueue::with_clock(
            QueueConfig::named("uploads-dlq"),
            clock.clone(),
        ));
        let queue = DurableQueue::with_clock(QueueConfig::named("uploads"), clock)
            .with_dead_letter(Arc::clone(&dlq));
        (queue, dlq)
    }

    #[test]
    fn test_enqueue_receive_ack() {
        let queue = DurableQueue::new(QueueConfig::default());
        queue.enqueue(event("a.png")).unwrap();

        let batch = queue.receive(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].delivery_count, 1);
        assert_eq!(queue.in_flight_len(), 1);

        assert!(queue.ack(&batch[0].receipt).unwrap());
        assert!(queue.is_empty());

        // Second ack is a no-op
        assert!(!queue.ack(&batch[0].receipt).unwrap());
        assert_eq!(queue.stats().acked, 1);
    }

    #[test]
    fn test_in_flight_is_hidden() {
        let queue = DurableQueue::new(QueueConfig::default());
        queue.enqueue(event("a.png")).unwrap();

        let first = queue.receive(10).unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(10).unwrap().is_empty());
    }

    #[test]
    fn test_batch_size_and_order() {
        let queue = DurableQueue::new(QueueConfig::default());
        for key in ["a.png", "b.png", "c.png"] {
            queue.enqueue(event(key)).unwrap();
        }

        let batch = queue.receive(2).unwrap();
        let keys: Vec<_> = batch.iter().map(|m| m.event.subject_key.as_str()).collect();
        assert_eq!(keys, vec!["a.png", "b.png"]);
        assert_eq!(queue.visible_len(), 1);
    }

    #[test]
    fn test_nack_requeues_then_dead_letters() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let (queue, dlq) = queue_with_dlq(clock);
        queue.enqueue(event("doc.pdf")).unwrap();

        for attempt in 1..=2 {
            let batch = queue.receive(1).unwrap();
            assert_eq!(batch[0].delivery_count, attempt);
            assert_eq!(
                queue.nack(&batch[0].receipt).unwrap(),
                NackOutcome::Requeued {
                    delivery_count: attempt
                }
            );
        }

        let batch = queue.receive(1).unwrap();
        assert_eq!(batch[0].delivery_count, 3);
        let outcome = queue.nack(&batch[0].receipt).unwrap();
        assert!(matches!(outcome, NackOutcome::DeadLettered { .. }));

        assert!(queue.is_empty());
        assert_eq!(dlq.len(), 1);

        // Ack after dead-lettering does nothing
        assert!(!queue.ack(&batch[0].receipt).unwrap());

        let dead = dlq.receive(1).unwrap();
        let origin = dead[0].origin.as_ref().unwrap();
        assert_eq!(origin.source_queue, "uploads");
        assert_eq!(origin.final_delivery_count, 3);
        assert_eq!(dead[0].event.subject_key, "doc.pdf");
        assert_eq!(dead[0].delivery_count, 1);
    }

    #[test]
    fn test_deadline_expiry_redelivers() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let (queue, _dlq) = queue_with_dlq(clock.clone());
        queue.enqueue(event("a.png")).unwrap();

        let first = queue.receive(1).unwrap();
        clock.advance(Duration::from_secs(29));
        assert!(queue.receive(1).unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        let second = queue.receive(1).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);

        // The crashed holder's receipt no longer works
        assert!(!queue.ack(&first[0].receipt).unwrap());
        assert_eq!(queue.nack(&first[0].receipt).unwrap(), NackOutcome::Stale);
        assert!(queue.ack(&second[0].receipt).unwrap());
        assert_eq!(queue.stats().expired, 1);
    }

    #[test]
    fn test_ack_after_deadline_is_noop() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let (queue, _dlq) = queue_with_dlq(clock.clone());
        queue.enqueue(event("a.png")).unwrap();

        let batch = queue.receive(1).unwrap();
        clock.advance(Duration::from_secs(31));

        assert!(!queue.ack(&batch[0].receipt).unwrap());
        assert_eq!(queue.visible_len(), 1);
    }

    #[test]
    fn test_expiry_counts_toward_dead_letter() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let (queue, dlq) = queue_with_dlq(clock.clone());
        queue.enqueue(event("slow.png")).unwrap();

        for _ in 0..3 {
            assert_eq!(queue.receive(1).unwrap().len(), 1);
            clock.advance(Duration::from_secs(30));
        }

        assert_eq!(queue.reap_expired().unwrap(), 1);
        assert!(queue.is_empty());
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn test_exhausted_without_dlq_is_discarded() {
        let queue = DurableQueue::new(QueueConfig {
            max_attempts: 1,
            ..QueueConfig::named("bare")
        });
        queue.enqueue(event("a.png")).unwrap();

        let batch = queue.receive(1).unwrap();
        assert_eq!(queue.nack(&batch[0].receipt).unwrap(), NackOutcome::Discarded);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().discarded, 1);
    }

    #[test]
    fn test_huge_visibility_timeout_keeps_message_hidden() {
        let clock = Arc::new(ManualClock::new(Timestamp(1_792_384_310_836_632)));
        let queue = DurableQueue::with_clock(
            QueueConfig {
                visibility_timeout: Duration::from_secs(u64::MAX),
                ..QueueConfig::named("uploads")
            },
            clock.clone(),
        );
        queue.enqueue(event("a.png")).unwrap();

        let first = queue.receive(1).unwrap();
        clock.advance(Duration::from_secs(3600));
        assert!(queue.receive(1).unwrap().is_empty());
        assert_eq!(queue.reap_expired().unwrap(), 0);
        assert!(queue.ack(&first[0].receipt).unwrap());
    }

    #[test]
    fn test_failed_dead_letter_write_keeps_message() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("uploads.journal");
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let dlq = Arc::new(DurableQueue::with_clock(
            QueueConfig::named("uploads-dlq"),
            clock.clone(),
        ));
        let config = QueueConfig {
            max_attempts: 1,
            ..QueueConfig::named("uploads")
        };

        {
            let queue = DurableQueue::open_journaled(config.clone(), &path, clock.clone())
                .unwrap()
                .with_dead_letter(Arc::clone(&dlq));
            queue.enqueue(event("doc.pdf")).unwrap();
            let batch = queue.receive(1).unwrap();

            queue.fail_next_journal_writes(1);
            assert!(queue.nack(&batch[0].receipt).is_err());

            // Memory still agrees with the journal
            assert_eq!(queue.len(), 1);
            assert_eq!(queue.in_flight_len(), 1);
            assert_eq!(queue.stats().dead_lettered, 0);
        }

        let reopened = DurableQueue::open_journaled(config, &path, clock).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_ready_signal() {
        let queue = DurableQueue::new(QueueConfig::default());
        assert!(queue.ready().try_recv().is_err());

        queue.enqueue(event("a.png")).unwrap();
        queue.enqueue(event("b.png")).unwrap();
        assert!(queue.ready().try_recv().is_ok());
        assert!(queue.ready().try_recv().is_err());
    }
}
