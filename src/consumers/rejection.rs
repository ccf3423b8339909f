//! Tells the owner about uploads that ended up in the dead-letter queue.

use crate::config::MailConfig;
use crate::notify::{Notification, NotificationSink};
use crate::queue::ReceivedMessage;
use crate::types::{Event, EventId, MessageId};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{EventHandler, HandleError, HandleResult, PermanentPolicy};

/// Subject line of rejection notifications.
pub const REJECTION_SUBJECT: &str = "Upload rejected";

/// Recently notified entries remembered for duplicate suppression.
const DEFAULT_RECENT_CAPACITY: usize = 1024;

/// Identity of one dead-letter entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum EntryKey {
    /// The message that exhausted its retries in the source queue.
    Origin { queue: String, message: MessageId },
    /// No provenance; the event id is all there is.
    Event(EventId),
}

/// Consumes the upload dead-letter queue.
///
/// Entries without a subject key are dropped. Redelivered entries that were
/// already notified are acked silently; separately dead-lettered uploads of
/// the same key are each reported.
pub struct RejectionNotifier {
    sink: Arc<dyn NotificationSink>,
    mail: MailConfig,
    recent: Mutex<LruCache<EntryKey, ()>>,
}

impl RejectionNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>, mail: MailConfig) -> Self {
        Self::with_recent_capacity(sink, mail, DEFAULT_RECENT_CAPACITY)
    }

    pub fn with_recent_capacity(
        sink: Arc<dyn NotificationSink>,
        mail: MailConfig,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sink,
            mail,
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn notify(&self, event: &Event, entry: EntryKey) -> HandleResult {
        let key = event.subject_key.trim();
        if key.is_empty() {
            warn!(event_id = %event.id, "dead-letter entry has no subject key, dropping");
            return Err(HandleError::Permanent("dead-letter entry has no subject key".into()));
        }

        if self.recent.lock().contains(&entry) {
            debug!(event_id = %event.id, key, "rejection already sent");
            return Ok(());
        }

        let body = format!("{key} rejected");
        match self
            .sink
            .send(&Notification::from_mail(&self.mail, REJECTION_SUBJECT, body))
        {
            Ok(()) => {
                self.recent.lock().put(entry, ());
                info!(key, to = %self.mail.to, "rejection sent");
            }
            Err(e) => warn!(key, error = %e, "rejection not sent"),
        }
        Ok(())
    }
}

impl EventHandler for RejectionNotifier {
    fn name(&self) -> &str {
        "rejection-notifier"
    }

    fn handle(&self, event: &Event) -> HandleResult {
        self.notify(event, EntryKey::Event(event.id.clone()))
    }

    fn handle_delivery(&self, message: &ReceivedMessage) -> HandleResult {
        let entry = match &message.origin {
            Some(origin) => EntryKey::Origin {
                queue: origin.source_queue.clone(),
                message: origin.source_message,
            },
            None => EntryKey::Event(message.event.id.clone()),
        };
        self.notify(&message.event, entry)
    }

    fn permanent_policy(&self) -> PermanentPolicy {
        PermanentPolicy::Drop
    }
}
