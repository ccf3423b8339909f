//! Sends a confirmation once an upload's catalog record is committed.

use crate::catalog::CatalogChange;
use crate::config::MailConfig;
use crate::notify::{Notification, NotificationSink};
use crate::types::CatalogRecord;
use crossbeam_channel::{select, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Subject line of confirmation notifications.
pub const CONFIRMATION_SUBJECT: &str = "Upload confirmed";

/// Reacts to catalog inserts from the change feed.
///
/// Driven by the feed rather than by the upload event, so a confirmation is
/// only sent after the record is queryable. Sink failures are logged and
/// swallowed.
pub struct ConfirmationNotifier {
    sink: Arc<dyn NotificationSink>,
    mail: MailConfig,
}

impl ConfirmationNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>, mail: MailConfig) -> Self {
        Self { sink, mail }
    }

    /// Notify about one committed record. Returns whether a message was sent.
    pub fn handle(&self, record: &CatalogRecord) -> bool {
        let body = format!("{} uploaded", record.key);
        match self
            .sink
            .send(&Notification::from_mail(&self.mail, CONFIRMATION_SUBJECT, body))
        {
            Ok(()) => {
                info!(key = %record.key, to = %self.mail.to, "confirmation sent");
                true
            }
            Err(e) => {
                warn!(key = %record.key, error = %e, "confirmation not sent");
                false
            }
        }
    }

    /// Handle one change; only inserts produce confirmations.
    pub fn on_change(&self, change: &CatalogChange) -> bool {
        match change {
            CatalogChange::Inserted(record) => self.handle(record),
            CatalogChange::Modified(_) | CatalogChange::Removed { .. } => false,
        }
    }

    /// Process every change already waiting. Returns how many were consumed.
    pub fn drain(&self, changes: &Receiver<CatalogChange>) -> usize {
        let mut consumed = 0;
        for change in changes.try_iter() {
            self.on_change(&change);
            consumed += 1;
        }
        consumed
    }

    /// Run on a background thread until `shutdown` fires or the feed closes.
    pub fn spawn(
        self: Arc<Self>,
        changes: Receiver<CatalogChange>,
        shutdown: Receiver<()>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("confirmation-notifier".into())
            .spawn(move || loop {
                select! {
                    recv(shutdown) -> _ => break,
                    recv(changes) -> change => match change {
                        Ok(change) => {
                            self.on_change(&change);
                        }
                        Err(_) => {
                            debug!("catalog change feed closed");
                            break;
                        }
                    },
                }
            })
    }
}
