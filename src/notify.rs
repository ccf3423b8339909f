//! Notification sink capability.
//!
//! Notifications are best-effort: callers log a [`SinkError`] and move on.

use crate::config::MailConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::info;

/// Errors from a notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("Notification rejected: {0}")]
    Rejected(String),

    #[error("Notification sink unavailable: {0}")]
    Unavailable(String),
}

/// Delivers human-facing messages (email in production).
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// One human-facing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Address a message with the configured sender and recipient.
    pub fn from_mail(mail: &MailConfig, subject: &str, body: impl Into<String>) -> Self {
        Self {
            from: mail.from.clone(),
            to: mail.to.clone(),
            subject: subject.to_string(),
            body: body.into(),
        }
    }
}

/// Keeps sent notifications in memory.
#[derive(Default)]
pub struct MemorySink {
    outbox: Mutex<Vec<Notification>>,
    failing_sends: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<Notification> {
        self.outbox.lock().clone()
    }

    /// Bodies of everything sent so far.
    pub fn bodies(&self) -> Vec<String> {
        self.outbox.lock().iter().map(|n| n.body.clone()).collect()
    }
}

impl NotificationSink for MemorySink {
    fn send(&self, notification: &Notification) -> Result<(), SinkError> {
        let tripped = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(SinkError::Unavailable("injected send failure".into()));
        }

        self.outbox.lock().push(notification.clone());
        Ok(())
    }
}

/// Writes notifications to the log instead of sending them.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn send(&self, notification: &Notification) -> Result<(), SinkError> {
        info!(
            from = %notification.from,
            to = %notification.to,
            subject = %notification.subject,
            body = %notification.body,
            "notification"
        );
        Ok(())
    }
}
