//! Event consumers and the failure contract they share with the queues.
//!
//! A handler returns `Ok(())`, a [`HandleError::Transient`] (dependency
//! trouble, retry it) or a [`HandleError::Permanent`] (bad input). What a
//! permanent failure does is each handler's own [`PermanentPolicy`]:
//!
//! | Consumer              | Permanent failure                  |
//! |-----------------------|------------------------------------|
//! | `UploadLogger`        | `Retry`: nack until dead-lettered  |
//! | `MetadataUpdater`     | `Drop`: ack and log                |
//! | `RejectionNotifier`   | `Drop`: ack and log                |
//! | `UploadRemover`       | `Drop`: ack and log                |

mod confirmation;
mod logger;
mod metadata;
mod rejection;
mod remover;

pub use confirmation::{ConfirmationNotifier, CONFIRMATION_SUBJECT};
pub use logger::{file_extension, UploadLogger, ACCEPTED_EXTENSIONS};
pub use metadata::{MetadataUpdater, METADATA_TYPES, METADATA_TYPE_ATTRIBUTE};
pub use rejection::{RejectionNotifier, REJECTION_SUBJECT};
pub use remover::UploadRemover;

use crate::queue::ReceivedMessage;
use crate::types::Event;
use thiserror::Error;

/// Why a handler could not process an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// A dependency failed; the same event may succeed later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The event itself is unusable; retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

pub type HandleResult = Result<(), HandleError>;

/// What to do with a message whose handler reported a permanent failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermanentPolicy {
    /// Nack; the retry budget runs out and the message is dead-lettered.
    Retry,
    /// Ack and drop with a diagnostic.
    Drop,
}

/// Queue action for a handled message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

impl Disposition {
    /// Map a handler result to a queue action.
    pub fn for_result(result: &HandleResult, policy: PermanentPolicy) -> Self {
        match result {
            Ok(()) => Disposition::Ack,
            Err(HandleError::Transient(_)) => Disposition::Nack,
            Err(HandleError::Permanent(_)) => match policy {
                PermanentPolicy::Retry => Disposition::Nack,
                PermanentPolicy::Drop => Disposition::Ack,
            },
        }
    }
}

/// Something that processes events delivered by a topic or a queue.
///
/// Deliveries are at-least-once, so `handle` must tolerate seeing the same
/// event more than once.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, event: &Event) -> HandleResult;

    /// Handle one delivery pulled from a queue.
    fn handle_delivery(&self, message: &ReceivedMessage) -> HandleResult {
        self.handle(&message.event)
    }

    fn permanent_policy(&self) -> PermanentPolicy {
        PermanentPolicy::Retry
    }
}
