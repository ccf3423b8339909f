//! # Upload Relay
//!
//! An event-routing pipeline for file-upload notifications: a topic fans
//! events out to filtered subscriptions, durable queues give each consumer
//! at-least-once delivery with bounded retry, and exhausted messages land in
//! a dead-letter queue.
//!
//! ## Core Concepts
//!
//! - **Topic**: Publish/subscribe fan-out with attribute filters
//! - **Durable queues**: Visibility deadlines, receipts, retry budget, DLQ, optional journal
//! - **Consumers**: Logger, metadata updater, remover, confirmation and rejection notifiers
//! - **Capabilities**: Catalog store and notification sink, with in-memory implementations
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use upload_relay::{MemoryCatalog, MemorySink, Pipeline, PipelineConfig};
//!
//! let catalog = Arc::new(MemoryCatalog::new());
//! let sink = Arc::new(MemorySink::new());
//! let pipeline = Pipeline::new(PipelineConfig::default(), catalog, sink.clone())?;
//!
//! pipeline.ingest(r#"{"Records":[{"eventName":"ObjectCreated:Put",
//!     "s3":{"bucket":{"name":"uploads"},"object":{"key":"photo.png"}}}]}"#)?;
//! pipeline.process_pending()?;
//!
//! assert_eq!(sink.bodies(), vec!["photo.png uploaded"]);
//! ```

pub mod catalog;
pub mod clock;
pub mod config;
pub mod consumers;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod topic;
pub mod types;
pub mod worker;

// Re-exports
pub use catalog::{CatalogChange, CatalogError, CatalogStore, ChangeFeed, MemoryCatalog, PutOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConsumerConfig, MailConfig, PipelineConfig};
pub use consumers::{
    ConfirmationNotifier, Disposition, EventHandler, HandleError, HandleResult, MetadataUpdater,
    PermanentPolicy, RejectionNotifier, UploadLogger, UploadRemover,
};
pub use error::{PipelineError, Result};
pub use notify::{LogSink, MemorySink, Notification, NotificationSink, SinkError};
pub use pipeline::{IngestSummary, Pipeline, ProcessSummary, RunningPipeline};
pub use queue::{
    DeadLetterOrigin, DurableQueue, NackOutcome, QueueConfig, QueueStats, Receipt, ReceivedMessage,
};
pub use source::{
    decode_batch, decode_metadata, decode_metadata_batch, decode_metadata_envelope, DecodeError,
    DecodedBatch,
};
pub use topic::{DeliveryMode, Filter, PublishReport, Topic};
pub use types::{CatalogRecord, Event, EventId, EventKind, MessageId, Timestamp};
pub use worker::{PollSummary, Worker, WorkerHandle};
