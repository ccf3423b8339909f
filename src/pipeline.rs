//! Wires the topic, queues, workers and notifiers into one pipeline.
//!
//! ```text
//! ingest ─► Topic "uploads" ─┬─► [uploads] ──► UploadLogger ──► catalog ─► change feed ─► ConfirmationNotifier
//!                            │        └─ exhausted ─► [uploads-dlq] ─► RejectionNotifier
//!                            ├─► [metadata] ─► MetadataUpdater     (exhausted ─► [metadata-dlq])
//!                            └─► UploadRemover (direct)
//! ```

use crate::catalog::{CatalogChange, CatalogStore};
use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::consumers::{
    ConfirmationNotifier, MetadataUpdater, RejectionNotifier, UploadLogger, UploadRemover,
};
use crate::error::{PipelineError, Result};
use crate::notify::NotificationSink;
use crate::queue::{DurableQueue, QueueConfig};
use crate::source::{decode_batch, decode_metadata_batch, DecodedBatch};
use crate::topic::{Filter, PublishReport, Topic};
use crate::types::{Event, EventKind};
use crate::worker::{PollSummary, Worker, WorkerHandle};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub const TOPIC_NAME: &str = "uploads";
pub const UPLOAD_QUEUE: &str = "uploads";
pub const UPLOAD_DEAD_LETTER_QUEUE: &str = "uploads-dlq";
pub const METADATA_QUEUE: &str = "metadata";
pub const METADATA_DEAD_LETTER_QUEUE: &str = "metadata-dlq";

/// Upper bound on `process_pending` rounds.
const MAX_ROUNDS: usize = 1024;

/// Outcome of feeding one upstream payload into the topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub published: usize,
    /// Subscription matches summed over the published events.
    pub matched: usize,
    /// Queued subscriptions that accepted an event.
    pub queued: usize,
    pub dropped: usize,
    pub skipped: usize,
    /// Subscription deliveries that failed, as `(subscription, reason)`.
    pub failed: Vec<(String, String)>,
}

/// What `process_pending` did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub rounds: usize,
    pub uploads: PollSummary,
    pub metadata: PollSummary,
    pub rejections: PollSummary,
    /// Catalog changes seen by the confirmation notifier.
    pub changes: usize,
}

/// The assembled upload notification pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    topic: Topic,
    upload_queue: Arc<DurableQueue>,
    upload_dead_letter: Arc<DurableQueue>,
    metadata_queue: Arc<DurableQueue>,
    metadata_dead_letter: Arc<DurableQueue>,
    logger: Worker,
    metadata: Worker,
    rejections: Worker,
    confirmation: Arc<ConfirmationNotifier>,
    changes: Receiver<CatalogChange>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        catalog: Arc<dyn CatalogStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        Self::with_clock(config, catalog, sink, Arc::new(SystemClock))
    }

    /// Build the pipeline on the given clock.
    ///
    /// The catalog must publish a change feed; confirmations are driven by it.
    pub fn with_clock(
        config: PipelineConfig,
        catalog: Arc<dyn CatalogStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let changes = catalog.subscribe_changes().ok_or_else(|| {
            PipelineError::Config("catalog store does not publish a change feed".into())
        })?;

        let upload_dead_letter = Arc::new(open_queue(
            &config,
            config.rejection.queue_config(UPLOAD_DEAD_LETTER_QUEUE),
            &clock,
        )?);
        let upload_queue = Arc::new(
            open_queue(&config, config.upload.queue_config(UPLOAD_QUEUE), &clock)?
                .with_dead_letter(Arc::clone(&upload_dead_letter)),
        );
        let metadata_dead_letter = Arc::new(open_queue(
            &config,
            QueueConfig::named(METADATA_DEAD_LETTER_QUEUE),
            &clock,
        )?);
        let metadata_queue = Arc::new(
            open_queue(&config, config.metadata.queue_config(METADATA_QUEUE), &clock)?
                .with_dead_letter(Arc::clone(&metadata_dead_letter)),
        );

        let topic = Topic::new(TOPIC_NAME);
        topic.subscribe_queued(
            "upload-logger",
            Filter::kinds([EventKind::UploadCreated]),
            Arc::clone(&upload_queue),
        )?;
        topic.subscribe_queued(
            "metadata-updater",
            MetadataUpdater::filter(),
            Arc::clone(&metadata_queue),
        )?;
        topic.subscribe_direct(
            "upload-remover",
            UploadRemover::filter(),
            Arc::new(UploadRemover::new(Arc::clone(&catalog))),
        )?;

        let logger = Worker::new(
            Arc::clone(&upload_queue),
            Arc::new(UploadLogger::new(Arc::clone(&catalog))),
            config.upload.batch_size,
        );
        let metadata = Worker::new(
            Arc::clone(&metadata_queue),
            Arc::new(MetadataUpdater::new(Arc::clone(&catalog))),
            config.metadata.batch_size,
        );
        let rejections = Worker::new(
            Arc::clone(&upload_dead_letter),
            Arc::new(RejectionNotifier::new(Arc::clone(&sink), config.mail.clone())),
            config.rejection.batch_size,
        );
        let confirmation = Arc::new(ConfirmationNotifier::new(sink, config.mail.clone()));

        info!(
            topic = TOPIC_NAME,
            subscriptions = topic.subscription_count(),
            journaled = config.journal_dir.is_some(),
            "pipeline assembled"
        );

        Ok(Self {
            config,
            topic,
            upload_queue,
            upload_dead_letter,
            metadata_queue,
            metadata_dead_letter,
            logger,
            metadata,
            rejections,
            confirmation,
            changes,
        })
    }

    // --- Input ---

    /// Decode a storage notification and publish every event in it.
    pub fn ingest(&self, raw: &str) -> Result<IngestSummary> {
        let summary = self.publish_batch(decode_batch(raw)?);
        debug!(
            published = summary.published,
            dropped = summary.dropped,
            skipped = summary.skipped,
            "ingested notification"
        );
        Ok(summary)
    }

    /// Decode one or a batch of metadata notifications and publish them.
    pub fn ingest_metadata(&self, raw: &str) -> Result<IngestSummary> {
        let summary = self.publish_batch(decode_metadata_batch(raw)?);
        debug!(
            published = summary.published,
            dropped = summary.dropped,
            "ingested metadata"
        );
        Ok(summary)
    }

    fn publish_batch(&self, batch: DecodedBatch) -> IngestSummary {
        let mut summary = IngestSummary {
            dropped: batch.dropped,
            skipped: batch.skipped,
            ..Default::default()
        };
        for event in &batch.events {
            let report = self.publish(event);
            summary.published += 1;
            summary.matched += report.matched;
            summary.queued += report.queued;
            summary.failed.extend(report.failed);
        }
        summary
    }

    /// Publish an already-canonical event.
    pub fn publish(&self, event: &Event) -> PublishReport {
        let report = self.topic.publish(event);
        if report.matched == 0 {
            debug!(event_id = %event.id, kind = %event.kind, "no subscription matched");
        }
        report
    }

    // --- Processing ---

    /// Run every consumer on the calling thread until nothing is left to do.
    ///
    /// Messages waiting out a visibility deadline are not waited for.
    pub fn process_pending(&self) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        while summary.rounds < MAX_ROUNDS {
            summary.rounds += 1;
            let uploads = self.logger.poll_once()?;
            let metadata = self.metadata.poll_once()?;
            let changes = self.confirmation.drain(&self.changes);
            let rejections = self.rejections.poll_once()?;

            let idle = uploads.received + metadata.received + rejections.received + changes == 0;
            summary.uploads.merge(&uploads);
            summary.metadata.merge(&metadata);
            summary.rejections.merge(&rejections);
            summary.changes += changes;
            if idle {
                return Ok(summary);
            }
        }
        warn!(rounds = summary.rounds, "processing stopped before the pipeline went idle");
        Ok(summary)
    }

    /// Start a background thread per consumer.
    pub fn start(&self) -> Result<RunningPipeline> {
        let interval = self.config.poll_interval();
        let mut workers = Vec::with_capacity(3);
        for worker in [&self.logger, &self.metadata, &self.rejections] {
            match worker.clone().spawn(interval) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    workers.into_iter().for_each(WorkerHandle::stop);
                    return Err(e.into());
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let confirmation = match Arc::clone(&self.confirmation).spawn(self.changes.clone(), shutdown_rx)
        {
            Ok(join) => join,
            Err(e) => {
                workers.into_iter().for_each(WorkerHandle::stop);
                return Err(e.into());
            }
        };

        info!(workers = workers.len(), "pipeline started");
        Ok(RunningPipeline {
            workers,
            confirmation_shutdown: shutdown_tx,
            confirmation,
        })
    }

    /// Rewrite every queue journal down to its live messages.
    pub fn compact(&self) -> Result<()> {
        for queue in self.queues() {
            queue.compact()?;
        }
        Ok(())
    }

    // --- Accessors ---

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn upload_queue(&self) -> &Arc<DurableQueue> {
        &self.upload_queue
    }

    pub fn upload_dead_letter(&self) -> &Arc<DurableQueue> {
        &self.upload_dead_letter
    }

    pub fn metadata_queue(&self) -> &Arc<DurableQueue> {
        &self.metadata_queue
    }

    /// Exhausted metadata messages, kept for inspection.
    pub fn metadata_dead_letter(&self) -> &Arc<DurableQueue> {
        &self.metadata_dead_letter
    }

    fn queues(&self) -> [&Arc<DurableQueue>; 4] {
        [
            &self.upload_queue,
            &self.upload_dead_letter,
            &self.metadata_queue,
            &self.metadata_dead_letter,
        ]
    }
}

fn open_queue(
    config: &PipelineConfig,
    queue: QueueConfig,
    clock: &Arc<dyn Clock>,
) -> Result<DurableQueue> {
    match &config.journal_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = journal_path(dir, &queue.name);
            DurableQueue::open_journaled(queue, path, Arc::clone(clock))
        }
        None => Ok(DurableQueue::with_clock(queue, Arc::clone(clock))),
    }
}

fn journal_path(dir: &Path, queue: &str) -> std::path::PathBuf {
    dir.join(format!("{queue}.journal"))
}

/// Background threads started by [`Pipeline::start`].
pub struct RunningPipeline {
    workers: Vec<WorkerHandle>,
    confirmation_shutdown: Sender<()>,
    confirmation: JoinHandle<()>,
}

impl RunningPipeline {
    /// Stop every thread, letting in-progress batches finish.
    pub fn shutdown(self) {
        for worker in self.workers {
            worker.stop();
        }
        let _ = self.confirmation_shutdown.send(());
        if self.confirmation.join().is_err() {
            error!("confirmation notifier thread panicked");
        }
        info!("pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::notify::MemorySink;
    use serde_json::json;

    fn upload(event_name: &str, key: &str) -> String {
        json!({
            "Records": [{
                "eventName": event_name,
                "s3": { "bucket": {"name": "uploads"}, "object": {"key": key} }
            }]
        })
        .to_string()
    }

    fn pipeline() -> (Pipeline, Arc<MemoryCatalog>, Arc<MemorySink>) {
        let catalog = Arc::new(MemoryCatalog::new());
        let sink = Arc::new(MemorySink::new());
        let pipeline =
            Pipeline::new(PipelineConfig::default(), catalog.clone(), sink.clone()).unwrap();
        (pipeline, catalog, sink)
    }

    #[test]
    fn test_wiring() {
        let (pipeline, _, _) = pipeline();
        assert_eq!(pipeline.topic().subscription_count(), 3);
        assert_eq!(pipeline.upload_queue().config().max_attempts, 3);
        assert!(pipeline.upload_queue().dead_letter_queue().is_some());
        assert!(pipeline.metadata_queue().dead_letter_queue().is_some());
    }

    #[test]
    fn test_catalog_without_feed_is_rejected() {
        struct NoFeed;
        impl CatalogStore for NoFeed {
            fn put(
                &self,
                _key: &str,
                _fields: &std::collections::BTreeMap<String, String>,
            ) -> std::result::Result<crate::catalog::PutOutcome, crate::catalog::CatalogError> {
                Ok(crate::catalog::PutOutcome::Created)
            }
            fn update(
                &self,
                _key: &str,
                _field: &str,
                _value: &str,
            ) -> std::result::Result<(), crate::catalog::CatalogError> {
                Ok(())
            }
            fn delete(&self, _key: &str) -> std::result::Result<bool, crate::catalog::CatalogError> {
                Ok(false)
            }
            fn get(
                &self,
                _key: &str,
            ) -> std::result::Result<Option<crate::types::CatalogRecord>, crate::catalog::CatalogError>
            {
                Ok(None)
            }
        }

        let result = Pipeline::new(
            PipelineConfig::default(),
            Arc::new(NoFeed),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_ingest_and_process() {
        let (pipeline, catalog, sink) = pipeline();

        let summary = pipeline.ingest(&upload("ObjectCreated:Put", "photo.png")).unwrap();
        assert_eq!(summary.published, 1);
        assert!(summary.failed.is_empty());
        assert_eq!(pipeline.upload_queue().len(), 1);

        let processed = pipeline.process_pending().unwrap();
        assert_eq!(processed.uploads.acked, 1);
        assert_eq!(processed.changes, 1);
        assert!(catalog.get("photo.png").unwrap().is_some());
        assert_eq!(sink.bodies(), vec!["photo.png uploaded".to_string()]);
    }

    #[test]
    fn test_removal_is_direct() {
        let (pipeline, catalog, _) = pipeline();
        pipeline.ingest(&upload("ObjectCreated:Put", "photo.png")).unwrap();
        pipeline.process_pending().unwrap();

        let summary = pipeline.ingest(&upload("ObjectRemoved:Delete", "photo.png")).unwrap();
        assert_eq!(summary.published, 1);
        assert!(catalog.is_empty());
        assert!(pipeline.upload_queue().is_empty());
    }

    #[test]
    fn test_ingest_rejects_garbage() {
        let (pipeline, _, _) = pipeline();
        assert!(matches!(pipeline.ingest("not json"), Err(PipelineError::Decode(_))));
    }

    #[test]
    fn test_journal_files_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            journal_dir: Some(dir.path().join("journals")),
            ..Default::default()
        };
        let _pipeline = Pipeline::new(
            config,
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemorySink::new()),
        )
        .unwrap();

        for queue in [
            UPLOAD_QUEUE,
            UPLOAD_DEAD_LETTER_QUEUE,
            METADATA_QUEUE,
            METADATA_DEAD_LETTER_QUEUE,
        ] {
            assert!(journal_path(&dir.path().join("journals"), queue).exists());
        }
    }
}
