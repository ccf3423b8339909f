//! Error handling and edge case tests.

use std::sync::Arc;
use std::time::Duration;
use upload_relay::{
    decode_batch, DecodeError, DurableQueue, Event, EventId, EventKind, Filter, ManualClock,
    MemoryCatalog, MemorySink, NackOutcome, Pipeline, PipelineConfig, PipelineError, QueueConfig,
    Timestamp, Topic,
};

fn event(key: &str) -> Event {
    Event::new(EventId::new(format!("e-{key}")), EventKind::UploadCreated, key)
}

fn queue_pair(clock: Arc<ManualClock>) -> (Arc<DurableQueue>, Arc<DurableQueue>) {
    let dlq = Arc::new(DurableQueue::with_clock(QueueConfig::named("dlq"), clock.clone()));
    let queue = Arc::new(
        DurableQueue::with_clock(
            QueueConfig {
                name: "uploads".into(),
                max_attempts: 2,
                visibility_timeout: Duration::from_secs(30),
            },
            clock,
        )
        .with_dead_letter(dlq.clone()),
    );
    (queue, dlq)
}

// --- Receipts ---

#[test]
fn test_stale_receipt_after_dead_letter() {
    let clock = Arc::new(ManualClock::new(Timestamp(0)));
    let (queue, dlq) = queue_pair(clock);
    queue.enqueue(event("doc.pdf")).unwrap();

    let first = queue.receive(1).unwrap().remove(0);
    assert!(matches!(
        queue.nack(&first.receipt).unwrap(),
        NackOutcome::Requeued { delivery_count: 1 }
    ));

    let second = queue.receive(1).unwrap().remove(0);
    assert_eq!(second.delivery_count, 2);
    assert!(matches!(
        queue.nack(&second.receipt).unwrap(),
        NackOutcome::DeadLettered { .. }
    ));

    assert!(!queue.ack(&second.receipt).unwrap());
    assert!(!queue.ack(&first.receipt).unwrap());
    assert_eq!(queue.nack(&second.receipt).unwrap(), NackOutcome::Stale);
    assert!(queue.is_empty());
    assert_eq!(dlq.len(), 1);
}

#[test]
fn test_expired_receipt_cannot_ack_redelivery() {
    let clock = Arc::new(ManualClock::new(Timestamp(0)));
    let (queue, _dlq) = queue_pair(clock.clone());
    queue.enqueue(event("photo.png")).unwrap();

    let first = queue.receive(1).unwrap().remove(0);
    clock.advance(Duration::from_secs(31));
    let second = queue.receive(1).unwrap().remove(0);
    assert_eq!(second.delivery_count, 2);

    // The slow first holder finishes late
    assert!(!queue.ack(&first.receipt).unwrap());
    assert_eq!(queue.in_flight_len(), 1);
    assert!(queue.ack(&second.receipt).unwrap());
    assert!(queue.is_empty());
}

#[test]
fn test_dead_letter_origin() {
    let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
    let (queue, dlq) = queue_pair(clock.clone());
    let original = event("doc.pdf");
    queue.enqueue(original.clone()).unwrap();

    for _ in 0..2 {
        let msg = queue.receive(1).unwrap().remove(0);
        clock.advance(Duration::from_secs(1));
        queue.nack(&msg.receipt).unwrap();
    }

    let dead = dlq.receive(1).unwrap().remove(0);
    assert_eq!(dead.event, original);
    assert_eq!(dead.delivery_count, 1);
    let origin = dead.origin.unwrap();
    assert_eq!(origin.source_queue, "uploads");
    assert_eq!(origin.final_delivery_count, 2);
    assert_eq!(origin.dead_lettered_at, Timestamp(1_000 + 2_000_000));
    assert_eq!(queue.stats().dead_lettered, 1);
}

#[test]
fn test_exhausted_without_dead_letter_is_discarded() {
    let queue = DurableQueue::new(QueueConfig {
        name: "lonely".into(),
        max_attempts: 1,
        visibility_timeout: Duration::from_secs(30),
    });
    queue.enqueue(event("x.png")).unwrap();

    let msg = queue.receive(1).unwrap().remove(0);
    assert_eq!(queue.nack(&msg.receipt).unwrap(), NackOutcome::Discarded);
    assert!(queue.is_empty());
    assert_eq!(queue.stats().discarded, 1);
}

// --- Topic ---

#[test]
fn test_duplicate_subscription_rejected() {
    let topic = Topic::new("uploads");
    let queue = Arc::new(DurableQueue::new(QueueConfig::named("q")));
    topic.subscribe_queued("logger", Filter::all(), queue.clone()).unwrap();

    let result = topic.subscribe_queued("logger", Filter::all(), queue);
    assert!(matches!(result, Err(PipelineError::SubscriptionExists(name)) if name == "logger"));
    assert_eq!(topic.subscription_count(), 1);
}

#[test]
fn test_missing_attribute_never_matches() {
    let topic = Topic::new("uploads");
    let queue = Arc::new(DurableQueue::new(QueueConfig::named("q")));
    topic
        .subscribe_queued("metadata", Filter::attribute_in("metadata_type", ["Caption"]), queue.clone())
        .unwrap();

    let report = topic.publish(&event("photo.png"));
    assert_eq!(report.matched, 0);
    assert!(queue.is_empty());
}

// --- Configuration ---

#[test]
fn test_invalid_config_rejected() {
    let result = PipelineConfig::from_json(r#"{"upload": {"max_attempts": 0}}"#);
    assert!(matches!(result, Err(PipelineError::Config(_))));

    let result = PipelineConfig::from_json(r#"{"metadata": {"batch_size": 0}}"#);
    assert!(matches!(result, Err(PipelineError::Config(_))));

    let result = PipelineConfig::from_json("not json");
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_pipeline_validates_config() {
    let mut config = PipelineConfig::default();
    config.mail.to = " ".into();

    let result = Pipeline::new(config, Arc::new(MemoryCatalog::new()), Arc::new(MemorySink::new()));
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_pipeline_rejects_zero_visibility_timeout() {
    let mut config = PipelineConfig::default();
    config.upload.visibility_timeout_secs = 0;

    let result = Pipeline::new(config, Arc::new(MemoryCatalog::new()), Arc::new(MemorySink::new()));
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = PipelineConfig::from_file(dir.path().join("absent.json"));
    assert!(matches!(result, Err(PipelineError::Io(_))));
}

// --- Decoding ---

#[test]
fn test_undecodable_input() {
    assert!(matches!(decode_batch(""), Err(DecodeError::InvalidJson(_))));
    assert_eq!(decode_batch("[]"), Err(DecodeError::UnrecognizedEnvelope));

    let batch = decode_batch(r#"{"Records": []}"#).unwrap();
    assert!(batch.events.is_empty());
    assert_eq!(batch.dropped, 0);
}

// --- Notifications ---

#[test]
fn test_sink_outage_does_not_redeliver() {
    let catalog = Arc::new(MemoryCatalog::new());
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(2);
    let pipeline = Pipeline::new(PipelineConfig::default(), catalog.clone(), sink.clone()).unwrap();

    pipeline
        .ingest(r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"b"},"object":{"key":"a.png"}}}]}"#)
        .unwrap();
    pipeline
        .ingest(r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"b"},"object":{"key":"b.txt"}}}]}"#)
        .unwrap();
    let summary = pipeline.process_pending().unwrap();

    assert_eq!(summary.uploads.acked, 1);
    assert_eq!(summary.rejections.acked, 1);
    assert_eq!(summary.rejections.requeued, 0);
    assert!(sink.sent().is_empty());
    assert!(pipeline.upload_dead_letter().is_empty());
}
