//! Pull loop binding a queue to a handler.

use crate::consumers::{Disposition, EventHandler, HandleError};
use crate::error::{PipelineError, Result};
use crate::queue::{DurableQueue, NackOutcome, ReceivedMessage};
use crate::topic::panic_message;
use crossbeam_channel::{bounded, select, Sender};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What one poll did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Permanent failures acked under a `Drop` policy.
    pub dropped: usize,
    /// Ack or nack arrived after the deadline and had no effect.
    pub stale: usize,
}

impl PollSummary {
    pub(crate) fn merge(&mut self, other: &PollSummary) {
        self.received += other.received;
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.dropped += other.dropped;
        self.stale += other.stale;
    }
}

/// Consumes one queue with one handler.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<DurableQueue>,
    handler: Arc<dyn EventHandler>,
    batch_size: usize,
}

impl Worker {
    pub fn new(queue: Arc<DurableQueue>, handler: Arc<dyn EventHandler>, batch_size: usize) -> Self {
        Self {
            queue,
            handler,
            batch_size: batch_size.max(1),
        }
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    /// Receive one batch and settle every message in it.
    pub fn poll_once(&self) -> Result<PollSummary> {
        let batch = self.queue.receive(self.batch_size)?;
        let mut summary = PollSummary {
            received: batch.len(),
            ..Default::default()
        };
        let policy = self.handler.permanent_policy();
        let mut settle_error = None;

        // A message left unsettled expires and is redelivered
        for message in batch {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.handler.handle_delivery(&message)
            }))
            .unwrap_or_else(|panic| Err(HandleError::Transient(panic_message(panic.as_ref()))));

            match Disposition::for_result(&result, policy) {
                Disposition::Ack => {
                    if let Err(e) = &result {
                        warn!(
                            handler = self.handler.name(),
                            event_id = %message.event.id,
                            error = %e,
                            "dropping message"
                        );
                        summary.dropped += 1;
                    }
                    match self.queue.ack(&message.receipt) {
                        Ok(true) => summary.acked += 1,
                        Ok(false) => summary.stale += 1,
                        Err(e) => self.settle_failed(&message, e, &mut settle_error),
                    }
                }
                Disposition::Nack => {
                    if let Err(e) = &result {
                        debug!(
                            handler = self.handler.name(),
                            event_id = %message.event.id,
                            delivery = message.delivery_count,
                            error = %e,
                            "handler failed"
                        );
                    }
                    match self.queue.nack(&message.receipt) {
                        Ok(NackOutcome::Requeued { .. }) => summary.requeued += 1,
                        Ok(NackOutcome::DeadLettered { .. } | NackOutcome::Discarded) => {
                            summary.dead_lettered += 1
                        }
                        Ok(NackOutcome::Stale) => summary.stale += 1,
                        Err(e) => self.settle_failed(&message, e, &mut settle_error),
                    }
                }
            }
        }

        match settle_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn settle_failed(
        &self,
        message: &ReceivedMessage,
        e: PipelineError,
        first: &mut Option<PipelineError>,
    ) {
        error!(
            handler = self.handler.name(),
            queue = %self.queue.name(),
            event_id = %message.event.id,
            error = %e,
            "could not settle message"
        );
        first.get_or_insert(e);
    }

    /// Poll until a receive comes back empty.
    pub fn drain(&self) -> Result<PollSummary> {
        let mut total = PollSummary::default();
        loop {
            let summary = self.poll_once()?;
            if summary.received == 0 {
                return Ok(total);
            }
            total.merge(&summary);
        }
    }

    /// Run on a background thread until the handle is stopped.
    pub fn spawn(self, poll_interval: Duration) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let name = format!("worker-{}", self.queue.name());

        let join = std::thread::Builder::new().name(name.clone()).spawn(move || {
            info!(worker = %name, "worker started");
            let ready = self.queue.ready().clone();
            loop {
                match self.poll_once() {
                    Ok(summary) if summary.received > 0 => {
                        if shutdown_rx.try_recv().is_ok() {
                            break;
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => error!(worker = %name, error = %e, "poll failed"),
                }

                select! {
                    recv(shutdown_rx) -> _ => break,
                    recv(ready) -> _ => {}
                    default(poll_interval) => {}
                }
            }
            info!(worker = %name, "worker stopped");
        })?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join,
        })
    }
}

/// A running worker thread.
pub struct WorkerHandle {
    shutdown: Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker and wait for it to finish its current batch.
    pub fn stop(self) {
        let _ = self.shutdown.try_send(());
        if self.join.join().is_err() {
            error!("worker thread panicked");
        }
    }
}
