//! Fan-out bus delivering events to matching subscriptions.

use crate::consumers::{EventHandler, HandleError};
use crate::error::{PipelineError, Result};
use crate::queue::DurableQueue;
use crate::types::Event;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use super::filter::Filter;

/// How a subscription receives events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The handler is invoked during `publish`.
    Direct,
    /// The event is enqueued for a pulling worker.
    Queued,
}

#[derive(Clone)]
enum Target {
    Direct(Arc<dyn EventHandler>),
    Queued(Arc<DurableQueue>),
}

/// Internal subscription state.
#[derive(Clone)]
struct Subscription {
    name: String,
    filter: Filter,
    target: Target,
}

impl Subscription {
    fn mode(&self) -> DeliveryMode {
        match self.target {
            Target::Direct(_) => DeliveryMode::Direct,
            Target::Queued(_) => DeliveryMode::Queued,
        }
    }
}

/// What happened to one published event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscriptions whose filter matched.
    pub matched: usize,
    /// Queued subscriptions that accepted the event.
    pub queued: usize,
    /// Direct subscriptions whose handler succeeded.
    pub delivered: usize,
    /// `(subscription, reason)` for every failed delivery.
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Publish/subscribe topic.
///
/// Subscriptions are registered at startup. Each delivery is independent:
/// direct handlers run concurrently and one handler's error or panic does not
/// affect the others.
pub struct Topic {
    name: String,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe a handler invoked during `publish`.
    pub fn subscribe_direct(
        &self,
        name: impl Into<String>,
        filter: Filter,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.add(name.into(), filter, Target::Direct(handler))
    }

    /// Subscribe a queue that matching events are enqueued into.
    pub fn subscribe_queued(
        &self,
        name: impl Into<String>,
        filter: Filter,
        queue: Arc<DurableQueue>,
    ) -> Result<()> {
        self.add(name.into(), filter, Target::Queued(queue))
    }

    fn add(&self, name: String, filter: Filter, target: Target) -> Result<()> {
        let mut subs = self.subscriptions.write();
        if subs.iter().any(|s| s.name == name) {
            return Err(PipelineError::SubscriptionExists(name));
        }
        debug!(topic = %self.name, subscription = %name, "subscribed");
        subs.push(Subscription {
            name,
            filter,
            target,
        });
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Names and delivery modes of all subscriptions.
    pub fn subscriptions(&self) -> Vec<(String, DeliveryMode)> {
        self.subscriptions
            .read()
            .iter()
            .map(|s| (s.name.clone(), s.mode()))
            .collect()
    }

    // --- Publishing ---

    /// Deliver `event` to every subscription whose filter matches.
    pub fn publish(&self, event: &Event) -> PublishReport {
        let matching: Vec<Subscription> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.filter.matches(&event.attributes))
            .cloned()
            .collect();

        let mut report = PublishReport {
            matched: matching.len(),
            ..Default::default()
        };
        let mut direct = Vec::new();

        for sub in matching {
            match sub.target {
                Target::Queued(queue) => match queue.enqueue(event.clone()) {
                    Ok(_) => report.queued += 1,
                    Err(e) => {
                        warn!(topic = %self.name, subscription = %sub.name, error = %e, "enqueue failed");
                        report.failed.push((sub.name, e.to_string()));
                    }
                },
                Target::Direct(handler) => direct.push((sub.name, handler)),
            }
        }

        for (name, outcome) in Self::deliver_direct(event, direct) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    warn!(topic = %self.name, subscription = %name, event_id = %event.id, %reason, "direct delivery failed");
                    report.failed.push((name, reason));
                }
            }
        }

        debug!(
            topic = %self.name,
            event_id = %event.id,
            matched = report.matched,
            failed = report.failed.len(),
            "published"
        );
        report
    }

    /// Run direct handlers side by side, isolating errors and panics.
    fn deliver_direct(
        event: &Event,
        handlers: Vec<(String, Arc<dyn EventHandler>)>,
    ) -> Vec<(String, std::result::Result<(), String>)> {
        if handlers.len() <= 1 {
            return handlers
                .into_iter()
                .map(|(name, handler)| (name, Self::invoke(handler.as_ref(), event)))
                .collect();
        }

        std::thread::scope(|s| {
            let running: Vec<_> = handlers
                .into_iter()
                .map(|(name, handler)| {
                    let join = s.spawn(move || Self::invoke(handler.as_ref(), event));
                    (name, join)
                })
                .collect();

            running
                .into_iter()
                .map(|(name, join)| {
                    let outcome = join
                        .join()
                        .unwrap_or_else(|_| Err("handler thread panicked".to_string()));
                    (name, outcome)
                })
                .collect()
        })
    }

    fn invoke(handler: &dyn EventHandler, event: &Event) -> std::result::Result<(), String> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(HandleError::Transient(msg))) => Err(format!("transient: {msg}")),
            Ok(Err(HandleError::Permanent(msg))) => Err(format!("permanent: {msg}")),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
