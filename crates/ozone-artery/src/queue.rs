//! The core's single outbound queue.
//!
//! Every event is expanded into one entry per concrete recipient at enqueue
//! time. A drain cycle groups entries into per-destination batches (each
//! heartbeat travels alone), hands all batches to the delivery function
//! concurrently, and puts back the batches it declines.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use futures_util::FutureExt;
use ozone_core::{Destination, Intent, OutboundEvent};
use tracing::{debug, error, info, warn};

use crate::artery::ArteryMap;
use crate::delivery::Deliver;

/// Entries for one destination, drained together.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    destination: String,
    events: Vec<OutboundEvent>,
}

impl Batch {
    pub fn new(destination: impl Into<String>, events: Vec<OutboundEvent>) -> Self {
        Self {
            destination: destination.into(),
            events,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn events(&self) -> &[OutboundEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Heartbeat batches always hold exactly one event.
    pub fn is_heartbeat(&self) -> bool {
        self.events.first().is_some_and(OutboundEvent::is_heartbeat)
    }

    pub fn intents(&self) -> Vec<Intent> {
        self.events.iter().map(OutboundEvent::to_intent).collect()
    }

    fn into_events(self) -> Vec<OutboundEvent> {
        self.events
    }
}

/// Outcome counts of one drain cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

enum Outcome {
    Delivered,
    Requeued,
    Dropped,
}

pub struct OutboundQueue {
    arteries: Arc<ArteryMap>,
    delivery: Arc<dyn Deliver>,
    entries: Mutex<VecDeque<OutboundEvent>>,
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("arteries", &self.arteries.len())
            .field("entries", &self.len())
            .finish()
    }
}

impl OutboundQueue {
    pub fn new(arteries: Arc<ArteryMap>, delivery: Arc<dyn Deliver>) -> Self {
        Self {
            arteries,
            delivery,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends one entry per recipient of `event` without draining.
    ///
    /// Wildcard events go to every artery except `origin`; an event for a
    /// named peer is kept only when that peer is configured and is not
    /// `origin`. Returns the number of entries added.
    pub fn push(&self, origin: Option<&str>, event: OutboundEvent) -> usize {
        let recipients: Vec<&str> = match &event.destination {
            Destination::All => self
                .arteries
                .names()
                .filter(|name| Some(*name) != origin)
                .collect(),
            Destination::Peer(name) if Some(name.as_str()) == origin => Vec::new(),
            Destination::Peer(name) if self.arteries.contains(name) => vec![name.as_str()],
            Destination::Peer(name) => {
                warn!(peer = %name, intent = %event.intent, "dropping event for unknown peer");
                Vec::new()
            }
        };

        let mut entries = self.lock();
        for recipient in &recipients {
            entries.push_back(event.addressed_to(recipient));
        }
        recipients.len()
    }

    /// Adds `event` and, if anything is queued, runs a drain cycle.
    pub async fn enqueue(&self, origin: Option<&str>, event: OutboundEvent) -> DrainReport {
        let intent = event.intent.clone();
        let heartbeat = event.is_heartbeat();
        let added = self.push(origin, event);
        if !heartbeat {
            info!(%intent, origin = origin.unwrap_or("core"), recipients = added, "event queued");
        }
        if self.is_empty() {
            return DrainReport::default();
        }
        self.drain().await
    }

    /// Takes every queued entry, delivers the resulting batches concurrently
    /// and returns once all of them have an outcome.
    pub async fn drain(&self) -> DrainReport {
        let batches = self.take_batches();
        if batches.is_empty() {
            return DrainReport::default();
        }

        let mut report = DrainReport {
            batches: batches.len(),
            ..DrainReport::default()
        };
        let outcomes = join_all(batches.into_iter().map(|batch| self.deliver_one(batch))).await;
        for outcome in outcomes {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Requeued => report.requeued += 1,
                Outcome::Dropped => report.dropped += 1,
            }
        }
        debug!(?report, "drain cycle finished");
        report
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queued entries, front first.
    pub fn snapshot(&self) -> Vec<OutboundEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Groups the whole queue into batches, newest entry first.
    ///
    /// A non-heartbeat entry is joined by every other non-heartbeat entry
    /// with the same destination, in queue order.
    fn take_batches(&self) -> Vec<Batch> {
        let mut entries = self.lock();
        let mut batches = Vec::new();
        while let Some(current) = entries.pop_back() {
            let destination = current
                .destination
                .as_peer()
                .unwrap_or_default()
                .to_string();
            if current.is_heartbeat() {
                batches.push(Batch::new(destination, vec![current]));
                continue;
            }

            let mut events = vec![current];
            let mut remaining = VecDeque::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if !entry.is_heartbeat() && entry.destination == events[0].destination {
                    events.push(entry);
                } else {
                    remaining.push_back(entry);
                }
            }
            *entries = remaining;
            batches.push(Batch::new(destination, events));
        }
        batches
    }

    async fn deliver_one(&self, batch: Batch) -> Outcome {
        let Some(artery) = self.arteries.get(batch.destination()).cloned() else {
            warn!(peer = %batch.destination(), "no artery for batch destination, dropping");
            return Outcome::Dropped;
        };

        let verdict = AssertUnwindSafe(self.delivery.deliver(&batch, &artery))
            .catch_unwind()
            .await;
        match verdict {
            Ok(Ok(true)) => Outcome::Delivered,
            Ok(Ok(false)) => {
                debug!(peer = %batch.destination(), events = batch.len(), "backlogging batch");
                self.requeue(batch);
                Outcome::Requeued
            }
            Ok(Err(err)) => {
                error!(peer = %batch.destination(), events = batch.len(), %err, "fatal event processing error, dropping batch");
                Outcome::Dropped
            }
            Err(_) => {
                error!(peer = %batch.destination(), events = batch.len(), "delivery panicked, dropping batch");
                Outcome::Dropped
            }
        }
    }

    /// Puts a declined batch back at the front, keeping its order.
    fn requeue(&self, batch: Batch) {
        let mut entries = self.lock();
        for event in batch.into_events().into_iter().rev() {
            entries.push_front(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutboundEvent>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
