//! Bounded FIFO of events awaiting delivery
//!
//! Events are validated and stamped with the visitor id on the caller's
//! thread, then appended at the tail. The delivery worker takes batches from
//! the head and puts them back at the head when a send must be retried, so
//! enqueue order is never lost. When the queue is full the oldest entry is
//! dropped to make room.

use crate::error::{Error, Result};
use crate::identity::VisitorIdentityStore;
use crate::types::{dedup_keys, Event, Properties};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Receives the delivery outcome of one event, exactly once
pub type CompletionHandler = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Computes extra properties for a collection at enqueue time
pub type OverridesFn = Arc<dyn Fn(&str) -> Vec<(String, serde_json::Value)> + Send + Sync>;

const SHUTDOWN_MESSAGE: &str = "client shut down before delivery";

/// Properties merged into every keyed event.
///
/// The callback's pairs win over `fixed`; the caller's own keys win over
/// both. Positional events are left untouched since their slots are
/// defined by the collection schema.
#[derive(Clone, Default)]
pub struct PropertyOverrides {
    pub fixed: Vec<(String, serde_json::Value)>,
    pub dynamic: Option<OverridesFn>,
}

impl PropertyOverrides {
    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty() && self.dynamic.is_none()
    }

    fn for_collection(&self, collection_name: &str) -> Vec<(String, serde_json::Value)> {
        let mut merged = self.fixed.clone();
        if let Some(dynamic) = &self.dynamic {
            match catch_unwind(AssertUnwindSafe(|| dynamic(collection_name))) {
                Ok(extra) => merged.extend(extra),
                Err(_) => {
                    tracing::error!(collection = %collection_name, "Property overrides callback panicked");
                }
            }
        }
        dedup_keys(merged)
    }

    fn apply(&self, collection_name: &str, properties: Properties) -> Properties {
        match properties {
            Properties::Keyed(pairs) => {
                let mut merged = dedup_keys(pairs);
                if !self.is_empty() {
                    for (key, value) in self.for_collection(collection_name) {
                        if !merged.iter().any(|(k, _)| *k == key) {
                            merged.push((key, value));
                        }
                    }
                }
                Properties::Keyed(merged)
            }
            positional => positional,
        }
    }
}

impl std::fmt::Debug for PropertyOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyOverrides")
            .field("fixed", &self.fixed)
            .field("dynamic", &self.dynamic.is_some())
            .finish()
    }
}

/// An event waiting in the queue
pub struct QueueEntry {
    pub event: Event,
    /// Sends attempted so far
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    completion: Option<CompletionHandler>,
}

impl QueueEntry {
    fn new(event: Event, completion: Option<CompletionHandler>) -> Self {
        Self {
            event,
            attempt_count: 0,
            enqueued_at: Utc::now(),
            completion,
        }
    }

    /// Hand the outcome to the completion handler, if one is attached.
    ///
    /// A panicking handler is logged and swallowed.
    pub(crate) fn resolve(mut self, outcome: Result<()>) {
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: Result<()>) {
        if let Some(handler) = self.completion.take() {
            if catch_unwind(AssertUnwindSafe(move || handler(outcome))).is_err() {
                tracing::error!(
                    collection = %self.event.collection_name,
                    "Completion handler panicked"
                );
            }
        }
    }
}

/// An entry discarded without an outcome (teardown, a cancelled send)
/// still reports to its handler.
impl Drop for QueueEntry {
    fn drop(&mut self) {
        if self.completion.is_some() {
            self.complete(Err(Error::transient(SHUTDOWN_MESSAGE)));
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("event", &self.event)
            .field("attempt_count", &self.attempt_count)
            .field("enqueued_at", &self.enqueued_at)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

/// Queue and delivery counters
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    evicted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    /// Events accepted into the queue
    pub enqueued: u64,
    /// Events dropped because the queue was full
    pub evicted: u64,
    /// Events acknowledged by the endpoint
    pub delivered: u64,
    /// Events discarded after a permanent failure or exhausted retries
    pub failed: u64,
}

impl QueueStats {
    pub(crate) fn record_delivered(&self, count: usize) {
        self.delivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, count: usize) {
        self.failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Ordered, bounded buffer of pending events for one client
pub struct EventQueue {
    identity: Arc<VisitorIdentityStore>,
    entries: Mutex<VecDeque<QueueEntry>>,
    capacity: usize,
    overrides: PropertyOverrides,
    closed: AtomicBool,
    notify: Notify,
    stats: QueueStats,
}

impl EventQueue {
    pub fn new(identity: Arc<VisitorIdentityStore>, capacity: usize) -> Self {
        Self {
            identity,
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            overrides: PropertyOverrides::default(),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            stats: QueueStats::default(),
        }
    }

    /// Merge `overrides` into every event queued from now on
    pub fn with_overrides(mut self, overrides: PropertyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Validate, stamp and enqueue keyed properties for `collection_name`
    pub fn add_event(&self, properties: Properties, collection_name: &str) -> Result<()> {
        self.add_event_with_completion(properties, collection_name, None)
    }

    pub fn add_event_with_completion(
        &self,
        properties: Properties,
        collection_name: &str,
        completion: Option<CompletionHandler>,
    ) -> Result<()> {
        validate(collection_name, &properties)?;
        let properties = self.overrides.apply(collection_name, properties);

        let lookup = self.identity.visitor_id();
        if let Some(e) = &lookup.error {
            tracing::warn!(error = %e, "Stamping event with in-memory visitor id");
        }

        let event = Event {
            collection_name: collection_name.to_string(),
            properties,
            visitor_id: lookup.visitor_id,
            created_at: Utc::now(),
        };
        self.push(event, completion);
        Ok(())
    }

    /// Enqueue positional values matching the collection's schema
    pub fn track(&self, collection_name: &str, values: Vec<serde_json::Value>) -> Result<()> {
        self.add_event(Properties::Positional(values), collection_name)
    }

    pub fn track_with_completion(
        &self,
        collection_name: &str,
        values: Vec<serde_json::Value>,
        completion: Option<CompletionHandler>,
    ) -> Result<()> {
        self.add_event_with_completion(Properties::Positional(values), collection_name, completion)
    }

    fn push(&self, event: Event, completion: Option<CompletionHandler>) {
        let collection = event.collection_name.clone();
        let entry = QueueEntry::new(event, completion);
        let evicted = {
            let mut entries = self.entries.lock();
            if self.is_closed() {
                drop(entries);
                tracing::debug!(collection = %collection, "Event rejected, queue closed");
                entry.resolve(Err(Error::transient(SHUTDOWN_MESSAGE)));
                return;
            }
            entries.push_back(entry);
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            self.trim_locked(&mut entries)
        };
        tracing::trace!(collection = %collection, "Event enqueued");
        self.resolve_evicted(evicted);
        self.notify.notify_one();
    }

    /// Drop the oldest entries until the queue fits its capacity
    fn trim_locked(&self, entries: &mut VecDeque<QueueEntry>) -> Vec<QueueEntry> {
        let mut evicted = Vec::new();
        while entries.len() > self.capacity {
            if let Some(oldest) = entries.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    fn resolve_evicted(&self, evicted: Vec<QueueEntry>) {
        if evicted.is_empty() {
            return;
        }
        self.stats
            .evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        tracing::warn!(
            evicted = evicted.len(),
            capacity = self.capacity,
            "Event queue full, dropped oldest events"
        );
        for entry in evicted {
            let collection = entry.event.collection_name.clone();
            entry.resolve(Err(Error::Evicted { collection }));
        }
    }

    /// Remove up to `max` entries from the head.
    ///
    /// A batch never spans two visitor ids.
    pub(crate) fn take_batch(&self, max: usize) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock();
        let mut batch: Vec<QueueEntry> = Vec::with_capacity(max.min(entries.len()));
        while batch.len() < max {
            let same_visitor = match (entries.front(), batch.first()) {
                (None, _) => break,
                (Some(_), None) => true,
                (Some(next), Some(first)) => next.event.visitor_id == first.event.visitor_id,
            };
            if !same_visitor {
                break;
            }
            if let Some(entry) = entries.pop_front() {
                batch.push(entry);
            }
        }
        batch
    }

    /// Put a batch back at the head, preserving its order.
    ///
    /// Returns how many of the batch's entries are still queued; a queue
    /// that filled up meanwhile evicts from the head, i.e. from the batch.
    pub(crate) fn requeue_front(&self, batch: Vec<QueueEntry>) -> usize {
        let len = batch.len();
        let mut entries = self.entries.lock();
        if self.is_closed() {
            drop(entries);
            for entry in batch {
                entry.resolve(Err(Error::transient(SHUTDOWN_MESSAGE)));
            }
            return 0;
        }
        for entry in batch.into_iter().rev() {
            entries.push_front(entry);
        }
        let evicted = self.trim_locked(&mut entries);
        drop(entries);

        let surviving = len - evicted.len().min(len);
        self.resolve_evicted(evicted);
        surviving
    }

    /// Refuse further entries and fail every pending handler.
    ///
    /// Returns the number of entries discarded.
    pub(crate) fn close(&self) -> usize {
        let drained: Vec<QueueEntry> = {
            let mut entries = self.entries.lock();
            self.closed.store(true, Ordering::SeqCst);
            entries.drain(..).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.resolve(Err(Error::transient(SHUTDOWN_MESSAGE)));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Restore previously persisted events ahead of anything queued later
    pub(crate) fn restore(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        let evicted = {
            let mut entries = self.entries.lock();
            for event in events.into_iter().rev() {
                entries.push_front(QueueEntry::new(event, None));
            }
            self.trim_locked(&mut entries)
        };
        tracing::info!(count, "Restored unsent events");
        self.resolve_evicted(evicted);
        self.notify.notify_one();
    }

    /// Copy of every queued event, head first
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Wait until something is enqueued
    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

fn validate(collection_name: &str, properties: &Properties) -> Result<()> {
    if collection_name.trim().is_empty() {
        return Err(Error::Validation(
            "collection name must not be empty".to_string(),
        ));
    }
    if properties.is_empty() {
        return Err(Error::Validation(format!(
            "event for collection '{}' has no properties",
            collection_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::mpsc;

    fn make_queue(capacity: usize) -> EventQueue {
        let identity = Arc::new(VisitorIdentityStore::new(Arc::new(MemoryStore::new())));
        EventQueue::new(identity, capacity)
    }

    fn props(n: i64) -> Properties {
        Properties::keyed([("n", n)])
    }

    #[test]
    fn test_add_event_grows_queue_by_one() {
        let queue = make_queue(10);
        queue.add_event(props(1), "purchases").unwrap();
        assert_eq!(queue.len(), 1);
        queue.add_event(props(2), "purchases").unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().snapshot().enqueued, 2);
    }

    #[test]
    fn test_empty_collection_is_rejected_without_mutation() {
        let queue = make_queue(10);
        let err = queue.add_event(props(1), "").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(queue.add_event(props(1), "   ").is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_properties_are_rejected() {
        let queue = make_queue(10);
        assert!(matches!(
            queue.add_event(Properties::Keyed(vec![]), "views"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            queue.track("views", vec![]),
            Err(Error::Validation(_))
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_events_are_stamped_with_visitor_id() {
        let identity = Arc::new(VisitorIdentityStore::new(Arc::new(MemoryStore::new())));
        let queue = EventQueue::new(identity.clone(), 10);
        queue.track("checkout", vec![json!("sku-1"), json!(2)]).unwrap();

        let events = queue.snapshot();
        assert_eq!(events[0].visitor_id, identity.try_visitor_id().unwrap());
        assert_eq!(
            events[0].properties,
            Properties::Positional(vec![json!("sku-1"), json!(2)])
        );
    }

    #[test]
    fn test_overflow_drops_oldest_and_reports_it() {
        let queue = make_queue(2);
        let (tx, rx) = mpsc::channel();
        queue
            .add_event_with_completion(
                props(1),
                "views",
                Some(Box::new(move |outcome| {
                    tx.send(outcome).unwrap();
                })),
            )
            .unwrap();
        queue.add_event(props(2), "views").unwrap();
        queue.add_event(props(3), "views").unwrap();

        assert_eq!(queue.len(), 2);
        let remaining: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|e| e.properties)
            .collect();
        assert_eq!(remaining, vec![props(2), props(3)]);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Evicted { .. })));
        assert_eq!(queue.stats().snapshot().evicted, 1);
    }

    #[test]
    fn test_take_and_requeue_preserve_order() {
        let queue = make_queue(10);
        for n in 0..5 {
            queue.add_event(props(n), "views").unwrap();
        }

        let batch = queue.take_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.requeue_front(batch), 3);
        let order: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|e| e.properties)
            .collect();
        assert_eq!(order, (0..5).map(props).collect::<Vec<_>>());
    }

    #[test]
    fn test_batch_stops_at_visitor_change() {
        let queue = make_queue(10);
        queue.add_event(props(1), "views").unwrap();
        let mut foreign = queue.snapshot().remove(0);
        foreign.visitor_id = uuid::Uuid::new_v4();
        queue.restore(vec![foreign]);

        let first = queue.take_batch(10);
        assert_eq!(first.len(), 1);
        let second = queue.take_batch(10);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].event.visitor_id, second[0].event.visitor_id);
    }

    #[test]
    fn test_panicking_completion_is_contained() {
        let queue = make_queue(1);
        queue
            .add_event_with_completion(
                props(1),
                "views",
                Some(Box::new(|_| panic!("handler bug"))),
            )
            .unwrap();
        // evicts the first entry, whose handler panics
        queue.add_event(props(2), "views").unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_requeue_reports_entries_lost_to_a_full_queue() {
        let queue = make_queue(3);
        for n in 0..3 {
            queue.add_event(props(n), "views").unwrap();
        }
        let batch = queue.take_batch(2);
        queue.add_event(props(3), "views").unwrap();
        queue.add_event(props(4), "views").unwrap();

        // 2 requeued + 3 queued, capacity 3: the head of the batch goes
        assert_eq!(queue.requeue_front(batch), 0);
        let order: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|e| e.properties)
            .collect();
        assert_eq!(order, vec![props(2), props(3), props(4)]);

        let batch = queue.take_batch(2);
        queue.add_event(props(5), "views").unwrap();
        assert_eq!(queue.requeue_front(batch), 1);
        let order: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|e| e.properties)
            .collect();
        assert_eq!(order, vec![props(3), props(4), props(5)]);
    }

    #[test]
    fn test_close_fails_pending_and_later_handlers() {
        let queue = make_queue(10);
        let (tx, rx) = mpsc::channel();
        for n in 0..3 {
            let tx = tx.clone();
            queue
                .add_event_with_completion(
                    props(n),
                    "views",
                    Some(Box::new(move |outcome| {
                        tx.send(outcome).unwrap();
                    })),
                )
                .unwrap();
        }
        let in_flight = queue.take_batch(1);

        assert_eq!(queue.close(), 2);
        assert!(queue.is_empty());

        let late = tx.clone();
        queue
            .add_event_with_completion(
                props(9),
                "views",
                Some(Box::new(move |outcome| {
                    late.send(outcome).unwrap();
                })),
            )
            .unwrap();
        assert_eq!(queue.requeue_front(in_flight), 0);
        assert!(queue.is_empty());

        drop(tx);
        let outcomes: Vec<_> = rx.iter().collect();
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome, Err(e) if e.is_transient())));
    }

    #[test]
    fn test_dropped_entry_still_reports() {
        let queue = make_queue(10);
        let (tx, rx) = mpsc::channel();
        queue
            .add_event_with_completion(
                props(1),
                "views",
                Some(Box::new(move |outcome| {
                    tx.send(outcome).unwrap();
                })),
            )
            .unwrap();

        drop(queue.take_batch(1));
        let outcome = rx.try_recv().unwrap();
        assert!(matches!(outcome, Err(e) if e.is_transient()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_overrides_fill_in_without_replacing_caller_keys() {
        let identity = Arc::new(VisitorIdentityStore::new(Arc::new(MemoryStore::new())));
        let overrides = PropertyOverrides {
            fixed: vec![
                ("app".to_string(), json!("web")),
                ("plan".to_string(), json!("free")),
            ],
            dynamic: Some(Arc::new(|collection: &str| {
                vec![
                    ("source".to_string(), json!(collection)),
                    ("app".to_string(), json!("web-beta")),
                ]
            })),
        };
        let queue = EventQueue::new(identity, 10).with_overrides(overrides);

        queue
            .add_event(Properties::keyed([("plan", "pro")]), "signups")
            .unwrap();
        queue.track("signups", vec![json!("pro")]).unwrap();

        let events = queue.snapshot();
        assert_eq!(
            events[0].properties,
            Properties::Keyed(vec![
                ("plan".to_string(), json!("pro")),
                ("app".to_string(), json!("web-beta")),
                ("source".to_string(), json!("signups")),
            ])
        );
        assert_eq!(events[1].properties, Properties::Positional(vec![json!("pro")]));
    }

    #[test]
    fn test_panicking_overrides_callback_keeps_fixed_properties() {
        let identity = Arc::new(VisitorIdentityStore::new(Arc::new(MemoryStore::new())));
        let overrides = PropertyOverrides {
            fixed: vec![("app".to_string(), json!("web"))],
            dynamic: Some(Arc::new(|_: &str| -> Vec<(String, serde_json::Value)> {
                panic!("callback bug")
            })),
        };
        let queue = EventQueue::new(identity, 10).with_overrides(overrides);

        queue.add_event(props(1), "views").unwrap();
        assert_eq!(
            queue.snapshot()[0].properties,
            Properties::Keyed(vec![
                ("n".to_string(), json!(1)),
                ("app".to_string(), json!("web")),
            ])
        );
    }

    #[test]
    fn test_duplicate_keys_collapse_before_queueing() {
        let queue = make_queue(10);
        let duplicated = Properties::Keyed(vec![
            ("plan".to_string(), json!("free")),
            ("seats".to_string(), json!(1)),
            ("plan".to_string(), json!("pro")),
        ]);
        queue.add_event(duplicated, "signups").unwrap();

        assert_eq!(
            queue.snapshot()[0].properties,
            Properties::Keyed(vec![
                ("plan".to_string(), json!("pro")),
                ("seats".to_string(), json!(1)),
            ])
        );
    }
}
