//! Per-table fan-out of change events to filtered subscribers.
//!
//! Each subscriber owns a bounded channel that buffers up to `capacity`
//! events. A subscriber that falls that far behind is dropped: its stream
//! ends, which the coordinator treats as a lost channel and resyncs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{ChangeEvent, ChangeKind, ChangeStream, Disposer, Filter, Table};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub subscribers_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters, read via `stats()`.
#[derive(Default)]
struct AtomicFanoutStats {
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    subscribers_dropped: AtomicU64,
}

struct Subscriber {
    kinds: Vec<ChangeKind>,
    filter: Filter,
    sender: mpsc::Sender<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        self.kinds.contains(&event.kind) && self.filter.matches(&event.row)
    }
}

type SubscriberMap = Arc<Mutex<HashMap<u64, Subscriber>>>;

fn lock(map: &SubscriberMap) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Change fan-out for a single table.
pub struct ChangeFanout {
    table: Table,
    subscribers: SubscriberMap,
    next_id: AtomicU64,
    capacity: usize,
    stats: Arc<AtomicFanoutStats>,
}

impl ChangeFanout {
    pub fn new(table: Table, capacity: usize) -> Self {
        Self {
            table,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicFanoutStats::default()),
        }
    }

    /// Register a subscriber and return its stream.
    ///
    /// The stream's disposer removes the registration, which also ends the stream.
    pub fn subscribe(&self, kinds: &[ChangeKind], filter: &Filter) -> ChangeStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);

        lock(&self.subscribers).insert(
            id,
            Subscriber {
                kinds: kinds.to_vec(),
                filter: filter.clone(),
                sender,
            },
        );
        log::debug!("{}: subscriber {id} attached ({filter})", self.table);

        let events = stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        let subscribers = self.subscribers.clone();
        let table = self.table;
        let disposer = Disposer::new(move || {
            if lock(&subscribers).remove(&id).is_some() {
                log::debug!("{table}: subscriber {id} detached");
            }
        });

        ChangeStream::new(events, disposer)
    }

    /// Deliver `event` to every matching subscriber. Returns how many received it.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = lock(&self.subscribers);
        let mut delivered = 0;
        let mut lagging = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.wants(event) {
                continue;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("{}: subscriber {id} lagging, dropping it", self.table);
                    lagging.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => lagging.push(*id),
            }
        }

        for id in &lagging {
            subscribers.remove(id);
        }
        self.stats.subscribers_dropped.fetch_add(lagging.len() as u64, Ordering::Relaxed);
        self.stats.events_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Drop every subscriber, ending their streams. Returns how many were dropped.
    pub fn disconnect_all(&self) -> usize {
        let mut subscribers = lock(&self.subscribers);
        let count = subscribers.len();
        subscribers.clear();
        self.stats.subscribers_dropped.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_delivered: self.stats.events_delivered.load(Ordering::Relaxed),
            subscribers_dropped: self.stats.subscribers_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn table(&self) -> Table {
        self.table
    }
}

/// Maps tables to their fan-out.
pub struct FanoutRegistry {
    fanouts: Mutex<HashMap<Table, Arc<ChangeFanout>>>,
    default_capacity: usize,
}

impl FanoutRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            fanouts: Mutex::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the fan-out for `table`.
    pub fn get_or_create(&self, table: Table) -> Arc<ChangeFanout> {
        let mut fanouts = self.fanouts.lock().unwrap_or_else(|p| p.into_inner());
        fanouts
            .entry(table)
            .or_insert_with(|| Arc::new(ChangeFanout::new(table, self.default_capacity)))
            .clone()
    }

    pub fn get(&self, table: Table) -> Option<Arc<ChangeFanout>> {
        let fanouts = self.fanouts.lock().unwrap_or_else(|p| p.into_inner());
        fanouts.get(&table).cloned()
    }

    pub fn publish(&self, event: &ChangeEvent) -> usize {
        self.get(event.table).map_or(0, |f| f.publish(event))
    }

    pub fn subscriber_count(&self, table: Table) -> usize {
        self.get(table).map_or(0, |f| f.subscriber_count())
    }

    pub fn total_subscribers(&self) -> usize {
        let fanouts = self.fanouts.lock().unwrap_or_else(|p| p.into_inner());
        fanouts.values().map(|f| f.subscriber_count()).sum()
    }
}
