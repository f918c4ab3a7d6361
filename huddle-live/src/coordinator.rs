//! Subscription lifecycle coordinator.
//!
//! Owns every change-channel subscription the engine opens. Components
//! register a [`ChangeListener`] for a [`SubscriptionScope`]; the first
//! listener on a scope opens one upstream [`ChangeStream`] and a pump task,
//! later listeners attach to it. Each event reaches each listener once.
//!
//! ```text
//!  RemoteStore ──ChangeStream──► pump task ──┬──► listener A (feed)
//!                                            └──► listener B (feed, same scope)
//! ```
//!
//! When the upstream drops, listeners get `on_stale`, the pump resubscribes
//! with exponential backoff, and listeners get `on_resync` so they can
//! re-fetch whatever they missed. Releasing the last listener aborts the
//! pump and disposes the upstream before `release` returns.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::BackoffPolicy;
use crate::error::{LiveError, StoreError};
use crate::store::{ChangeEvent, ChangeKind, Disposer, Filter, RemoteStore, Table};

/// Receives routed change events for one scope.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, event: &ChangeEvent);

    /// The upstream dropped or could not be opened; the cache may be behind.
    async fn on_stale(&self, _error: &LiveError) {}

    /// The upstream is back. Events between `on_stale` and now were missed.
    async fn on_resync(&self) {}
}

/// One logical subscription: a table, the change kinds of interest, and a row filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionScope {
    pub table: Table,
    pub kinds: Vec<ChangeKind>,
    pub filter: Filter,
}

impl SubscriptionScope {
    pub fn new(table: Table, kinds: &[ChangeKind], filter: Filter) -> Self {
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();
        Self { table, kinds, filter }
    }

    /// Every change on `table` matching `filter`.
    pub fn all(table: Table, filter: Filter) -> Self {
        Self::new(table, &ChangeKind::ALL, filter)
    }

    /// Canonical key; equal scopes share one upstream.
    pub fn key(&self) -> String {
        let kinds: Vec<&str> = self
            .kinds
            .iter()
            .map(|k| match k {
                ChangeKind::Insert => "insert",
                ChangeKind::Update => "update",
                ChangeKind::Delete => "delete",
            })
            .collect();
        format!("{}:{}:{}", self.table, kinds.join(","), self.filter)
    }
}

/// Proof of registration. Hand back to [`SubscriptionCoordinator::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionToken {
    id: u64,
    key: String,
}

impl SubscriptionToken {
    pub fn scope_key(&self) -> &str {
        &self.key
    }
}

type ListenerSet = Arc<StdMutex<Vec<(u64, Arc<dyn ChangeListener>)>>>;

struct ScopeEntry {
    listeners: ListenerSet,
    disposer: Arc<StdMutex<Option<Disposer>>>,
    closing: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl ScopeEntry {
    fn close(self) {
        self.closing.store(true, Ordering::SeqCst);
        self.pump.abort();
        if let Some(mut disposer) = lock(&self.disposer).take() {
            disposer.dispose();
        }
        lock(&self.listeners).clear();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Reference-counted registry of upstream subscriptions, keyed by scope.
pub struct SubscriptionCoordinator {
    store: Arc<dyn RemoteStore>,
    backoff: BackoffPolicy,
    scopes: Mutex<HashMap<String, ScopeEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            backoff,
            scopes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach `listener` to `scope`, opening the upstream if this is the first listener.
    ///
    /// If the upstream cannot be opened the registration still succeeds: the
    /// listener is told it is stale and the pump keeps retrying.
    pub async fn subscribe(
        &self,
        scope: SubscriptionScope,
        listener: Arc<dyn ChangeListener>,
    ) -> SubscriptionToken {
        let key = scope.key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut scopes = self.scopes.lock().await;

        if let Some(entry) = scopes.get(&key) {
            lock(&entry.listeners).push((id, listener));
            log::debug!("attached listener {id} to existing scope {key}");
            return SubscriptionToken { id, key };
        }

        let listeners: ListenerSet = Arc::new(StdMutex::new(vec![(id, listener)]));
        let disposer = Arc::new(StdMutex::new(None));
        let closing = Arc::new(AtomicBool::new(false));

        let opened = self.store.subscribe(scope.table, &scope.kinds, &scope.filter).await;
        let (events, open_error) = match opened {
            Ok(stream) => {
                let (events, upstream_disposer) = stream.into_parts();
                *lock(&disposer) = Some(upstream_disposer);
                log::info!("opened change subscription {key}");
                (Some(events), None)
            }
            Err(e) => {
                log::warn!("could not open change subscription {key}: {e}");
                (None, Some(e))
            }
        };

        let pump = tokio::spawn(pump(
            PumpShared {
                store: self.store.clone(),
                scope,
                backoff: self.backoff,
                listeners: listeners.clone(),
                disposer: disposer.clone(),
                closing: closing.clone(),
            },
            events,
            open_error,
        ));

        scopes.insert(key.clone(), ScopeEntry { listeners, disposer, closing, pump });
        SubscriptionToken { id, key }
    }

    /// Detach a listener. Releasing the last listener on a scope closes its
    /// upstream before this returns.
    pub async fn release(&self, token: SubscriptionToken) {
        let mut scopes = self.scopes.lock().await;
        let Some(entry) = scopes.get(&token.key) else {
            return;
        };
        let remaining = {
            let mut listeners = lock(&entry.listeners);
            listeners.retain(|(id, _)| *id != token.id);
            listeners.len()
        };
        if remaining == 0 {
            if let Some(entry) = scopes.remove(&token.key) {
                entry.close();
                log::info!("closed change subscription {}", token.key);
            }
        }
    }

    /// Close every scope.
    pub async fn shutdown(&self) {
        let mut scopes = self.scopes.lock().await;
        let count = scopes.len();
        for (_, entry) in scopes.drain() {
            entry.close();
        }
        if count > 0 {
            log::info!("coordinator shut down, closed {count} subscription(s)");
        }
    }

    /// Number of open upstream subscriptions.
    pub async fn active_scopes(&self) -> usize {
        self.scopes.lock().await.len()
    }

    /// Total listeners across all scopes.
    pub async fn listener_count(&self) -> usize {
        self.scopes
            .lock()
            .await
            .values()
            .map(|entry| lock(&entry.listeners).len())
            .sum()
    }

    /// Keys of the open scopes, sorted.
    pub async fn scope_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.scopes.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("backoff", &self.backoff)
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Pump task
// ───────────────────────────────────────────────────────────────────

struct PumpShared {
    store: Arc<dyn RemoteStore>,
    scope: SubscriptionScope,
    backoff: BackoffPolicy,
    listeners: ListenerSet,
    disposer: Arc<StdMutex<Option<Disposer>>>,
    closing: Arc<AtomicBool>,
}

impl PumpShared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<(u64, Arc<dyn ChangeListener>)> {
        lock(&self.listeners).clone()
    }

    fn is_attached(&self, id: u64) -> bool {
        lock(&self.listeners).iter().any(|(other, _)| *other == id)
    }

    async fn deliver(&self, event: &ChangeEvent) {
        for (id, listener) in self.snapshot() {
            if self.is_closing() {
                return;
            }
            if self.is_attached(id) {
                listener.on_change(event).await;
            }
        }
    }

    async fn notify_stale(&self, error: &LiveError) {
        for (_, listener) in self.snapshot() {
            listener.on_stale(error).await;
        }
    }

    async fn notify_resync(&self) {
        for (_, listener) in self.snapshot() {
            if self.is_closing() {
                return;
            }
            listener.on_resync().await;
        }
    }

    /// Swap in a fresh upstream disposer. Returns `false` if teardown started meanwhile.
    fn install(&self, mut disposer: Disposer) -> bool {
        let mut slot = lock(&self.disposer);
        if self.is_closing() {
            disposer.dispose();
            return false;
        }
        *slot = Some(disposer);
        true
    }

    async fn reconnect(&self) -> Option<BoxStream<'static, ChangeEvent>> {
        let key = self.scope.key();
        let mut attempt = 0;
        loop {
            if self.backoff.exhausted(attempt) {
                log::error!("giving up on change subscription {key} after {attempt} attempt(s)");
                return None;
            }
            tokio::time::sleep(self.backoff.delay(attempt)).await;
            if self.is_closing() {
                return None;
            }
            let table = self.scope.table;
            match self.store.subscribe(table, &self.scope.kinds, &self.scope.filter).await {
                Ok(stream) => {
                    let (events, disposer) = stream.into_parts();
                    if !self.install(disposer) {
                        return None;
                    }
                    log::info!("resubscribed {key} after {} attempt(s)", attempt + 1);
                    return Some(events);
                }
                Err(e) => {
                    attempt += 1;
                    log::warn!("resubscribe {key} attempt {attempt} failed: {e}");
                }
            }
        }
    }
}

async fn pump(
    shared: PumpShared,
    mut events: Option<BoxStream<'static, ChangeEvent>>,
    mut pending_error: Option<StoreError>,
) {
    loop {
        if let Some(stream) = events.as_mut() {
            while let Some(event) = stream.next().await {
                if shared.is_closing() {
                    return;
                }
                shared.deliver(&event).await;
            }
        }
        if shared.is_closing() {
            return;
        }

        let source = pending_error.take().unwrap_or(StoreError::Closed);
        let error = LiveError::Subscription { table: shared.scope.table, source };
        log::warn!("change subscription {} lost: {error}", shared.scope.key());
        shared.notify_stale(&error).await;

        events = shared.reconnect().await;
        if events.is_none() {
            return;
        }
        shared.notify_resync().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{row, MemoryStore, Operation};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<ChangeEvent>>,
        stale: AtomicU64,
        resync: AtomicU64,
    }

    #[async_trait]
    impl ChangeListener for Recorder {
        async fn on_change(&self, event: &ChangeEvent) {
            lock(&self.events).push(event.clone());
        }
        async fn on_stale(&self, _error: &LiveError) {
            self.stale.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_resync(&self) {
            self.resync.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            lock(&self.events).len()
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            max_attempts: None,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    fn feed_row(user: Uuid) -> crate::store::Row {
        row(json!({ "id": Uuid::new_v4(), "user_id": user, "title": "t" }))
    }

    #[test]
    fn test_scope_key_is_canonical() {
        let user = Uuid::new_v4();
        let a = SubscriptionScope::new(
            Table::ActivityFeed,
            &[ChangeKind::Update, ChangeKind::Insert, ChangeKind::Insert],
            Filter::new().eq("user_id", user),
        );
        let b = SubscriptionScope::new(
            Table::ActivityFeed,
            &[ChangeKind::Insert, ChangeKind::Update],
            Filter::new().eq("user_id", user),
        );
        assert_eq!(a.key(), b.key());
        assert!(a.key().starts_with("activity_feed:insert,update:user_id=eq."));
    }

    #[tokio::test]
    async fn test_same_scope_shares_one_upstream() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = SubscriptionCoordinator::new(store.clone(), fast_backoff());
        let user = Uuid::new_v4();
        let scope = SubscriptionScope::all(Table::ActivityFeed, Filter::new().eq("user_id", user));

        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let ta = coordinator.subscribe(scope.clone(), a.clone()).await;
        let tb = coordinator.subscribe(scope, b.clone()).await;

        assert_eq!(store.subscriber_count(Table::ActivityFeed), 1);
        assert_eq!(coordinator.active_scopes().await, 1);
        assert_eq!(coordinator.listener_count().await, 2);

        store.insert(Table::ActivityFeed, feed_row(user)).await.unwrap();
        wait_until(|| a.count() == 1 && b.count() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);

        coordinator.release(ta).await;
        assert_eq!(store.subscriber_count(Table::ActivityFeed), 1);
        coordinator.release(tb).await;
        assert_eq!(store.subscriber_count(Table::ActivityFeed), 0);
        assert_eq!(coordinator.active_scopes().await, 0);
    }

    #[tokio::test]
    async fn test_released_listener_receives_nothing() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = SubscriptionCoordinator::new(store.clone(), fast_backoff());
        let scope = SubscriptionScope::all(Table::UserPresence, Filter::new());

        let kept = Arc::new(Recorder::default());
        let gone = Arc::new(Recorder::default());
        let _tk = coordinator.subscribe(scope.clone(), kept.clone()).await;
        let tg = coordinator.subscribe(scope, gone.clone()).await;
        coordinator.release(tg).await;

        store
            .upsert(Table::UserPresence, row(json!({ "user_id": Uuid::new_v4() })), &["user_id"])
            .await
            .unwrap();
        wait_until(|| kept.count() == 1).await;
        assert_eq!(gone.count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribes_after_drop() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = SubscriptionCoordinator::new(store.clone(), fast_backoff());
        let user = Uuid::new_v4();
        let listener = Arc::new(Recorder::default());
        let _token = coordinator
            .subscribe(
                SubscriptionScope::all(Table::ActivityFeed, Filter::new().eq("user_id", user)),
                listener.clone(),
            )
            .await;

        store.disconnect_subscribers(Table::ActivityFeed);
        wait_until(|| listener.resync.load(Ordering::SeqCst) == 1).await;
        assert_eq!(listener.stale.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(Table::ActivityFeed), 1);

        store.insert(Table::ActivityFeed, feed_row(user)).await.unwrap();
        wait_until(|| listener.count() == 1).await;
    }

    #[tokio::test]
    async fn test_open_failure_retries_until_store_recovers() {
        let store = Arc::new(MemoryStore::default());
        store.fail(Table::SharedFiles, Operation::Subscribe);
        let coordinator = SubscriptionCoordinator::new(store.clone(), fast_backoff());
        let listener = Arc::new(Recorder::default());
        let _token = coordinator
            .subscribe(SubscriptionScope::all(Table::SharedFiles, Filter::new()), listener.clone())
            .await;

        wait_until(|| listener.stale.load(Ordering::SeqCst) == 1).await;
        assert_eq!(store.subscriber_count(Table::SharedFiles), 0);

        store.recover(Table::SharedFiles, Operation::Subscribe);
        wait_until(|| listener.resync.load(Ordering::SeqCst) == 1).await;
        assert_eq!(store.subscriber_count(Table::SharedFiles), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let store = Arc::new(MemoryStore::default());
        store.fail(Table::SharedFiles, Operation::Subscribe);
        let backoff = BackoffPolicy { max_attempts: Some(2), ..fast_backoff() };
        let coordinator = SubscriptionCoordinator::new(store.clone(), backoff);
        let listener = Arc::new(Recorder::default());
        let _token = coordinator
            .subscribe(SubscriptionScope::all(Table::SharedFiles, Filter::new()), listener.clone())
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        store.recover(Table::SharedFiles, Operation::Subscribe);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.resync.load(Ordering::SeqCst), 0);
        assert_eq!(store.subscriber_count(Table::SharedFiles), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = SubscriptionCoordinator::new(store.clone(), fast_backoff());
        for table in [Table::ActivityFeed, Table::UserPresence, Table::MessageStatus] {
            let _ = coordinator
                .subscribe(SubscriptionScope::all(table, Filter::new()), Arc::new(Recorder::default()))
                .await;
        }
        assert_eq!(store.total_subscribers(), 3);

        coordinator.shutdown().await;
        assert_eq!(store.total_subscribers(), 0);
        assert_eq!(coordinator.active_scopes().await, 0);
        assert_eq!(coordinator.listener_count().await, 0);
    }
}
