//! Presence: who is online right now.
//!
//! Each user writes their own [`PresenceRecord`] (upsert on `user_id`) and a
//! heartbeat keeps `last_seen` fresh while the client is active. Liveness is a
//! read-time predicate: a record counts as online only while its `last_seen`
//! lies within the configured freshness window.
//!
//! The heartbeat timer is an owned resource. [`PresenceManager::start_heartbeat`]
//! returns a [`PresenceHandle`]; dropping it stops the timer, and
//! [`PresenceHandle::dispose`] additionally writes `offline`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::context::LiveContext;
use crate::coordinator::{ChangeListener, SubscriptionCoordinator, SubscriptionScope, SubscriptionToken};
use crate::error::{LiveError, LiveResult};
use crate::model::{JsonMap, PresenceRecord, PresenceStatus, Record};
use crate::state::ViewState;
use crate::store::{row_uuid, ChangeEvent, ChangeKind, Filter, Row, Table};

/// Whether the host environment is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

// ───────────────────────────────────────────────────────────────────
// Cache
// ───────────────────────────────────────────────────────────────────

/// Presence records keyed by user id, last-write-wins on `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct PresenceCache {
    records: HashMap<Uuid, PresenceRecord>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` unless the cached copy is strictly newer.
    pub fn merge(&mut self, record: PresenceRecord) -> bool {
        match self.records.get(&record.user_id) {
            Some(existing) if existing.updated_at > record.updated_at => false,
            _ => {
                self.records.insert(record.user_id, record);
                true
            }
        }
    }

    /// Drop everything and merge `records` in, so duplicates resolve by `updated_at`.
    pub fn replace(&mut self, records: Vec<PresenceRecord>) {
        self.records.clear();
        for record in records {
            self.merge(record);
        }
    }

    pub fn remove(&mut self, user_id: Uuid) -> Option<PresenceRecord> {
        self.records.remove(&user_id)
    }

    pub fn get(&self, user_id: Uuid) -> Option<&PresenceRecord> {
        self.records.get(&user_id)
    }

    /// Records that are `online` with `last_seen` inside `window`, most recently seen first.
    /// A `last_seen` more than `max_skew` ahead of `now` does not count.
    pub fn online_users(&self, now: DateTime<Utc>, window: Duration, max_skew: Duration) -> Vec<PresenceRecord> {
        let mut online: Vec<PresenceRecord> = self
            .records
            .values()
            .filter(|r| r.is_live(now, window, max_skew))
            .cloned()
            .collect();
        online.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.user_id.cmp(&b.user_id)));
        online
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

/// What this client last asserted about itself; the heartbeat re-writes it.
#[derive(Debug, Clone)]
struct LocalPresence {
    status: PresenceStatus,
    activity: Option<String>,
    context: JsonMap,
}

struct PresenceState {
    cache: PresenceCache,
    view: ViewState,
}

struct PresenceInner {
    ctx: LiveContext,
    coordinator: Arc<SubscriptionCoordinator>,
    state: RwLock<PresenceState>,
    local: Mutex<Option<LocalPresence>>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

/// Tracks who is online and keeps this client's own presence row current.
///
/// The cache holds every record the store reports; liveness is decided on
/// read by [`online_users`](Self::online_users) against the configured
/// freshness window, so records age out without a change event. Cheap to clone.
#[derive(Clone)]
pub struct PresenceManager {
    inner: Arc<PresenceInner>,
}

impl PresenceManager {
    pub fn new(ctx: LiveContext, coordinator: Arc<SubscriptionCoordinator>) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                ctx,
                coordinator,
                state: RwLock::new(PresenceState { cache: PresenceCache::new(), view: ViewState::default() }),
                local: Mutex::new(None),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to presence changes, load fresh records and announce `online`.
    pub async fn activate(&self) -> LiveResult<()> {
        {
            let mut subscription = self.inner.subscription.lock().await;
            if subscription.is_none() {
                let scope = SubscriptionScope::all(Table::UserPresence, Filter::new());
                let listener: Arc<dyn ChangeListener> = self.inner.clone();
                *subscription = Some(self.inner.coordinator.subscribe(scope, listener).await);
            }
        }
        let loaded = self.inner.load().await;
        self.set_status(PresenceStatus::Online, None, None).await?;
        loaded
    }

    /// Release the presence subscription.
    ///
    /// Does not write `offline`; use [`set_status`](Self::set_status) for that,
    /// or [`PresenceHandle::dispose`].
    pub async fn deactivate(&self) {
        if let Some(token) = self.inner.subscription.lock().await.take() {
            self.inner.coordinator.release(token).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.subscription.lock().await.is_some()
    }

    /// Write the caller's own presence. `None` keeps the previously asserted
    /// activity label or context.
    pub async fn set_status(
        &self,
        status: PresenceStatus,
        activity: Option<String>,
        context: Option<JsonMap>,
    ) -> LiveResult<PresenceRecord> {
        self.inner.set_status(status, activity, context).await
    }

    /// Refresh `last_seen` by re-writing the current local status.
    pub async fn heartbeat(&self) -> LiveResult<PresenceRecord> {
        self.inner.heartbeat().await
    }

    /// Map foreground/background to `online`/`away`.
    pub async fn set_visibility(&self, visibility: Visibility) -> LiveResult<PresenceRecord> {
        let status = match visibility {
            Visibility::Visible => PresenceStatus::Online,
            Visibility::Hidden => PresenceStatus::Away,
        };
        self.set_status(status, None, None).await
    }

    /// Bulk-fetch presence records seen within the freshness window.
    pub async fn load(&self) -> LiveResult<()> {
        self.inner.load().await
    }

    /// Users whose status is `online` and whose `last_seen` falls inside the
    /// freshness window at the time of the call, most recently seen first.
    ///
    /// A `last_seen` further ahead of the local clock than `max_clock_skew`
    /// is treated as stale.
    pub async fn online_users(&self) -> Vec<PresenceRecord> {
        let now = self.inner.ctx.now();
        let config = &self.inner.ctx.config;
        self.inner
            .state
            .read()
            .await
            .cache
            .online_users(now, config.freshness_window, config.max_clock_skew)
    }

    /// The cached record for `user_id`, fresh or not.
    pub async fn get(&self, user_id: Uuid) -> Option<PresenceRecord> {

        self.inner.state.read().await.cache.get(user_id).cloned()
    }

    /// The status this client last asserted, if any.
    pub async fn local_status(&self) -> Option<PresenceStatus> {
        self.inner.local.lock().await.as_ref().map(|l| l.status)
    }

    pub async fn state(&self) -> ViewState {
        self.inner.state.read().await.view.clone()
    }

    /// Start the heartbeat timer. The returned handle owns it.
    pub fn start_heartbeat(&self) -> PresenceHandle {
        let period = self.inner.ctx.config.heartbeat_interval;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.heartbeat().await {
                    log::warn!("presence heartbeat failed: {e}");
                }
            }
        });
        log::debug!("presence heartbeat started every {period:?}");
        PresenceHandle { task: Some(task), manager: Arc::downgrade(&self.inner) }
    }
}

impl PresenceInner {
    async fn set_status(
        &self,
        status: PresenceStatus,
        activity: Option<String>,
        context: Option<JsonMap>,
    ) -> LiveResult<PresenceRecord> {
        self.assert_presence(Some(status), activity, context).await
    }

    /// Re-assert whatever status is current when the write starts.
    async fn heartbeat(&self) -> LiveResult<PresenceRecord> {
        self.assert_presence(None, None, None).await
    }

    /// Read-upsert-commit of the local presence. `local` stays locked for the
    /// whole step so a slow write cannot land after a newer assertion.
    async fn assert_presence(
        &self,
        status: Option<PresenceStatus>,
        activity: Option<String>,
        context: Option<JsonMap>,
    ) -> LiveResult<PresenceRecord> {
        let actor = self.ctx.actor_id()?;
        let mut local_slot = self.local.lock().await;
        let previous = local_slot.as_ref();
        let local = LocalPresence {
            status: status
                .or_else(|| previous.map(|p| p.status))
                .unwrap_or(PresenceStatus::Online),
            activity: activity.or_else(|| previous.and_then(|p| p.activity.clone())),
            context: context
                .or_else(|| previous.map(|p| p.context.clone()))
                .unwrap_or_default(),
        };

        let now = self.ctx.now();
        let record = PresenceRecord {
            user_id: actor,
            status: local.status,
            current_activity: local.activity.clone(),
            context: local.context.clone(),
            last_seen: now,
            updated_at: now,
        };

        let stored = self
            .ctx
            .store
            .upsert(Table::UserPresence, record.to_row()?, &["user_id"])
            .await
            .map_err(LiveError::write(Table::UserPresence));
        let stored = match stored {
            Ok(row) => PresenceRecord::from_row(row)?,
            Err(e) => {
                log::warn!("presence write ({}) failed: {e}", local.status);
                self.state.write().await.view.set_error(&e);
                return Err(e);
            }
        };

        *local_slot = Some(local);
        self.state.write().await.cache.merge(stored.clone());
        Ok(stored)
    }

    async fn load(&self) -> LiveResult<()> {
        let now = self.ctx.now();
        let window = self.ctx.config.freshness_window;
        let mut filter = Filter::new();
        if let Some(cutoff) = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
        {
            filter = filter.gte("last_seen", cutoff);
        }

        self.state.write().await.view.begin_load();
        let fetched = self
            .ctx
            .store
            .select(Table::UserPresence, &filter, None, None)
            .await
            .map_err(LiveError::fetch(Table::UserPresence));

        let mut state = self.state.write().await;
        match fetched {
            Ok(rows) => {
                let records = decode_all(rows);
                log::info!("loaded {} presence record(s)", records.len());
                state.cache.replace(records);
                state.view.load_succeeded();
                Ok(())
            }
            Err(e) => {
                log::error!("presence load failed: {e}");
                state.cache.clear();
                state.view.load_failed(&e);
                Err(e)
            }
        }
    }
}

fn decode_all(rows: Vec<Row>) -> Vec<PresenceRecord> {
    rows.into_iter()
        .filter_map(|row| match PresenceRecord::from_row(row) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("skipping presence row: {e}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ChangeListener for PresenceInner {
    async fn on_change(&self, event: &ChangeEvent) {
        let mut state = self.state.write().await;
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => match PresenceRecord::from_row(event.row.clone()) {
                Ok(record) => {
                    state.cache.merge(record);
                }
                Err(e) => log::warn!("ignoring presence change: {e}"),
            },
            ChangeKind::Delete => {
                if let Some(user_id) = row_uuid(&event.row, "user_id") {
                    state.cache.remove(user_id);
                }
            }
        }
    }

    async fn on_stale(&self, error: &LiveError) {
        let mut state = self.state.write().await;
        state.view.mark_stale();
        state.view.set_error(error);
    }

    async fn on_resync(&self) {
        if self.load().await.is_ok() {
            self.state.write().await.view.clear_stale();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Heartbeat handle
// ───────────────────────────────────────────────────────────────────

/// Owns the presence heartbeat timer. Dropping the handle stops the timer.
pub struct PresenceHandle {
    task: Option<JoinHandle<()>>,
    manager: Weak<PresenceInner>,
}

impl PresenceHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the timer without touching the stored presence.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::debug!("presence heartbeat stopped");
        }
    }

    /// Stop the timer, then best-effort write `offline`.
    pub async fn dispose(mut self) {
        self.stop();
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        if let Err(e) = inner.set_status(PresenceStatus::Offline, None, None).await {
            log::warn!("could not write offline presence on dispose: {e}");
        }
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PresenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceHandle").field("running", &self.is_running()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::EngineConfig;
    use crate::error::StoreError;
    use crate::identity::StaticIdentity;
    use crate::store::{ChangeStream, MemoryStore, Order, RemoteStore};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(user: Uuid, status: PresenceStatus, at: DateTime<Utc>) -> PresenceRecord {
        PresenceRecord {
            user_id: user,
            status,
            current_activity: None,
            context: JsonMap::new(),
            last_seen: at,
            updated_at: at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_merge_is_last_write_wins() {
        let user = Uuid::new_v4();
        let mut cache = PresenceCache::new();
        let newer = record(user, PresenceStatus::Busy, t0() + chrono::Duration::seconds(10));
        assert!(cache.merge(newer.clone()));
        assert!(!cache.merge(record(user, PresenceStatus::Online, t0())));
        assert_eq!(cache.get(user).unwrap().status, PresenceStatus::Busy);

        assert!(cache.merge(record(user, PresenceStatus::Away, newer.updated_at)));
        assert_eq!(cache.get(user).unwrap().status, PresenceStatus::Away);
    }

    #[test]
    fn test_online_users_excludes_stale_and_non_online() {
        let window = Duration::from_secs(90);
        let now = t0();
        let fresh = record(Uuid::new_v4(), PresenceStatus::Online, now - chrono::Duration::seconds(30));
        let stale = record(Uuid::new_v4(), PresenceStatus::Online, now - chrono::Duration::seconds(91));
        let busy = record(Uuid::new_v4(), PresenceStatus::Busy, now);

        let mut cache = PresenceCache::new();
        cache.replace(vec![fresh.clone(), stale, busy]);

        let online = cache.online_users(now, window, Duration::from_secs(1));
        assert_eq!(online, vec![fresh]);
    }

    #[test]
    fn test_online_users_never_older_than_window() {
        let window = Duration::from_secs(60);
        let now = t0();
        let mut cache = PresenceCache::new();
        for age in 0..200 {
            cache.merge(record(
                Uuid::new_v4(),
                PresenceStatus::Online,
                now - chrono::Duration::seconds(age),
            ));
        }
        let online = cache.online_users(now, window, Duration::from_secs(1));
        assert_eq!(online.len(), 61);
        assert!(online.iter().all(|r| now - r.last_seen <= chrono::Duration::seconds(60)));
    }

    /// Holds the next upsert back so a second write can start meanwhile.
    struct SlowUpsertStore {
        inner: MemoryStore,
        delay_next: AtomicBool,
    }

    #[async_trait]
    impl RemoteStore for SlowUpsertStore {
        async fn select(
            &self,
            table: Table,
            filter: &Filter,
            order: Option<&Order>,
            limit: Option<usize>,
        ) -> Result<Vec<Row>, StoreError> {
            self.inner.select(table, filter, order, limit).await
        }

        async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
            self.inner.insert(table, row).await
        }

        async fn update(&self, table: Table, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
            self.inner.update(table, filter, patch).await
        }

        async fn upsert(&self, table: Table, row: Row, conflict_key: &[&str]) -> Result<Row, StoreError> {
            if self.delay_next.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(80)).await;
            }
            self.inner.upsert(table, row, conflict_key).await
        }

        async fn delete(&self, table: Table, filter: &Filter) -> Result<usize, StoreError> {
            self.inner.delete(table, filter).await
        }

        async fn subscribe(
            &self,
            table: Table,
            kinds: &[ChangeKind],
            filter: &Filter,
        ) -> Result<ChangeStream, StoreError> {
            self.inner.subscribe(table, kinds, filter).await
        }
    }

    #[tokio::test]
    async fn test_slow_heartbeat_cannot_undo_hidden() {
        let store = Arc::new(SlowUpsertStore { inner: MemoryStore::default(), delay_next: AtomicBool::new(false) });
        let actor = Uuid::new_v4();
        let config = EngineConfig::for_testing();
        let coordinator = Arc::new(SubscriptionCoordinator::new(store.clone(), config.backoff()));
        let ctx = LiveContext::new(store.clone(), Arc::new(StaticIdentity::member(actor)), Arc::new(SystemClock), config);
        let presence = PresenceManager::new(ctx, coordinator);
        presence.set_status(PresenceStatus::Online, None, None).await.unwrap();

        store.delay_next.store(true, Ordering::SeqCst);
        let beating = presence.clone();
        let heartbeat = tokio::spawn(async move { beating.heartbeat().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        presence.set_visibility(Visibility::Hidden).await.unwrap();
        heartbeat.await.unwrap().unwrap();

        assert_eq!(presence.local_status().await, Some(PresenceStatus::Away));
        assert_eq!(presence.get(actor).await.unwrap().status, PresenceStatus::Away);
        let rows = store.inner.rows(Table::UserPresence).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "away");
    }

    #[tokio::test]
    async fn test_deactivate_releases_without_going_offline() {
        let store = Arc::new(MemoryStore::default());
        let actor = Uuid::new_v4();
        let config = EngineConfig::for_testing();
        let coordinator = Arc::new(SubscriptionCoordinator::new(store.clone(), config.backoff()));
        let ctx = LiveContext::new(store.clone(), Arc::new(StaticIdentity::member(actor)), Arc::new(SystemClock), config);
        let presence = PresenceManager::new(ctx, coordinator.clone());

        presence.activate().await.unwrap();
        assert!(presence.is_active().await);
        assert_eq!(coordinator.active_scopes().await, 1);

        presence.deactivate().await;
        assert!(!presence.is_active().await);
        assert_eq!(coordinator.active_scopes().await, 0);
        let rows = store.rows(Table::UserPresence).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "online");
        assert_eq!(presence.get(actor).await.unwrap().status, PresenceStatus::Online);
    }
}
