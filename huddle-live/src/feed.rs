//! Activity feed: a bounded, newest-first mirror of the current user's
//! activity items with optimistic read-marking.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::context::LiveContext;
use crate::coordinator::{ChangeListener, SubscriptionCoordinator, SubscriptionScope, SubscriptionToken};
use crate::error::{LiveError, LiveResult};
use crate::model::{ActivityDraft, ActivityItem, Record};
use crate::state::ViewState;
use crate::store::{row, row_uuid, ChangeEvent, ChangeKind, Filter, Order, Row, Table};

// ───────────────────────────────────────────────────────────────────
// Cache
// ───────────────────────────────────────────────────────────────────

/// Newest-first list of activity items, capped at `limit`.
///
/// `read` never flips back to `false` through a merge. Only an explicit
/// [`rollback_read`](Self::rollback_read) undoes a local flip, and never for
/// an item the store has already reported as read.
#[derive(Debug, Clone)]
pub struct FeedCache {
    items: Vec<ActivityItem>,
    limit: usize,
    /// Items the store itself reported as read.
    remote_read: HashSet<Uuid>,
}

impl FeedCache {
    pub fn new(limit: usize) -> Self {
        Self { items: Vec::new(), limit: limit.max(1), remote_read: HashSet::new() }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
        self.evict();
    }

    /// Replace the whole cache with a fresh fetch.
    pub fn replace(&mut self, mut items: Vec<ActivityItem>) {
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut seen = HashSet::new();
        items.retain(|item| seen.insert(item.id));
        self.remote_read = items.iter().filter(|i| i.read).map(|i| i.id).collect();
        self.items = items;
        self.evict();
    }

    /// Add a new item in creation order. An already-cached id is merged as an
    /// update and reported as `false`.
    pub fn insert(&mut self, item: ActivityItem) -> bool {
        if self.contains(item.id) {
            self.update(item);
            return false;
        }
        if item.read {
            self.remote_read.insert(item.id);
        }
        let at = self
            .items
            .iter()
            .position(|existing| existing.created_at <= item.created_at)
            .unwrap_or(self.items.len());
        self.items.insert(at, item);
        self.evict();
        true
    }

    /// Replace a cached item field-for-field, keeping `read` if either side has it.
    /// Returns `false` when the item is not cached.
    pub fn update(&mut self, incoming: ActivityItem) -> bool {
        let Some(existing) = self.items.iter_mut().find(|i| i.id == incoming.id) else {
            return false;
        };
        if incoming.read {
            self.remote_read.insert(incoming.id);
        }
        let read = existing.read || incoming.read;
        *existing = ActivityItem { read, ..incoming };
        true
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        self.remote_read.remove(&id);
        self.items.len() != before
    }

    /// Look up a cached item by id. Evicted items are gone.
    pub fn get(&self, id: Uuid) -> Option<&ActivityItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    /// Flip `read` on the given ids. Returns the ids that actually changed.
    pub fn set_read(&mut self, ids: &[Uuid]) -> Vec<Uuid> {
        let mut flipped = Vec::new();
        for item in self.items.iter_mut().filter(|i| !i.read && ids.contains(&i.id)) {
            item.read = true;
            flipped.push(item.id);
        }
        flipped
    }

    /// Undo a local flip for ids the store has not confirmed as read.
    pub fn rollback_read(&mut self, ids: &[Uuid]) {
        for item in self.items.iter_mut().filter(|i| ids.contains(&i.id)) {
            if !self.remote_read.contains(&item.id) {
                item.read = false;
            }
        }
    }

    /// Ids of cached unread items, newest first.
    pub fn unread_ids(&self) -> Vec<Uuid> {
        self.items.iter().filter(|i| !i.read).map(|i| i.id).collect()
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|i| !i.read).count()
    }

    /// Unread items with priority at or below `threshold`.
    pub fn high_priority(&self, threshold: u8) -> Vec<&ActivityItem> {
        self.items
            .iter()
            .filter(|i| !i.read && i.is_high_priority(threshold))
            .collect()
    }

    /// Cached items, newest first.
    pub fn items(&self) -> &[ActivityItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Empty the cache, forgetting which ids the store confirmed as read.
    pub fn clear(&mut self) {
        self.items.clear();
        self.remote_read.clear();
    }

    fn evict(&mut self) {
        while self.items.len() > self.limit {
            if let Some(evicted) = self.items.pop() {
                self.remote_read.remove(&evicted.id);
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Component
// ───────────────────────────────────────────────────────────────────

struct FeedState {
    cache: FeedCache,
    view: ViewState,
}

struct FeedInner {
    ctx: LiveContext,
    coordinator: Arc<SubscriptionCoordinator>,
    state: RwLock<FeedState>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

/// The current user's activity feed. Cheap to clone.
#[derive(Clone)]
pub struct ActivityFeed {
    inner: Arc<FeedInner>,
}

impl ActivityFeed {
    pub fn new(ctx: LiveContext, coordinator: Arc<SubscriptionCoordinator>) -> Self {
        let limit = ctx.config.feed_limit;
        Self {
            inner: Arc::new(FeedInner {
                ctx,
                coordinator,
                state: RwLock::new(FeedState { cache: FeedCache::new(limit), view: ViewState::default() }),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to the user's feed, then load it.
    pub async fn activate(&self) -> LiveResult<()> {
        let actor = self.inner.ctx.actor_id()?;
        {
            let mut subscription = self.inner.subscription.lock().await;
            if subscription.is_none() {
                let scope = SubscriptionScope::all(Table::ActivityFeed, Filter::new().eq("user_id", actor));
                let listener: Arc<dyn ChangeListener> = self.inner.clone();
                *subscription = Some(self.inner.coordinator.subscribe(scope, listener).await);
            }
        }
        self.inner.load(self.inner.ctx.config.feed_limit).await
    }

    /// Close the feed subscription. Cached items stay readable.
    pub async fn deactivate(&self) {
        if let Some(token) = self.inner.subscription.lock().await.take() {
            self.inner.coordinator.release(token).await;
        }
    }

    /// Whether this feed holds a subscription.
    pub async fn is_active(&self) -> bool {
        self.inner.subscription.lock().await.is_some()
    }

    /// Fetch the `limit` most recent items and replace the cache.
    pub async fn load(&self, limit: usize) -> LiveResult<()> {
        self.inner.load(limit).await
    }

    /// Mark one item read, flipping the cache before the write lands.
    ///
    /// Marking an already-read item is a no-op. A failed write rolls the flip
    /// back and records the error on [`state`](Self::state). An id that is
    /// neither cached nor stored for this user yields [`LiveError::NotFound`].
    pub async fn mark_read(&self, id: Uuid) -> LiveResult<()> {
        let actor = self.inner.ctx.actor_id()?;
        let flipped = {
            let mut state = self.inner.state.write().await;
            if state.cache.get(id).is_some_and(|item| item.read) {
                return Ok(());
            }
            state.cache.set_read(&[id])
        };

        let filter = Filter::new().eq("id", id).eq("user_id", actor);
        match self.inner.write_read_flag(&filter).await {
            Ok(rows) if rows.is_empty() && flipped.is_empty() => {
                Err(LiveError::NotFound(format!("activity item {id}")))
            }
            Ok(rows) => {
                self.inner.merge_rows(rows).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("mark_read {id} failed, rolling back: {e}");
                let mut state = self.inner.state.write().await;
                state.cache.rollback_read(&flipped);
                state.view.set_error(&e);
                Err(e)
            }
        }
    }

    /// Mark every cached unread item read. Returns how many were flipped.
    pub async fn mark_all_read(&self) -> LiveResult<usize> {
        let actor = self.inner.ctx.actor_id()?;
        let flipped = {
            let mut state = self.inner.state.write().await;
            let unread = state.cache.unread_ids();
            state.cache.set_read(&unread)
        };
        if flipped.is_empty() {
            return Ok(0);
        }

        let filter = Filter::new().eq("user_id", actor).is_in("id", flipped.iter().copied());
        match self.inner.write_read_flag(&filter).await {
            Ok(rows) => {
                self.inner.merge_rows(rows).await;
                Ok(flipped.len())
            }
            Err(e) => {
                log::warn!("mark_all_read of {} item(s) failed, rolling back: {e}", flipped.len());
                let mut state = self.inner.state.write().await;
                state.cache.rollback_read(&flipped);
                state.view.set_error(&e);
                Err(e)
            }
        }
    }

    /// Insert a new activity item for `recipient`, authored by the current actor.
    pub async fn publish(&self, recipient: Uuid, draft: ActivityDraft) -> LiveResult<ActivityItem> {
        let actor = self.inner.ctx.actor_id()?;
        let item = draft.into_item(recipient, Some(actor), self.inner.ctx.now());
        let stored = self
            .inner
            .ctx
            .store
            .insert(Table::ActivityFeed, item.to_row()?)
            .await
            .map_err(LiveError::write(Table::ActivityFeed))?;
        let stored = ActivityItem::from_row(stored)?;
        if recipient == actor {
            self.inner.state.write().await.cache.insert(stored.clone());
        }
        log::debug!("published {} activity {} to {recipient}", stored.kind, stored.id);
        Ok(stored)
    }

    /// Snapshot of the cached items, newest first.
    pub async fn items(&self) -> Vec<ActivityItem> {
        self.inner.state.read().await.cache.items().to_vec()
    }

    pub async fn unread_count(&self) -> usize {
        self.inner.state.read().await.cache.unread_count()
    }

    /// Unread items at or below the configured `high_priority_threshold`.
    pub async fn high_priority(&self) -> Vec<ActivityItem> {
        let threshold = self.inner.ctx.config.high_priority_threshold;
        self.inner
            .state
            .read()
            .await
            .cache
            .high_priority(threshold)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Load and error status of this view.
    pub async fn state(&self) -> ViewState {

        self.inner.state.read().await.view.clone()
    }
}

impl FeedInner {
    async fn load(&self, limit: usize) -> LiveResult<()> {
        let actor = self.ctx.actor_id()?;
        self.state.write().await.view.begin_load();

        let fetched = self
            .ctx
            .store
            .select(
                Table::ActivityFeed,
                &Filter::new().eq("user_id", actor),
                Some(&Order::desc("created_at")),
                Some(limit),
            )
            .await
            .map_err(LiveError::fetch(Table::ActivityFeed));

        let mut state = self.state.write().await;
        match fetched {
            Ok(rows) => {
                let items = decode_all(rows);
                log::info!("loaded {} activity item(s) for {actor}", items.len());
                state.cache.set_limit(limit);
                state.cache.replace(items);
                state.view.load_succeeded();
                Ok(())
            }
            Err(e) => {
                log::error!("activity feed load failed: {e}");
                state.cache.clear();
                state.view.load_failed(&e);
                Err(e)
            }
        }
    }

    async fn write_read_flag(&self, filter: &Filter) -> LiveResult<Vec<Row>> {
        self.ctx
            .store
            .update(Table::ActivityFeed, filter, row(json!({ "read": true })))
            .await
            .map_err(LiveError::write(Table::ActivityFeed))
    }

    async fn merge_rows(&self, rows: Vec<Row>) {
        let items = decode_all(rows);
        let mut state = self.state.write().await;
        for item in items {
            state.cache.update(item);
        }
    }
}

fn decode_all(rows: Vec<Row>) -> Vec<ActivityItem> {
    rows.into_iter()
        .filter_map(|row| match ActivityItem::from_row(row) {
            Ok(item) => Some(item),
            Err(e) => {
                log::warn!("skipping activity row: {e}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ChangeListener for FeedInner {
    async fn on_change(&self, event: &ChangeEvent) {
        let mut state = self.state.write().await;
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let item = match ActivityItem::from_row(event.row.clone()) {
                    Ok(item) => item,
                    Err(e) => {
                        log::warn!("ignoring activity change: {e}");
                        return;
                    }
                };
                if event.kind == ChangeKind::Insert {
                    state.cache.insert(item);
                } else {
                    state.cache.update(item);
                }
            }
            ChangeKind::Delete => {
                if let Some(id) = row_uuid(&event.row, "id") {
                    state.cache.remove(id);
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
        let limit = self.state.read().await.cache.limit();
        if self.load(limit).await.is_ok() {
            self.state.write().await.view.clear_stale();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActivityKind;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn item(priority: u8, created_at: DateTime<Utc>) -> ActivityItem {
        ActivityDraft::new(ActivityKind::ProjectUpdated, "update")
            .priority(priority)
            .into_item(Uuid::new_v4(), None, created_at)
    }

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn test_replace_sorts_newest_first_and_caps() {
        let mut cache = FeedCache::new(2);
        cache.replace(vec![item(3, t(1)), item(3, t(3)), item(3, t(2))]);
        let times: Vec<_> = cache.items().iter().map(|i| i.created_at).collect();
        assert_eq!(times, vec![t(3), t(2)]);
    }

    #[test]
    fn test_insert_prepends_and_evicts_oldest() {
        let mut cache = FeedCache::new(2);
        let oldest = item(3, t(0));
        cache.replace(vec![oldest.clone(), item(3, t(1))]);

        let newest = item(1, t(5));
        assert!(cache.insert(newest.clone()));
        assert_eq!(cache.items()[0].id, newest.id);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(oldest.id));
    }

    #[test]
    fn test_insert_is_idempotent_by_id() {
        let mut cache = FeedCache::new(10);
        let a = item(2, t(0));
        assert!(cache.insert(a.clone()));
        cache.insert(a.clone());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_update_never_unreads() {
        let mut cache = FeedCache::new(10);
        let a = item(2, t(0));
        cache.insert(a.clone());
        cache.set_read(&[a.id]);

        let echo = ActivityItem { title: "renamed".into(), ..a.clone() };
        assert!(cache.update(echo));
        let cached = cache.get(a.id).unwrap();
        assert!(cached.read);
        assert_eq!(cached.title, "renamed");
    }

    #[test]
    fn test_update_unknown_item_ignored() {
        let mut cache = FeedCache::new(10);
        assert!(!cache.update(item(1, t(0))));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rollback_restores_only_flipped() {
        let mut cache = FeedCache::new(10);
        let a = item(1, t(0));
        let b = ActivityItem { read: true, ..item(3, t(1)) };
        let c = item(4, t(2));
        cache.replace(vec![a.clone(), b.clone(), c.clone()]);

        let unread = cache.unread_ids();
        let flipped = cache.set_read(&unread);
        assert_eq!(flipped.len(), 2);
        assert_eq!(cache.unread_count(), 0);

        cache.rollback_read(&flipped);
        assert!(!cache.get(a.id).unwrap().read);
        assert!(cache.get(b.id).unwrap().read);
        assert!(!cache.get(c.id).unwrap().read);
    }

    #[test]
    fn test_rollback_keeps_remote_confirmation() {
        let mut cache = FeedCache::new(10);
        let a = item(1, t(0));
        cache.insert(a.clone());
        let flipped = cache.set_read(&[a.id]);

        cache.update(ActivityItem { read: true, ..a.clone() });
        cache.rollback_read(&flipped);
        assert!(cache.get(a.id).unwrap().read);
    }

    #[test]
    fn test_high_priority_view() {
        let mut cache = FeedCache::new(10);
        let urgent = item(1, t(0));
        cache.replace(vec![urgent.clone(), item(3, t(1)), item(4, t(2))]);

        let high = cache.high_priority(2);
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].id, urgent.id);

        let unread = cache.unread_ids();
        cache.set_read(&unread);
        assert!(cache.high_priority(2).is_empty());
        assert_eq!(cache.unread_count(), 0);
    }
}
