//! Per-user notification preferences.

use async_trait::async_trait;
use chrono::NaiveTime;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::context::LiveContext;
use crate::coordinator::{ChangeListener, SubscriptionCoordinator, SubscriptionScope, SubscriptionToken};
use crate::error::{LiveError, LiveResult};
use crate::model::{ActivityKind, NotificationChannel, NotificationPreferences, Record};
use crate::state::ViewState;
use crate::store::{ChangeEvent, ChangeKind, Filter, Table};

#[derive(Default)]
struct PreferencesState {
    current: Option<NotificationPreferences>,
    /// `true` when `current` came from a stored row rather than defaults.
    stored: bool,
    view: ViewState,
}

struct PreferencesInner {
    ctx: LiveContext,
    coordinator: Arc<SubscriptionCoordinator>,
    state: RwLock<PreferencesState>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

/// Notification preferences of the current user, with defaults until a row exists.
#[derive(Clone)]
pub struct PreferencesManager {
    inner: Arc<PreferencesInner>,
}

impl PreferencesManager {
    pub fn new(ctx: LiveContext, coordinator: Arc<SubscriptionCoordinator>) -> Self {
        Self {
            inner: Arc::new(PreferencesInner {
                ctx,
                coordinator,
                state: RwLock::new(PreferencesState::default()),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Watch the user's preferences row and load it.
    pub async fn activate(&self) -> LiveResult<()> {

        let actor = self.inner.ctx.actor_id()?;
        {
            let mut subscription = self.inner.subscription.lock().await;
            if subscription.is_none() {
                let scope = SubscriptionScope::new(
                    Table::NotificationPreferences,
                    &[ChangeKind::Insert, ChangeKind::Update],
                    Filter::new().eq("user_id", actor),
                );
                let listener: Arc<dyn ChangeListener> = self.inner.clone();
                *subscription = Some(self.inner.coordinator.subscribe(scope, listener).await);
            }
        }
        self.inner.load().await.map(|_| ())
    }

    /// Stop watching. Cached preferences stay in effect.
    pub async fn deactivate(&self) {
        if let Some(token) = self.inner.subscription.lock().await.take() {
            self.inner.coordinator.release(token).await;
        }
    }

    /// Fetch the stored row. A user without one gets defaults; a failed fetch is an error.
    pub async fn load(&self) -> LiveResult<NotificationPreferences> {
        self.inner.load().await
    }

    /// Write-through replace of the current user's preferences.
    pub async fn update(&self, mut prefs: NotificationPreferences) -> LiveResult<NotificationPreferences> {
        let actor = self.inner.ctx.actor_id()?;
        prefs.user_id = actor;

        let previous = {
            let mut state = self.inner.state.write().await;
            let previous = (state.current.take(), state.stored);
            state.current = Some(prefs.clone());
            previous
        };

        let written = self
            .inner
            .ctx
            .store
            .upsert(Table::NotificationPreferences, prefs.to_row()?, &["user_id"])
            .await
            .map_err(LiveError::write(Table::NotificationPreferences));

        let mut state = self.inner.state.write().await;
        match written.and_then(NotificationPreferences::from_row) {
            Ok(stored) => {
                state.current = Some(stored.clone());
                state.stored = true;
                Ok(stored)
            }
            Err(e) => {
                log::warn!("preferences update failed, restoring previous: {e}");
                (state.current, state.stored) = previous;
                state.view.set_error(&e);
                Err(e)
            }
        }
    }

    /// Current preferences, or defaults if nothing has been loaded.
    pub async fn current(&self) -> NotificationPreferences {
        match &self.inner.state.read().await.current {
            Some(prefs) => prefs.clone(),
            None => NotificationPreferences::defaults_for(self.inner.ctx.actor_id().unwrap_or_default()),
        }
    }

    /// Whether the current user has a stored preferences row.
    pub async fn is_stored(&self) -> bool {
        self.inner.state.read().await.stored
    }

    /// Whether `kind` may be sent on `channel`. Quiet hours are not considered.
    pub async fn allows(&self, channel: NotificationChannel, kind: ActivityKind) -> bool {
        self.current().await.allows(channel, kind)
    }

    /// `local` is the user's wall-clock time; windows may wrap past midnight.
    pub async fn in_quiet_hours(&self, local: NaiveTime) -> bool {

        self.current().await.in_quiet_hours(local)
    }

    pub async fn state(&self) -> ViewState {
        self.inner.state.read().await.view.clone()
    }
}

impl PreferencesInner {
    async fn load(&self) -> LiveResult<NotificationPreferences> {
        let actor = self.ctx.actor_id()?;
        self.state.write().await.view.begin_load();
        let fetched = self
            .ctx
            .store
            .select(Table::NotificationPreferences, &Filter::new().eq("user_id", actor), None, Some(1))
            .await
            .map_err(LiveError::fetch(Table::NotificationPreferences));

        let mut state = self.state.write().await;
        let decoded = fetched.and_then(|rows| match rows.into_iter().next() {
            Some(row) => NotificationPreferences::from_row(row).map(|p| (p, true)),
            None => Ok((NotificationPreferences::defaults_for(actor), false)),
        });
        match decoded {
            Ok((prefs, stored)) => {
                log::debug!("loaded notification preferences for {actor} (stored: {stored})");
                state.current = Some(prefs.clone());
                state.stored = stored;
                state.view.load_succeeded();
                Ok(prefs)
            }
            Err(e) => {
                log::error!("preferences load failed: {e}");
                state.current = None;
                state.stored = false;
                state.view.load_failed(&e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ChangeListener for PreferencesInner {
    async fn on_change(&self, event: &ChangeEvent) {
        match NotificationPreferences::from_row(event.row.clone()) {
            Ok(prefs) => {
                let mut state = self.state.write().await;
                state.current = Some(prefs);
                state.stored = true;
            }
            Err(e) => log::warn!("ignoring preferences change: {e}"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::EngineConfig;
    use crate::identity::StaticIdentity;
    use crate::model::QuietHours;
    use crate::store::{MemoryStore, Operation};
    use uuid::Uuid;

    fn manager_for(store: Arc<MemoryStore>, actor: Uuid) -> PreferencesManager {
        let config = EngineConfig::for_testing();
        let coordinator = Arc::new(SubscriptionCoordinator::new(store.clone(), config.backoff()));
        let ctx = LiveContext::new(store, Arc::new(StaticIdentity::member(actor)), Arc::new(SystemClock), config);
        PreferencesManager::new(ctx, coordinator)
    }

    #[tokio::test]
    async fn test_missing_row_yields_defaults() {
        let actor = Uuid::new_v4();
        let prefs = manager_for(Arc::new(MemoryStore::default()), actor);
        let loaded = prefs.load().await.unwrap();
        assert_eq!(loaded, NotificationPreferences::defaults_for(actor));
        assert!(!prefs.is_stored().await);
        assert!(prefs.state().await.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_fetch_is_an_error_not_defaults() {
        let store = Arc::new(MemoryStore::default());
        store.fail(Table::NotificationPreferences, Operation::Select);
        let prefs = manager_for(store, Uuid::new_v4());
        let err = prefs.load().await.unwrap_err();
        assert!(matches!(err, LiveError::Fetch { .. }));
        assert!(prefs.state().await.error.is_some());
    }

    #[tokio::test]
    async fn test_update_writes_through() {
        let store = Arc::new(MemoryStore::default());
        let actor = Uuid::new_v4();
        let prefs = manager_for(store.clone(), actor);

        let mut next = prefs.load().await.unwrap();
        next.set(NotificationChannel::Push, ActivityKind::FileShared, false);
        next.quiet_hours = Some(QuietHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        });
        prefs.update(next).await.unwrap();

        assert!(!prefs.allows(NotificationChannel::Push, ActivityKind::FileShared).await);
        assert!(prefs.in_quiet_hours(NaiveTime::from_hms_opt(23, 0, 0).unwrap()).await);
        assert!(prefs.is_stored().await);
        assert_eq!(store.rows(Table::NotificationPreferences).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_update_rolls_back() {
        let store = Arc::new(MemoryStore::default());
        store.fail(Table::NotificationPreferences, Operation::Upsert);
        let prefs = manager_for(store, Uuid::new_v4());

        let mut next = prefs.load().await.unwrap();
        next.set(NotificationChannel::InApp, ActivityKind::MessageReceived, false);
        assert!(prefs.update(next).await.unwrap_err().is_write_failure());
        assert!(prefs.allows(NotificationChannel::InApp, ActivityKind::MessageReceived).await);
        assert!(!prefs.is_stored().await);
    }
}
