//! One entry point for the whole live layer.
//!
//! [`LiveEngine`] wires every component to a single [`EngineConfig`], one
//! [`SubscriptionCoordinator`] and one clock, and drives their lifecycle:
//!
//! - `activate()` loads each component, opens its change subscriptions,
//!   announces `online` and starts the presence heartbeat.
//! - `shutdown()` stops the heartbeat, closes every subscription and writes
//!   `offline` on a best-effort basis.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::LiveContext;
use crate::coordinator::SubscriptionCoordinator;
use crate::delivery::DeliveryTracker;
use crate::error::LiveResult;
use crate::feed::ActivityFeed;
use crate::files::FileRegistry;
use crate::identity::IdentityProvider;
use crate::model::PresenceRecord;
use crate::preferences::PreferencesManager;
use crate::presence::{PresenceHandle, PresenceManager, Visibility};
use crate::sessions::SessionManager;
use crate::store::{BlobStore, RemoteStore};

/// One client's realtime surface: every component wired to a shared store,
/// identity and subscription coordinator.
///
/// ```ignore
/// let engine = LiveEngine::new(store, blobs, identity, EngineConfig::default())?;
/// engine.activate().await?;
/// let unread = engine.feed().unread_count().await;
/// engine.shutdown().await;
/// ```
pub struct LiveEngine {
    ctx: LiveContext,
    coordinator: Arc<SubscriptionCoordinator>,
    feed: ActivityFeed,
    presence: PresenceManager,
    delivery: DeliveryTracker,
    sessions: SessionManager,
    files: FileRegistry,
    preferences: PreferencesManager,
    heartbeat: Mutex<Option<PresenceHandle>>,
}

impl LiveEngine {
    /// Build an engine on the system clock. Fails if `config` does not validate.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
        config: EngineConfig,
    ) -> LiveResult<Self> {
        Self::with_clock(store, blobs, identity, Arc::new(SystemClock), config)
    }

    /// Like [`new`](Self::new) with an explicit time source.
    pub fn with_clock(
        store: Arc<dyn RemoteStore>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> LiveResult<Self> {
        config.validate()?;
        let coordinator = Arc::new(SubscriptionCoordinator::new(store.clone(), config.backoff()));
        let ctx = LiveContext::new(store, identity, clock, config);

        Ok(Self {
            feed: ActivityFeed::new(ctx.clone(), coordinator.clone()),
            presence: PresenceManager::new(ctx.clone(), coordinator.clone()),
            delivery: DeliveryTracker::new(ctx.clone(), coordinator.clone()),
            sessions: SessionManager::new(ctx.clone(), coordinator.clone()),
            files: FileRegistry::new(ctx.clone(), coordinator.clone(), blobs),
            preferences: PreferencesManager::new(ctx.clone(), coordinator.clone()),
            heartbeat: Mutex::new(None),
            coordinator,
            ctx,
        })
    }

    /// Bring every component up.
    ///
    /// A component that fails to load keeps its error flag and stays
    /// subscribed; the first such error is returned after all components
    /// have been attempted.
    pub async fn activate(&self) -> LiveResult<()> {
        let actor = self.ctx.actor_id()?;
        log::info!("activating live engine for {actor}");

        let results = [
            ("presence", self.presence.activate().await),
            ("feed", self.feed.activate().await),
            ("delivery", self.delivery.activate().await),
            ("sessions", self.sessions.activate().await),
            ("files", self.files.activate().await),
            ("preferences", self.preferences.activate().await),
        ];

        {
            let mut heartbeat = self.heartbeat.lock().await;
            if !heartbeat.as_ref().is_some_and(PresenceHandle::is_running) {
                *heartbeat = Some(self.presence.start_heartbeat());
            }
        }

        let mut first_error = None;
        for (component, result) in results {
            if let Err(e) = result {
                log::warn!("{component} activation incomplete: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the heartbeat, close every subscription and go offline.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.dispose().await;
        }
        self.feed.deactivate().await;
        self.presence.deactivate().await;
        self.delivery.deactivate().await;
        self.sessions.deactivate().await;
        self.files.deactivate().await;
        self.preferences.deactivate().await;
        self.coordinator.shutdown().await;
        log::info!("live engine shut down");
    }

    /// Forward a foreground/background change to presence.
    pub async fn set_visibility(&self, visibility: Visibility) -> LiveResult<PresenceRecord> {

        self.presence.set_visibility(visibility).await
    }

    pub async fn heartbeat_running(&self) -> bool {
        self.heartbeat.lock().await.as_ref().is_some_and(PresenceHandle::is_running)
    }

    pub fn feed(&self) -> &ActivityFeed {
        &self.feed
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn delivery(&self) -> &DeliveryTracker {
        &self.delivery
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn preferences(&self) -> &PreferencesManager {
        &self.preferences
    }

    pub fn coordinator(&self) -> &Arc<SubscriptionCoordinator> {
        &self.coordinator
    }

    pub fn context(&self) -> &LiveContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }
}
