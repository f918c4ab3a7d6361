use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{LiveError, LiveResult};
use crate::identity::IdentityProvider;
use crate::store::RemoteStore;

/// Shared collaborators handed to every component.
#[derive(Clone)]
pub struct LiveContext {
    pub store: Arc<dyn RemoteStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<EngineConfig>,
}

impl LiveContext {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self { store, identity, clock, config: Arc::new(config) }
    }

    pub fn actor_id(&self) -> LiveResult<Uuid> {
        self.identity.current_actor_id().ok_or(LiveError::NotAuthenticated)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for LiveContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveContext")
            .field("actor", &self.identity.current_actor_id())
            .field("config", &self.config)
            .finish()
    }
}
