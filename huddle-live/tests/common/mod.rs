//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use huddle_live::{
    ActivityItem, ActivityKind, EngineConfig, JsonMap, LiveEngine, ManualClock, MemoryBlobStore,
    MemoryStore, StaticIdentity,
};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(Duration::from_secs(2), async {
        loop {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for: {what}");
}

/// One signed-in client: an engine over a store that other clients may share.
pub struct Client {
    pub user: Uuid,
    pub identity: Arc<StaticIdentity>,
    pub engine: LiveEngine,
}

/// A store, a blob bucket and a manual clock shared by every client built from it.
pub struct Backend {
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub clock: Arc<ManualClock>,
    pub config: EngineConfig,
}

impl Backend {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::for_testing())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_logging();
        Self {
            store: Arc::new(MemoryStore::default()),
            blobs: Arc::new(MemoryBlobStore::new("shared-files")),
            clock: Arc::new(ManualClock::new(t0())),
            config,
        }
    }

    pub fn client(&self) -> Client {
        let user = Uuid::new_v4();
        let identity = Arc::new(StaticIdentity::member(user));
        let engine = LiveEngine::with_clock(
            self.store.clone(),
            self.blobs.clone(),
            identity.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
        .expect("valid test config");
        Client { user, identity, engine }
    }
}

pub fn activity(user: Uuid, priority: u8, read: bool, created_at: DateTime<Utc>) -> ActivityItem {
    ActivityItem {
        id: Uuid::new_v4(),
        user_id: user,
        actor_id: None,
        kind: ActivityKind::ProjectUpdated,
        title: format!("p{priority} update"),
        description: None,
        metadata: JsonMap::new(),
        related_entity: None,
        read,
        priority,
        created_at,
    }
}
