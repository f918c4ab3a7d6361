//! Collaborative sessions and their rosters.
//!
//! Creating a session is one logical unit: the session row and the host's
//! participant row. If the second insert fails the session row is deleted
//! again, so callers get either a usable session id or an error.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::context::LiveContext;
use crate::coordinator::{ChangeListener, SubscriptionCoordinator, SubscriptionScope, SubscriptionToken};
use crate::error::{LiveError, LiveResult, StoreError};
use crate::model::{
    CollaborativeSession, ConnectionStatus, EntityRef, JsonMap, ParticipantRole, Record,
    SessionParticipant, SessionStatus,
};
use crate::state::ViewState;
use crate::store::{row, row_uuid, ChangeEvent, ChangeKind, Filter, Row, Table};

const PARTICIPANT_KEY: &[&str] = &["session_id", "user_id"];

/// Optional fields for [`SessionManager::create`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub description: Option<String>,
    pub related_entity: Option<EntityRef>,
    pub settings: JsonMap,
}

// ───────────────────────────────────────────────────────────────────
// Cache
// ───────────────────────────────────────────────────────────────────

/// Sessions by id and participants by `(session, user)`.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    sessions: HashMap<Uuid, CollaborativeSession>,
    participants: HashMap<(Uuid, Uuid), SessionParticipant>,
}

impl SessionCache {
    /// Keep the newer of the cached and incoming session by `updated_at`.
    pub fn merge_session(&mut self, session: CollaborativeSession) -> bool {
        match self.sessions.get(&session.id) {
            Some(existing) if existing.updated_at > session.updated_at => false,
            _ => {
                self.sessions.insert(session.id, session);
                true
            }
        }
    }

    /// One row per `(session, user)`; a later write replaces the earlier one.
    pub fn merge_participant(&mut self, participant: SessionParticipant) {
        self.participants
            .insert((participant.session_id, participant.user_id), participant);
    }

    /// Drop a session together with its roster.
    pub fn remove_session(&mut self, id: Uuid) {
        self.sessions.remove(&id);
        self.participants.retain(|(session_id, _), _| *session_id != id);
    }

    pub fn remove_participant(&mut self, session_id: Uuid, user_id: Uuid) {
        self.participants.remove(&(session_id, user_id));
    }

    pub fn session(&self, id: Uuid) -> Option<&CollaborativeSession> {
        self.sessions.get(&id)
    }

    pub fn participant(&self, session_id: Uuid, user_id: Uuid) -> Option<&SessionParticipant> {
        self.participants.get(&(session_id, user_id))
    }

    pub fn contains_session(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Sessions, most recently updated first.
    pub fn sessions(&self) -> Vec<CollaborativeSession> {
        let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Roster of one session, in join order.
    pub fn participants(&self, session_id: Uuid) -> Vec<SessionParticipant> {
        let mut roster: Vec<_> = self
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        roster.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        roster
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.participants.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

struct SessionState {
    cache: SessionCache,
    view: ViewState,
}

struct SessionInner {
    ctx: LiveContext,
    coordinator: Arc<SubscriptionCoordinator>,
    state: RwLock<SessionState>,
    subscriptions: Mutex<Vec<SubscriptionToken>>,
}

/// Sessions the current user hosts or participates in. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(ctx: LiveContext, coordinator: Arc<SubscriptionCoordinator>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                ctx,
                coordinator,
                state: RwLock::new(SessionState { cache: SessionCache::default(), view: ViewState::default() }),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to session and participant changes, then load the user's
    /// sessions.
    ///
    /// Change events for sessions the user is not part of are dropped, except
    /// for the user's own participant rows, which pull in their session.
    pub async fn activate(&self) -> LiveResult<()> {
        self.inner.ctx.actor_id()?;
        {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            if subscriptions.is_empty() {
                for table in [Table::CollaborativeSessions, Table::SessionParticipants] {
                    let listener: Arc<dyn ChangeListener> = self.inner.clone();
                    let token = self
                        .inner
                        .coordinator
                        .subscribe(SubscriptionScope::all(table, Filter::new()), listener)
                        .await;
                    subscriptions.push(token);
                }
            }
        }
        self.inner.load().await
    }

    /// Release both subscriptions. The cache is left as it was.
    pub async fn deactivate(&self) {
        let tokens: Vec<_> = self.inner.subscriptions.lock().await.drain(..).collect();
        for token in tokens {
            self.inner.coordinator.release(token).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        !self.inner.subscriptions.lock().await.is_empty()
    }

    /// Create a session hosted by the current user. Returns its id.
    pub async fn create(
        &self,
        name: impl Into<String>,
        session_type: impl Into<String>,
        options: SessionOptions,
    ) -> LiveResult<Uuid> {
        let actor = self.inner.ctx.actor_id()?;
        let now = self.inner.ctx.now();
        let session = CollaborativeSession {
            id: Uuid::new_v4(),
            name: name.into(),
            description: options.description,
            session_type: session_type.into(),
            related_entity: options.related_entity,
            host_id: actor,
            status: SessionStatus::Active,
            settings: options.settings,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        let host = SessionParticipant {
            session_id: session.id,
            user_id: actor,
            role: ParticipantRole::Host,
            permissions: JsonMap::new(),
            joined_at: now,
            last_activity: now,
            connection_status: ConnectionStatus::Active,
        };

        let store = &self.inner.ctx.store;
        let stored = store
            .insert(Table::CollaborativeSessions, session.to_row()?)
            .await
            .map_err(LiveError::write(Table::CollaborativeSessions))?;
        let stored = CollaborativeSession::from_row(stored)?;

        let host = match store.upsert(Table::SessionParticipants, host.to_row()?, PARTICIPANT_KEY).await {
            Ok(row) => SessionParticipant::from_row(row)?,
            Err(e) => {
                log::warn!("host insert for session {} failed, removing session: {e}", stored.id);
                return Err(self.inner.compensate_create(stored.id, e).await);
            }
        };

        let mut state = self.inner.state.write().await;
        state.cache.merge_session(stored.clone());
        state.cache.merge_participant(host);
        log::info!("created session {} ({})", stored.id, stored.session_type);
        Ok(stored.id)
    }

    /// Join (or re-join) a session. Re-joining updates role and status in place.
    pub async fn join(&self, session_id: Uuid, role: ParticipantRole) -> LiveResult<SessionParticipant> {
        let actor = self.inner.ctx.actor_id()?;
        let now = self.inner.ctx.now();
        let joined_at = {
            let state = self.inner.state.read().await;
            if let Some(session) = state.cache.session(session_id) {
                if session.status.is_terminal() {
                    return Err(LiveError::PermissionDenied(format!(
                        "session {session_id} is {}",
                        session.status
                    )));
                }
            }
            state
                .cache
                .participant(session_id, actor)
                .map(|p| p.joined_at)
                .unwrap_or(now)
        };

        let participant = SessionParticipant {
            session_id,
            user_id: actor,
            role,
            permissions: JsonMap::new(),
            joined_at,
            last_activity: now,
            connection_status: ConnectionStatus::Active,
        };
        let mut patch = participant.to_row()?;
        if joined_at != now {
            patch.remove("permissions");
        }
        let stored = self
            .inner
            .ctx
            .store
            .upsert(Table::SessionParticipants, patch, PARTICIPANT_KEY)
            .await
            .map_err(LiveError::write(Table::SessionParticipants))?;
        let stored = SessionParticipant::from_row(stored)?;
        self.inner.state.write().await.cache.merge_participant(stored.clone());
        Ok(stored)
    }

    /// Mark the current user disconnected from a session.
    pub async fn leave(&self, session_id: Uuid) -> LiveResult<SessionParticipant> {
        let now = self.inner.ctx.now();
        self.inner
            .patch_own_participation(
                session_id,
                row(json!({ "connection_status": ConnectionStatus::Disconnected, "last_activity": now })),
            )
            .await
    }

    /// Refresh the current user's `last_activity` in a session.
    pub async fn touch(&self, session_id: Uuid) -> LiveResult<SessionParticipant> {
        let now = self.inner.ctx.now();
        self.inner
            .patch_own_participation(
                session_id,
                row(json!({ "connection_status": ConnectionStatus::Active, "last_activity": now })),
            )
            .await
    }

    /// Host-only status change. Completed and cancelled sessions cannot change again.
    pub async fn set_status(&self, session_id: Uuid, status: SessionStatus) -> LiveResult<CollaborativeSession> {
        let actor = self.inner.ctx.actor_id()?;
        let session = self.inner.session_or_fetch(session_id).await?;
        if session.host_id != actor {
            return Err(LiveError::PermissionDenied(format!(
                "only the host can change session {session_id}"
            )));
        }
        if session.status == status {
            return Ok(session);
        }
        if !session.status.can_transition_to(status) {
            return Err(LiveError::OrderViolation {
                entity: session_id,
                from: session.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = self.inner.ctx.now();
        let mut patch = row(json!({ "status": status, "updated_at": now }));
        if status.is_terminal() {
            patch.insert("ended_at".into(), json!(now));
        }
        let rows = self
            .inner
            .ctx
            .store
            .update(Table::CollaborativeSessions, &Filter::new().eq("id", session_id), patch)
            .await
            .map_err(LiveError::write(Table::CollaborativeSessions))?;
        let Some(updated) = rows.into_iter().next() else {
            return Err(LiveError::NotFound(format!("session {session_id}")));
        };
        let updated = CollaborativeSession::from_row(updated)?;
        self.inner.state.write().await.cache.merge_session(updated.clone());
        log::info!("session {session_id} is now {status}");
        Ok(updated)
    }

    /// Bulk-fetch the sessions the current user participates in, with their rosters.
    pub async fn load(&self) -> LiveResult<()> {
        self.inner.load().await
    }

    /// Cached sessions, most recently updated first.
    pub async fn sessions(&self) -> Vec<CollaborativeSession> {
        self.inner.state.read().await.cache.sessions()
    }

    pub async fn session(&self, id: Uuid) -> Option<CollaborativeSession> {
        self.inner.state.read().await.cache.session(id).cloned()
    }

    /// Roster of `session_id` in join order, including participants who left.
    pub async fn participants(&self, session_id: Uuid) -> Vec<SessionParticipant> {

        self.inner.state.read().await.cache.participants(session_id)
    }

    pub async fn state(&self) -> ViewState {
        self.inner.state.read().await.view.clone()
    }
}

impl SessionInner {
    /// Undo a session insert whose host row failed. Returns the error to report.
    async fn compensate_create(&self, session_id: Uuid, cause: StoreError) -> LiveError {
        let deleted = self
            .ctx
            .store
            .delete(Table::CollaborativeSessions, &Filter::new().eq("id", session_id))
            .await;
        match deleted {
            Ok(_) => LiveError::Write { table: Table::SessionParticipants, source: cause },
            Err(e) => {
                log::error!("session {session_id} stranded without host: {e}");
                LiveError::Write {
                    table: Table::CollaborativeSessions,
                    source: StoreError::Rejected(format!(
                        "session {session_id} left without a host ({cause}); cleanup failed: {e}"
                    )),
                }
            }
        }
    }

    async fn patch_own_participation(&self, session_id: Uuid, patch: Row) -> LiveResult<SessionParticipant> {
        let actor = self.ctx.actor_id()?;
        let filter = Filter::new().eq("session_id", session_id).eq("user_id", actor);
        let rows = self
            .ctx
            .store
            .update(Table::SessionParticipants, &filter, patch)
            .await
            .map_err(LiveError::write(Table::SessionParticipants))?;
        let Some(updated) = rows.into_iter().next() else {
            return Err(LiveError::NotFound(format!("participation in session {session_id}")));
        };
        let updated = SessionParticipant::from_row(updated)?;
        self.state.write().await.cache.merge_participant(updated.clone());
        Ok(updated)
    }

    async fn session_or_fetch(&self, session_id: Uuid) -> LiveResult<CollaborativeSession> {
        if let Some(session) = self.state.read().await.cache.session(session_id) {
            return Ok(session.clone());
        }
        let rows = self
            .ctx
            .store
            .select(Table::CollaborativeSessions, &Filter::new().eq("id", session_id), None, Some(1))
            .await
            .map_err(LiveError::fetch(Table::CollaborativeSessions))?;
        let Some(row) = rows.into_iter().next() else {
            return Err(LiveError::NotFound(format!("session {session_id}")));
        };
        let session = CollaborativeSession::from_row(row)?;
        self.state.write().await.cache.merge_session(session.clone());
        Ok(session)
    }

    async fn load(&self) -> LiveResult<()> {
        let actor = self.ctx.actor_id()?;
        self.state.write().await.view.begin_load();

        let fetched = self.fetch_for(actor).await;
        let mut state = self.state.write().await;
        match fetched {
            Ok((sessions, participants)) => {
                log::info!(
                    "loaded {} session(s) with {} participant row(s)",
                    sessions.len(),
                    participants.len()
                );
                state.cache.clear();
                for session in sessions {
                    state.cache.merge_session(session);
                }
                for participant in participants {
                    state.cache.merge_participant(participant);
                }
                state.view.load_succeeded();
                Ok(())
            }
            Err(e) => {
                log::error!("session load failed: {e}");
                state.cache.clear();
                state.view.load_failed(&e);
                Err(e)
            }
        }
    }

    async fn fetch_for(&self, actor: Uuid) -> LiveResult<(Vec<CollaborativeSession>, Vec<SessionParticipant>)> {
        let store = &self.ctx.store;
        let mine = store
            .select(Table::SessionParticipants, &Filter::new().eq("user_id", actor), None, None)
            .await
            .map_err(LiveError::fetch(Table::SessionParticipants))?;
        let ids: HashSet<Uuid> = mine.iter().filter_map(|r| row_uuid(r, "session_id")).collect();
        if ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let sessions = store
            .select(
                Table::CollaborativeSessions,
                &Filter::new().is_in("id", ids.iter().copied()),
                None,
                None,
            )
            .await
            .map_err(LiveError::fetch(Table::CollaborativeSessions))?;
        let roster = store
            .select(
                Table::SessionParticipants,
                &Filter::new().is_in("session_id", ids.iter().copied()),
                None,
                None,
            )
            .await
            .map_err(LiveError::fetch(Table::SessionParticipants))?;

        Ok((
            CollaborativeSession::from_rows(sessions)?,
            SessionParticipant::from_rows(roster)?,
        ))
    }

    async fn on_session_change(&self, event: &ChangeEvent) {
        if event.kind == ChangeKind::Delete {
            if let Some(id) = row_uuid(&event.row, "id") {
                self.state.write().await.cache.remove_session(id);
            }
            return;
        }
        let session = match CollaborativeSession::from_row(event.row.clone()) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("ignoring session change: {e}");
                return;
            }
        };
        let actor = self.ctx.identity.current_actor_id();
        let mut state = self.state.write().await;
        if state.cache.contains_session(session.id) || Some(session.host_id) == actor {
            state.cache.merge_session(session);
        }
    }

    async fn on_participant_change(&self, event: &ChangeEvent) {
        let (Some(session_id), Some(user_id)) =
            (row_uuid(&event.row, "session_id"), row_uuid(&event.row, "user_id"))
        else {
            return;
        };
        if event.kind == ChangeKind::Delete {
            self.state.write().await.cache.remove_participant(session_id, user_id);
            return;
        }
        let participant = match SessionParticipant::from_row(event.row.clone()) {
            Ok(participant) => participant,
            Err(e) => {
                log::warn!("ignoring participant change: {e}");
                return;
            }
        };

        let actor = self.ctx.identity.current_actor_id();
        let tracked = self.state.read().await.cache.contains_session(session_id);
        if !tracked && Some(user_id) == actor {
            // Added to a session from elsewhere: pull the session row in.
            if let Err(e) = self.session_or_fetch(session_id).await {
                log::warn!("could not fetch session {session_id} after being added: {e}");
                return;
            }
        } else if !tracked {
            return;
        }
        self.state.write().await.cache.merge_participant(participant);
    }
}

#[async_trait]
impl ChangeListener for SessionInner {
    async fn on_change(&self, event: &ChangeEvent) {
        match event.table {
            Table::CollaborativeSessions => self.on_session_change(event).await,
            Table::SessionParticipants => self.on_participant_change(event).await,
            _ => {}
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
    use crate::store::{MemoryStore, Operation, RemoteStore};

    fn manager_for(store: Arc<MemoryStore>, actor: Uuid) -> SessionManager {
        let config = EngineConfig::for_testing();
        let coordinator = Arc::new(SubscriptionCoordinator::new(store.clone(), config.backoff()));
        let ctx = LiveContext::new(
            store,
            Arc::new(StaticIdentity::member(actor)),
            Arc::new(SystemClock),
            config,
        );
        SessionManager::new(ctx, coordinator)
    }

    #[tokio::test]
    async fn test_create_inserts_session_and_host() {
        let store = Arc::new(MemoryStore::default());
        let host = Uuid::new_v4();
        let sessions = manager_for(store.clone(), host);

        let id = sessions.create("Review", "design_review", SessionOptions::default()).await.unwrap();

        let roster = sessions.participants(id).await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].role, ParticipantRole::Host);
        assert_eq!(store.rows(Table::CollaborativeSessions).await.len(), 1);
        assert_eq!(store.rows(Table::SessionParticipants).await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_compensates_when_host_insert_fails() {
        let store = Arc::new(MemoryStore::default());
        store.fail(Table::SessionParticipants, Operation::Upsert);
        let sessions = manager_for(store.clone(), Uuid::new_v4());

        let err = sessions.create("Review", "design_review", SessionOptions::default()).await.unwrap_err();
        assert!(err.is_write_failure());
        assert!(store.rows(Table::CollaborativeSessions).await.is_empty());
        assert!(sessions.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_compensation_names_stranded_session() {
        let store = Arc::new(MemoryStore::default());
        store.fail(Table::SessionParticipants, Operation::Upsert);
        store.fail(Table::CollaborativeSessions, Operation::Delete);
        let sessions = manager_for(store.clone(), Uuid::new_v4());

        let err = sessions.create("Review", "design_review", SessionOptions::default()).await.unwrap_err();
        let stranded = CollaborativeSession::from_row(store.rows(Table::CollaborativeSessions).await[0].clone()).unwrap();
        assert!(matches!(err, LiveError::Write { table: Table::CollaborativeSessions, .. }));
        assert!(err.to_string().contains(&stranded.id.to_string()));
    }

    #[tokio::test]
    async fn test_rejoin_updates_in_place() {
        let store = Arc::new(MemoryStore::default());
        let host = Uuid::new_v4();
        let sessions = manager_for(store.clone(), host);
        let id = sessions.create("Review", "design_review", SessionOptions::default()).await.unwrap();

        let joined = sessions.join(id, ParticipantRole::Moderator).await.unwrap();
        assert_eq!(joined.role, ParticipantRole::Moderator);

        let rows = store
            .select(Table::SessionParticipants, &Filter::new().eq("session_id", id), None, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(sessions.participants(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_and_touch() {
        let store = Arc::new(MemoryStore::default());
        let sessions = manager_for(store.clone(), Uuid::new_v4());
        let id = sessions.create("Pairing", "pairing", SessionOptions::default()).await.unwrap();

        let left = sessions.leave(id).await.unwrap();
        assert_eq!(left.connection_status, ConnectionStatus::Disconnected);
        let back = sessions.touch(id).await.unwrap();
        assert_eq!(back.connection_status, ConnectionStatus::Active);

        let missing = sessions.leave(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, LiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_roster_keeps_departed_participant() {
        let store = Arc::new(MemoryStore::default());
        let host = manager_for(store.clone(), Uuid::new_v4());
        let id = host.create("Standup", "meeting", SessionOptions::default()).await.unwrap();

        let guest_id = Uuid::new_v4();
        let guest = manager_for(store.clone(), guest_id);
        guest.join(id, ParticipantRole::Participant).await.unwrap();
        guest.leave(id).await.unwrap();

        let roster = guest.participants(id).await;
        let departed = roster.iter().find(|p| p.user_id == guest_id).unwrap();
        assert_eq!(departed.connection_status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_only_host_changes_status() {
        let store = Arc::new(MemoryStore::default());
        let host = manager_for(store.clone(), Uuid::new_v4());
        let id = host.create("Review", "design_review", SessionOptions::default()).await.unwrap();

        let guest = manager_for(store.clone(), Uuid::new_v4());
        guest.join(id, ParticipantRole::Participant).await.unwrap();
        let err = guest.set_status(id, SessionStatus::Cancelled).await.unwrap_err();
        assert!(matches!(err, LiveError::PermissionDenied(_)));

        let done = host.set_status(id, SessionStatus::Completed).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.ended_at.is_some());

        let err = host.set_status(id, SessionStatus::Active).await.unwrap_err();
        assert!(err.is_order_violation());
    }

    #[tokio::test]
    async fn test_load_scopes_to_participation() {
        let store = Arc::new(MemoryStore::default());
        let me = Uuid::new_v4();
        let other = manager_for(store.clone(), Uuid::new_v4());
        let mine = other.create("Mine", "sync", SessionOptions::default()).await.unwrap();
        let _theirs = other.create("Theirs", "sync", SessionOptions::default()).await.unwrap();

        let sessions = manager_for(store.clone(), me);
        sessions.join(mine, ParticipantRole::Observer).await.unwrap();
        sessions.load().await.unwrap();

        let loaded = sessions.sessions().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, mine);
        assert_eq!(sessions.participants(mine).await.len(), 2);
    }
}
