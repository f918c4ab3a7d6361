//! Message delivery state machine.
//!
//! ```text
//!   sent ──► delivered ──► read
//!     └───────────────────►┘
//! ```
//!
//! Status only moves forward. [`DeliveryTracker::advance`] rejects backward
//! moves with [`LiveError::OrderViolation`], treats a same-state request as
//! a no-op, and writes through to the store before touching the cache.
//! Remote updates are merged for messages this client authored or already
//! tracks, and never regress a cached status.
//!
//! Status rows carry no sender or recipient column, so the change
//! subscription covers the whole table and relevance is decided locally.
//! Every client receives every status change; the cost grows with total
//! message traffic rather than with this user's messages.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::context::LiveContext;
use crate::coordinator::{ChangeListener, SubscriptionCoordinator, SubscriptionScope, SubscriptionToken};
use crate::error::{LiveError, LiveResult, StoreError};
use crate::model::{DeliveryStatus, Message, MessageStatus, Record};
use crate::state::ViewState;
use crate::store::{row, ChangeEvent, ChangeKind, Filter, Table};

#[derive(Default)]
struct DeliveryState {
    statuses: HashMap<Uuid, MessageStatus>,
    /// Envelopes this client has seen, by message id.
    messages: HashMap<Uuid, Message>,
    view: ViewState,
}

impl DeliveryState {
    fn is_relevant(&self, message_id: Uuid, actor: Option<Uuid>) -> bool {
        if self.statuses.contains_key(&message_id) {
            return true;
        }
        match (self.messages.get(&message_id), actor) {
            (Some(message), Some(actor)) => message.sender_id == actor,
            _ => false,
        }
    }

    /// Merge a status without regressing. Returns `true` if the cache changed.
    fn merge(&mut self, incoming: MessageStatus) -> bool {
        match self.statuses.get_mut(&incoming.message_id) {
            Some(existing) => existing.merge(&incoming),
            None => {
                self.statuses.insert(incoming.message_id, incoming);
                true
            }
        }
    }
}

struct DeliveryInner {
    ctx: LiveContext,
    coordinator: Arc<SubscriptionCoordinator>,
    state: RwLock<DeliveryState>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

/// Per-message delivery status for messages this client sent or received.
/// Cheap to clone.
#[derive(Clone)]
pub struct DeliveryTracker {
    inner: Arc<DeliveryInner>,
}

impl DeliveryTracker {
    pub fn new(ctx: LiveContext, coordinator: Arc<SubscriptionCoordinator>) -> Self {
        Self {
            inner: Arc::new(DeliveryInner {
                ctx,
                coordinator,
                state: RwLock::new(DeliveryState::default()),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to status inserts and updates, then refresh every tracked
    /// message. Requires a signed-in actor.
    pub async fn activate(&self) -> LiveResult<()> {
        self.inner.ctx.actor_id()?;
        {
            let mut subscription = self.inner.subscription.lock().await;
            if subscription.is_none() {
                let scope = SubscriptionScope::new(
                    Table::MessageStatus,
                    &[ChangeKind::Insert, ChangeKind::Update],
                    Filter::new(),
                );
                let listener: Arc<dyn ChangeListener> = self.inner.clone();
                *subscription = Some(self.inner.coordinator.subscribe(scope, listener).await);
            }
        }
        self.inner.refresh().await
    }

    /// Release the status subscription. Tracked statuses stay cached.
    pub async fn deactivate(&self) {
        if let Some(token) = self.inner.subscription.lock().await.take() {
            self.inner.coordinator.release(token).await;
        }
    }

    /// Whether the status subscription is held.
    pub async fn is_active(&self) -> bool {

        self.inner.subscription.lock().await.is_some()
    }

    /// Register a message the current user just sent and create its `sent` status.
    pub async fn record_outgoing(&self, message: Message) -> LiveResult<MessageStatus> {
        let actor = self.inner.ctx.actor_id()?;
        if message.sender_id != actor {
            return Err(LiveError::PermissionDenied(format!(
                "message {} was not sent by {actor}",
                message.id
            )));
        }

        let status = MessageStatus::sent(message.id);
        let stored = self
            .inner
            .ctx
            .store
            .insert(Table::MessageStatus, status.to_row()?)
            .await
            .map_err(LiveError::write(Table::MessageStatus))?;
        let stored = MessageStatus::from_row(stored)?;

        let mut state = self.inner.state.write().await;
        state.messages.insert(message.id, message);
        state.merge(stored.clone());
        Ok(stored)
    }

    /// Register a message addressed to the current user and acknowledge delivery.
    pub async fn record_incoming(&self, message: Message) -> LiveResult<MessageStatus> {
        let actor = self.inner.ctx.actor_id()?;
        if message.recipient_id != actor {
            return Err(LiveError::PermissionDenied(format!(
                "message {} is not addressed to {actor}",
                message.id
            )));
        }
        let id = message.id;
        self.inner.state.write().await.messages.insert(id, message);
        self.advance(id, DeliveryStatus::Delivered).await
    }

    /// Move a message forward to `target`, stamping each state entered.
    ///
    /// Only the recipient may advance. Asking for the current state is a
    /// no-op and asking for an earlier one is [`LiveError::OrderViolation`].
    /// The store write only applies to a row still below `target`; if another
    /// client got there first, the stored row is re-read and merged instead.
    pub async fn advance(&self, message_id: Uuid, target: DeliveryStatus) -> LiveResult<MessageStatus> {
        let actor = self.inner.ctx.actor_id()?;
        if let Some(message) = self.inner.state.read().await.messages.get(&message_id) {
            if message.recipient_id != actor {
                return Err(LiveError::PermissionDenied(format!(
                    "only the recipient advances message {message_id}"
                )));
            }
        }

        let current = self.inner.current(message_id).await?;
        if target < current.status {
            return Err(LiveError::OrderViolation {
                entity: message_id,
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }
        if target == current.status {
            return Ok(current);
        }

        match self.inner.write_forward(&current, target).await {
            Ok(Some(stored)) => {
                let mut state = self.inner.state.write().await;
                state.merge(stored.clone());
                log::debug!("message {message_id} advanced {} -> {target}", current.status);
                Ok(state.statuses.get(&message_id).cloned().unwrap_or(stored))
            }
            Ok(None) => self.inner.reconcile(message_id, target).await,
            Err(e) => {
                log::warn!("advance {message_id} to {target} failed: {e}");
                self.inner.state.write().await.view.set_error(&e);
                Err(e)
            }
        }
    }

    /// Cached status of `message_id`. Never older than the last status this
    /// client wrote or observed.
    pub async fn status(&self, message_id: Uuid) -> Option<MessageStatus> {
        self.inner.state.read().await.statuses.get(&message_id).cloned()
    }

    /// The envelope of a message recorded through this tracker.
    pub async fn message(&self, message_id: Uuid) -> Option<Message> {

        self.inner.state.read().await.messages.get(&message_id).cloned()
    }

    /// The message `message_id` replies to, if it is a reply.
    pub async fn reply_parent(&self, message_id: Uuid) -> Option<Uuid> {
        self.inner
            .state
            .read()
            .await
            .messages
            .get(&message_id)
            .and_then(|m| m.reply_to)
    }

    /// Re-fetch the status of every tracked message.
    pub async fn refresh(&self) -> LiveResult<()> {
        self.inner.refresh().await
    }

    pub async fn state(&self) -> ViewState {
        self.inner.state.read().await.view.clone()
    }
}

impl DeliveryInner {
    /// Conditional forward write. Each update only matches a row still in a
    /// state below `target`, so a stale cache can never move the stored status
    /// backward. Returns `None` when no row was in a state it could advance.
    async fn write_forward(
        &self,
        current: &MessageStatus,
        target: DeliveryStatus,
    ) -> LiveResult<Option<MessageStatus>> {
        let now = self.ctx.now();
        let message_id = current.message_id;
        for from in DeliveryStatus::ALL.into_iter().filter(|s| *s >= current.status && *s < target) {
            let entered = MessageStatus { message_id, status: from, delivered_at: None, read_at: None }
                .advanced(target, now);
            let mut patch = row(json!({ "status": entered.status }));
            if from < DeliveryStatus::Delivered {
                patch.insert("delivered_at".into(), json!(entered.delivered_at));
            }
            if let Some(read_at) = entered.read_at {
                patch.insert("read_at".into(), json!(read_at));
            }
            let filter = Filter::new().eq("message_id", message_id).eq("status", from);
            let rows = self
                .ctx
                .store
                .update(Table::MessageStatus, &filter, patch)
                .await
                .map_err(LiveError::write(Table::MessageStatus))?;
            if let Some(updated) = rows.into_iter().next() {
                return MessageStatus::from_row(updated).map(Some);
            }
        }
        Ok(None)
    }

    /// Nothing matched a conditional write: look at what the store holds now.
    async fn reconcile(&self, message_id: Uuid, target: DeliveryStatus) -> LiveResult<MessageStatus> {
        let rows = self
            .ctx
            .store
            .select(Table::MessageStatus, &Filter::new().eq("message_id", message_id), None, Some(1))
            .await
            .map_err(LiveError::fetch(Table::MessageStatus))?;
        let Some(row) = rows.into_iter().next() else {
            return Err(LiveError::Write { table: Table::MessageStatus, source: StoreError::NotFound });
        };
        let stored = MessageStatus::from_row(row)?;
        let mut state = self.state.write().await;
        state.merge(stored.clone());
        let cached = state.statuses.get(&message_id).cloned().unwrap_or(stored);
        if cached.status > target {
            log::debug!("message {message_id} already {} elsewhere, not moving to {target}", cached.status);
            return Err(LiveError::OrderViolation {
                entity: message_id,
                from: cached.status.to_string(),
                to: target.to_string(),
            });
        }
        Ok(cached)
    }

    /// Cached status, or the stored one when this client has not seen it yet.
    async fn current(&self, message_id: Uuid) -> LiveResult<MessageStatus> {
        if let Some(status) = self.state.read().await.statuses.get(&message_id) {
            return Ok(status.clone());
        }
        let rows = self
            .ctx
            .store
            .select(Table::MessageStatus, &Filter::new().eq("message_id", message_id), None, Some(1))
            .await
            .map_err(LiveError::fetch(Table::MessageStatus))?;
        let Some(row) = rows.into_iter().next() else {
            return Err(LiveError::NotFound(format!("message status {message_id}")));
        };
        let status = MessageStatus::from_row(row)?;
        self.state.write().await.merge(status.clone());
        Ok(status)
    }

    async fn refresh(&self) -> LiveResult<()> {
        let ids: Vec<Uuid> = {
            let state = self.state.read().await;
            let mut ids: Vec<Uuid> = state.statuses.keys().copied().collect();
            ids.extend(state.messages.keys().filter(|id| !state.statuses.contains_key(*id)));
            ids
        };
        if ids.is_empty() {
            self.state.write().await.view.load_succeeded();
            return Ok(());
        }

        self.state.write().await.view.begin_load();
        let fetched = self
            .ctx
            .store
            .select(Table::MessageStatus, &Filter::new().is_in("message_id", ids), None, None)
            .await
            .map_err(LiveError::fetch(Table::MessageStatus));

        let mut state = self.state.write().await;
        match fetched {
            Ok(rows) => {
                let mut merged = 0;
                for row in rows {
                    match MessageStatus::from_row(row) {
                        Ok(status) => merged += usize::from(state.merge(status)),
                        Err(e) => log::warn!("skipping message status row: {e}"),
                    }
                }
                log::info!("refreshed message statuses, {merged} changed");
                state.view.load_succeeded();
                Ok(())
            }
            Err(e) => {
                log::error!("message status refresh failed: {e}");
                state.view.load_failed(&e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ChangeListener for DeliveryInner {
    async fn on_change(&self, event: &ChangeEvent) {
        let status = match MessageStatus::from_row(event.row.clone()) {
            Ok(status) => status,
            Err(e) => {
                log::warn!("ignoring message status change: {e}");
                return;
            }
        };
        let actor = self.ctx.identity.current_actor_id();
        let mut state = self.state.write().await;
        if state.is_relevant(status.message_id, actor) && state.merge(status.clone()) {
            log::debug!("message {} now {}", status.message_id, status.status);
        }
    }

    async fn on_stale(&self, error: &LiveError) {
        let mut state = self.state.write().await;
        state.view.mark_stale();
        state.view.set_error(error);
    }

    async fn on_resync(&self) {
        if self.refresh().await.is_ok() {
            self.state.write().await.view.clear_stale();
        }
    }
}
