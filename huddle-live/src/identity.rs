//! Who is acting. Authentication happens elsewhere; the engine only asks.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Admin,
    Member,
    Guest,
}

pub trait IdentityProvider: Send + Sync {
    /// `None` when nobody is signed in.
    fn current_actor_id(&self) -> Option<Uuid>;

    fn current_actor_role(&self) -> ActorRole;
}

/// Fixed identity, switchable at runtime (sign-in / sign-out).
#[derive(Debug)]
pub struct StaticIdentity {
    actor: RwLock<Option<(Uuid, ActorRole)>>,
}

impl StaticIdentity {
    pub fn new(actor_id: Uuid, role: ActorRole) -> Self {
        Self { actor: RwLock::new(Some((actor_id, role))) }
    }

    pub fn member(actor_id: Uuid) -> Self {
        Self::new(actor_id, ActorRole::Member)
    }

    pub fn anonymous() -> Self {
        Self { actor: RwLock::new(None) }
    }

    pub fn sign_in(&self, actor_id: Uuid, role: ActorRole) {
        *self.actor.write().unwrap_or_else(|p| p.into_inner()) = Some((actor_id, role));
    }

    pub fn sign_out(&self) {
        *self.actor.write().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_actor_id(&self) -> Option<Uuid> {
        self.actor.read().unwrap_or_else(|p| p.into_inner()).map(|(id, _)| id)
    }

    fn current_actor_role(&self) -> ActorRole {
        self.actor
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .map(|(_, role)| role)
            .unwrap_or(ActorRole::Guest)
    }
}
