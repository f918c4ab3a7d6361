use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{EntityRef, JsonMap, Record};
use crate::store::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Terminal states have no exits; every other move is allowed.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        !self.is_terminal() && *self != next
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    Moderator,
    Participant,
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Away,
    Disconnected,
}

/// An ad-hoc multi-party working session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeSession {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub session_type: String,
    #[serde(default)]
    pub related_entity: Option<EntityRef>,
    pub host_id: Uuid,
    pub status: SessionStatus,
    #[serde(default)]
    pub settings: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Record for CollaborativeSession {
    const TABLE: Table = Table::CollaborativeSessions;
}

/// Roster row; `(session_id, user_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParticipant {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    #[serde(default)]
    pub permissions: JsonMap,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connection_status: ConnectionStatus,
}

impl Record for SessionParticipant {
    const TABLE: Table = Table::SessionParticipants;
}
