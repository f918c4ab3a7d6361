use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::{JsonMap, Record};
use crate::store::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// A user's self-reported presence. One row per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    #[serde(default)]
    pub current_activity: Option<String>,
    #[serde(default)]
    pub context: JsonMap,
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for PresenceRecord {
    const TABLE: Table = Table::UserPresence;
}

impl PresenceRecord {
    /// Whether `last_seen` lies within `window` of `now`.
    ///
    /// A `last_seen` ahead of `now` is clock skew: it counts as fresh only
    /// while it is at most `max_skew` in the future.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration, max_skew: Duration) -> bool {
        match (now - self.last_seen).to_std() {
            Ok(age) => age <= window,
            Err(_) => (self.last_seen - now).to_std().is_ok_and(|ahead| ahead <= max_skew),
        }
    }

    /// Online and fresh.
    pub fn is_live(&self, now: DateTime<Utc>, window: Duration, max_skew: Duration) -> bool {
        self.status == PresenceStatus::Online && self.is_fresh(now, window, max_skew)
    }
}
