use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Record;
use crate::store::Table;

/// Delivery state of a point-to-point message. Ordered: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 3] = [DeliveryStatus::Sent, DeliveryStatus::Delivered, DeliveryStatus::Read];
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatus {
    pub message_id: Uuid,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Record for MessageStatus {
    const TABLE: Table = Table::MessageStatus;
}

impl MessageStatus {
    pub fn sent(message_id: Uuid) -> Self {
        Self {
            message_id,
            status: DeliveryStatus::Sent,
            delivered_at: None,
            read_at: None,
        }
    }

    /// The status after entering `target` at `now`, stamping every state
    /// entered on the way. Caller guarantees `target > self.status`.
    pub(crate) fn advanced(&self, target: DeliveryStatus, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.status = target;
        if target >= DeliveryStatus::Delivered && next.delivered_at.is_none() {
            next.delivered_at = Some(now);
        }
        if target == DeliveryStatus::Read && next.read_at.is_none() {
            next.read_at = Some(now);
        }
        next
    }

    /// Merge a remote copy without ever moving backward.
    ///
    /// Returns `true` if anything changed.
    pub fn merge(&mut self, incoming: &MessageStatus) -> bool {
        if incoming.message_id != self.message_id || incoming.status < self.status {
            return false;
        }
        let before = self.clone();
        self.status = incoming.status;
        if self.delivered_at.is_none() {
            self.delivered_at = incoming.delivered_at;
        }
        if self.read_at.is_none() {
            self.read_at = incoming.read_at;
        }
        *self != before
    }
}

/// Envelope of a point-to-point message as seen by the delivery tracker.
///
/// `reply_to` names at most one ancestor; there is no ownership between messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(sender_id: Uuid, recipient_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            reply_to: None,
            created_at,
        }
    }

    pub fn replying_to(mut self, parent: Uuid) -> Self {
        self.reply_to = Some(parent);
        self
    }
}
