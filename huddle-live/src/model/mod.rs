//! Entities mirrored from the Remote Store.
//!
//! Every entity is owned by the store; the engine holds a transient,
//! best-effort copy. Enums serialize in `snake_case` to match column values.

pub mod activity;
pub mod file;
pub mod message;
pub mod preferences;
pub mod presence;
pub mod session;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{LiveError, LiveResult};
use crate::store::{Row, Table};

pub use activity::{ActivityDraft, ActivityItem, ActivityKind};
pub use file::{AccessLevel, FileType, SharedFile};
pub use message::{DeliveryStatus, Message, MessageStatus};
pub use preferences::{DigestFrequency, NotificationChannel, NotificationPreferences, QuietHours};
pub use presence::{PresenceRecord, PresenceStatus};
pub use session::{
    CollaborativeSession, ConnectionStatus, ParticipantRole, SessionParticipant, SessionStatus,
};

/// Free-form JSON object column (metadata, settings, permissions, context).
pub type JsonMap = serde_json::Map<String, Value>;

/// Reference to a domain entity elsewhere in the product (project, deliverable, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
        }
    }
}

/// Binds a typed entity to its table and converts it to and from rows.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: Table;

    fn to_row(&self) -> LiveResult<Row> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(LiveError::InvalidRecord(format!(
                "{} encoded as non-object {other}",
                Self::TABLE
            ))),
        }
    }

    fn from_row(row: Row) -> LiveResult<Self> {
        serde_json::from_value(Value::Object(row))
            .map_err(|e| LiveError::InvalidRecord(format!("{}: {e}", Self::TABLE)))
    }

    /// Decode a batch of rows, failing on the first bad one.
    fn from_rows(rows: Vec<Row>) -> LiveResult<Vec<Self>> {
        rows.into_iter().map(Self::from_row).collect()
    }
}
