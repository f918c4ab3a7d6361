use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{EntityRef, JsonMap, Record};
use crate::store::Table;

/// What happened, from the recipient's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    MessageReceived,
    DeliverableCreated,
    DeliverableApproved,
    DeliverableRejected,
    DeadlineApproaching,
    ProjectAssigned,
    ProjectUpdated,
    FileShared,
    #[serde(other)]
    Other,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 9] = [
        ActivityKind::MessageReceived,
        ActivityKind::DeliverableCreated,
        ActivityKind::DeliverableApproved,
        ActivityKind::DeliverableRejected,
        ActivityKind::DeadlineApproaching,
        ActivityKind::ProjectAssigned,
        ActivityKind::ProjectUpdated,
        ActivityKind::FileShared,
        ActivityKind::Other,
    ];
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityKind::MessageReceived => "message_received",
            ActivityKind::DeliverableCreated => "deliverable_created",
            ActivityKind::DeliverableApproved => "deliverable_approved",
            ActivityKind::DeliverableRejected => "deliverable_rejected",
            ActivityKind::DeadlineApproaching => "deadline_approaching",
            ActivityKind::ProjectAssigned => "project_assigned",
            ActivityKind::ProjectUpdated => "project_updated",
            ActivityKind::FileShared => "file_shared",
            ActivityKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// One entry in a user's activity feed.
///
/// `read` only ever moves from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityItem {
    pub id: Uuid,
    /// Recipient.
    pub user_id: Uuid,
    /// Who caused the activity; `None` for system-generated entries.
    #[serde(default)]
    pub actor_id: Option<Uuid>,
    #[serde(rename = "activity_type")]
    pub kind: ActivityKind,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub related_entity: Option<EntityRef>,
    #[serde(default)]
    pub read: bool,
    /// 1 is most urgent.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

impl Record for ActivityItem {
    const TABLE: Table = Table::ActivityFeed;
}

impl ActivityItem {
    pub fn is_high_priority(&self, threshold: u8) -> bool {
        self.priority <= threshold
    }
}

/// The caller-supplied part of a new activity item.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityDraft {
    pub kind: ActivityKind,
    pub title: String,
    pub description: Option<String>,
    pub metadata: JsonMap,
    pub related_entity: Option<EntityRef>,
    pub priority: u8,
}

impl ActivityDraft {
    pub fn new(kind: ActivityKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            description: None,
            metadata: JsonMap::new(),
            related_entity: None,
            priority: 3,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(1);
        self
    }

    pub fn related_to(mut self, entity: EntityRef) -> Self {
        self.related_entity = Some(entity);
        self
    }

    pub fn metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn into_item(
        self,
        user_id: Uuid,
        actor_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> ActivityItem {
        ActivityItem {
            id: Uuid::new_v4(),
            user_id,
            actor_id,
            kind: self.kind,
            title: self.title,
            description: self.description,
            metadata: self.metadata,
            related_entity: self.related_entity,
            read: false,
            priority: self.priority,
            created_at,
        }
    }
}
