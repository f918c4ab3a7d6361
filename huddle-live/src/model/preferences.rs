use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{ActivityKind, Record};
use crate::store::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Push,
    InApp,
}

impl NotificationChannel {
    /// Used for kinds missing from the channel's map.
    pub fn default_enabled(&self) -> bool {
        !matches!(self, NotificationChannel::Email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    Never,
    Realtime,
    Hourly,
    Daily,
    Weekly,
}

/// Daily window in the user's local time. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

/// Per-user notification settings. One row per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    #[serde(default)]
    pub email_notifications: BTreeMap<ActivityKind, bool>,
    #[serde(default)]
    pub push_notifications: BTreeMap<ActivityKind, bool>,
    #[serde(default)]
    pub in_app_notifications: BTreeMap<ActivityKind, bool>,
    pub digest_frequency: DigestFrequency,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    pub timezone: String,
}

impl Record for NotificationPreferences {
    const TABLE: Table = Table::NotificationPreferences;
}

impl NotificationPreferences {
    /// Defaults for a user with no stored row: in-app and push on for every
    /// kind, email only for deadlines and deliverable decisions.
    pub fn defaults_for(user_id: Uuid) -> Self {
        let all_on: BTreeMap<ActivityKind, bool> =
            ActivityKind::ALL.iter().map(|kind| (*kind, true)).collect();
        let email = ActivityKind::ALL
            .iter()
            .map(|kind| {
                let on = matches!(
                    kind,
                    ActivityKind::DeadlineApproaching
                        | ActivityKind::DeliverableApproved
                        | ActivityKind::DeliverableRejected
                        | ActivityKind::ProjectAssigned
                );
                (*kind, on)
            })
            .collect();

        Self {
            user_id,
            email_notifications: email,
            push_notifications: all_on.clone(),
            in_app_notifications: all_on,
            digest_frequency: DigestFrequency::Realtime,
            quiet_hours: None,
            timezone: "UTC".to_string(),
        }
    }

    fn channel_map(&self, channel: NotificationChannel) -> &BTreeMap<ActivityKind, bool> {
        match channel {
            NotificationChannel::Email => &self.email_notifications,
            NotificationChannel::Push => &self.push_notifications,
            NotificationChannel::InApp => &self.in_app_notifications,
        }
    }

    pub fn allows(&self, channel: NotificationChannel, kind: ActivityKind) -> bool {
        self.channel_map(channel)
            .get(&kind)
            .copied()
            .unwrap_or_else(|| channel.default_enabled())
    }

    pub fn set(&mut self, channel: NotificationChannel, kind: ActivityKind, enabled: bool) {
        let map = match channel {
            NotificationChannel::Email => &mut self.email_notifications,
            NotificationChannel::Push => &mut self.push_notifications,
            NotificationChannel::InApp => &mut self.in_app_notifications,
        };
        map.insert(kind, enabled);
    }

    pub fn in_quiet_hours(&self, local: NaiveTime) -> bool {
        self.quiet_hours.is_some_and(|q| q.contains(local))
    }
}
