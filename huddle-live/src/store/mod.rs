//! Remote Store boundary: relational tables plus a push-style change channel.
//!
//! ```text
//! ┌──────────────┐  select / insert / update / upsert / delete  ┌──────────────┐
//! │  Component   │ ────────────────────────────────────────────► │ RemoteStore  │
//! │  (cache)     │                                               │ (tables)     │
//! └──────▲───────┘                                               └──────┬───────┘
//!        │ ChangeListener::on_change                                    │
//!        │                                                              │ subscribe(table, kinds, filter)
//! ┌──────┴───────┐              ChangeStream (insert/update/delete)     │
//! │ Coordinator  │ ◄────────────────────────────────────────────────────┘
//! └──────────────┘
//! ```
//!
//! Rows cross the boundary as JSON objects ([`Row`]). Typed entities convert
//! through [`crate::model::Record`].

pub mod fanout;
pub mod memory;

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::StoreError;

pub use fanout::{ChangeFanout, FanoutRegistry, FanoutStats};
pub use memory::{MemoryBlobStore, MemoryStore, Operation};

/// A row as stored remotely: column name → JSON value.
pub type Row = Map<String, Value>;

// ───────────────────────────────────────────────────────────────────
// Tables
// ───────────────────────────────────────────────────────────────────

/// Entity tables the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    ActivityFeed,
    UserPresence,
    MessageStatus,
    CollaborativeSessions,
    SessionParticipants,
    SharedFiles,
    NotificationPreferences,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::ActivityFeed,
        Table::UserPresence,
        Table::MessageStatus,
        Table::CollaborativeSessions,
        Table::SessionParticipants,
        Table::SharedFiles,
        Table::NotificationPreferences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::ActivityFeed => "activity_feed",
            Table::UserPresence => "user_presence",
            Table::MessageStatus => "message_status",
            Table::CollaborativeSessions => "collaborative_sessions",
            Table::SessionParticipants => "session_participants",
            Table::SharedFiles => "shared_files",
            Table::NotificationPreferences => "notification_preferences",
        }
    }

    /// Columns that uniquely identify a row.
    pub fn primary_key(&self) -> &'static [&'static str] {
        match self {
            Table::UserPresence | Table::NotificationPreferences => &["user_id"],
            Table::MessageStatus => &["message_id"],
            Table::SessionParticipants => &["session_id", "user_id"],
            Table::ActivityFeed | Table::CollaborativeSessions | Table::SharedFiles => &["id"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Filters and ordering
// ───────────────────────────────────────────────────────────────────

/// A single column predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lte(String, Value),
}

impl Condition {
    pub fn column(&self) -> &str {
        match self {
            Condition::Eq(c, _) | Condition::In(c, _) | Condition::Gte(c, _) | Condition::Lte(c, _) => c,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(self.column()) else {
            return false;
        };
        match self {
            Condition::Eq(_, expected) => values_equal(actual, expected),
            Condition::In(_, candidates) => candidates.iter().any(|c| values_equal(actual, c)),
            Condition::Gte(_, bound) => {
                matches!(compare_values(actual, bound), Some(Ordering::Greater | Ordering::Equal))
            }
            Condition::Lte(_, bound) => {
                matches!(compare_values(actual, bound), Some(Ordering::Less | Ordering::Equal))
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Eq(c, v) => write!(f, "{c}=eq.{v}"),
            Condition::In(c, vs) => {
                let joined: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                write!(f, "{c}=in.({})", joined.join(","))
            }
            Condition::Gte(c, v) => write!(f, "{c}=gte.{v}"),
            Condition::Lte(c, v) => write!(f, "{c}=lte.{v}"),
        }
    }
}

/// Conjunction of column predicates. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Eq(column.into(), to_value(value)));
        self
    }

    pub fn is_in<V: Serialize>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(to_value).collect();
        self.conditions.push(Condition::In(column.into(), values));
        self
    }

    pub fn gte(mut self, column: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Gte(column.into(), to_value(value)));
        self
    }

    pub fn lte(mut self, column: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Lte(column.into(), to_value(value)));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return f.write_str("*");
        }
        let parts: Vec<String> = self.conditions.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join("&"))
    }
}

/// Sort order for `select`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self { column: column.into(), ascending: true }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self { column: column.into(), ascending: false }
    }

    /// Compare two rows under this order. Missing or incomparable values sort as equal.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let ord = match (a.get(&self.column), b.get(&self.column)) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if self.ascending { ord } else { ord.reverse() }
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

/// Order two JSON values. RFC 3339 strings compare as instants, numbers
/// numerically, other strings lexicographically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Build a [`Row`] from a `json!` object literal. Non-objects yield an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Read a UUID column from a row.
pub fn row_uuid(row: &Row, column: &str) -> Option<Uuid> {
    row.get(column)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

// ───────────────────────────────────────────────────────────────────
// Change channel
// ───────────────────────────────────────────────────────────────────

/// Row-level change kinds emitted by the change channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];
}

/// One change notification. For deletes `row` holds the old row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub row: Row,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind, row: Row) -> Self {
        Self { table, kind, row }
    }
}

/// Runs an unsubscribe action exactly once, on `dispose()` or on drop.
pub struct Disposer(Option<Box<dyn FnOnce() + Send>>);

impl Disposer {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(action)))
    }

    /// A disposer with nothing to release.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn dispose(&mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.0.is_none()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer").field("disposed", &self.is_disposed()).finish()
    }
}

/// A live change subscription: a stream of events plus its disposer.
///
/// Dropping the stream unsubscribes.
pub struct ChangeStream {
    events: BoxStream<'static, ChangeEvent>,
    disposer: Disposer,
}

impl ChangeStream {
    pub fn new(events: BoxStream<'static, ChangeEvent>, disposer: Disposer) -> Self {
        Self { events, disposer }
    }

    /// Next event, or `None` once the channel has closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.next().await
    }

    pub fn unsubscribe(&mut self) {
        self.disposer.dispose();
    }

    /// Split into the event stream and the disposer, so the two can be owned separately.
    pub fn into_parts(self) -> (BoxStream<'static, ChangeEvent>, Disposer) {
        (self.events, self.disposer)
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream").field("disposer", &self.disposer).finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Collaborator traits
// ───────────────────────────────────────────────────────────────────

/// Request/response access to the relational store plus its change channel.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<&Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError>;

    /// Insert a row and return it as stored.
    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError>;

    /// Apply `patch` to every matching row and return the updated rows.
    async fn update(&self, table: Table, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError>;

    /// Create-or-replace keyed by `conflict_key` columns.
    async fn upsert(&self, table: Table, row: Row, conflict_key: &[&str]) -> Result<Row, StoreError>;

    /// Delete matching rows and return how many were removed.
    async fn delete(&self, table: Table, filter: &Filter) -> Result<usize, StoreError>;

    async fn subscribe(
        &self,
        table: Table,
        kinds: &[ChangeKind],
        filter: &Filter,
    ) -> Result<ChangeStream, StoreError>;
}

/// Binary object storage used by the shared file registry.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path` and return a durable URL.
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime_type: &str) -> Result<String, StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_eq_uuid_matches_serialized_row() {
        let id = Uuid::new_v4();
        let r = row(json!({ "id": id, "read": false }));
        assert!(Filter::new().eq("id", id).matches(&r));
        assert!(!Filter::new().eq("id", Uuid::new_v4()).matches(&r));
        assert!(Filter::new().eq("read", false).matches(&r));
    }

    #[test]
    fn test_filter_in() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let r = row(json!({ "id": b }));
        assert!(Filter::new().is_in("id", [a, b]).matches(&r));
        assert!(!Filter::new().is_in("id", [a]).matches(&r));
        assert!(!Filter::new().is_in("id", Vec::<Uuid>::new()).matches(&r));
    }

    #[test]
    fn test_timestamp_comparison_ignores_fraction_format() {
        // Lexicographic comparison would get this backwards.
        let earlier = json!("2026-10-16T12:00:00Z");
        let later = json!("2026-10-16T12:00:00.500Z");
        assert_eq!(compare_values(&earlier, &later), Some(Ordering::Less));

        let r = row(json!({ "last_seen": "2026-10-16T12:00:00.500Z" }));
        assert!(Filter::new().gte("last_seen", "2026-10-16T12:00:00Z").matches(&r));
        assert!(!Filter::new().lte("last_seen", "2026-10-16T12:00:00Z").matches(&r));
    }

    #[test]
    fn test_missing_column_never_matches() {
        let r = row(json!({ "id": 1 }));
        assert!(!Filter::new().eq("user_id", 1).matches(&r));
        assert!(Filter::new().matches(&r));
    }

    #[test]
    fn test_order_desc() {
        let a = row(json!({ "priority": 1 }));
        let b = row(json!({ "priority": 3 }));
        assert_eq!(Order::desc("priority").compare(&a, &b), Ordering::Greater);
        assert_eq!(Order::asc("priority").compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_filter_display_is_canonical() {
        let f = Filter::new().eq("user_id", "u1").gte("priority", 2);
        assert_eq!(f.to_string(), "user_id=eq.\"u1\"&priority=gte.2");
        assert_eq!(Filter::new().to_string(), "*");
    }

    #[test]
    fn test_disposer_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut disposer = Disposer::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        });
        disposer.dispose();
        disposer.dispose();
        drop(disposer);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_row_uuid() {
        let id = Uuid::new_v4();
        let r = row(json!({ "user_id": id, "other": 5 }));
        assert_eq!(row_uuid(&r, "user_id"), Some(id));
        assert_eq!(row_uuid(&r, "other"), None);
        assert_eq!(row_uuid(&r, "missing"), None);
    }
}
