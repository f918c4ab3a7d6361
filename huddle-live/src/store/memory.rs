//! In-process Remote Store and blob store.
//!
//! Tables are vectors of JSON rows behind a tokio `RwLock`; every mutation
//! publishes a [`ChangeEvent`] through the table's [`ChangeFanout`] after the
//! write lock is released. Faults can be injected per table and operation
//! to exercise the engine's rollback and resubscribe paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    BlobStore, ChangeEvent, ChangeKind, ChangeStream, FanoutRegistry, FanoutStats, Filter, Order,
    RemoteStore, Row, Table,
};
use crate::error::StoreError;

/// Remote Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Upsert,
    Delete,
    Subscribe,
}

/// Thread-safe in-memory implementation of [`RemoteStore`].
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Vec<Row>>>,
    fanout: FanoutRegistry,
    faults: Mutex<HashSet<(Table, Operation)>>,
}

/// Events a change subscriber may fall behind by before it is dropped.
pub const DEFAULT_CHANGE_BUFFER: usize = 256;

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_BUFFER)
    }
}

impl MemoryStore {
    /// Create an empty store whose change subscribers buffer `change_buffer` events each.
    /// A zero buffer is raised to one.
    pub fn new(change_buffer: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            fanout: FanoutRegistry::new(change_buffer),
            faults: Mutex::new(HashSet::new()),
        }
    }

    /// Make every subsequent `op` on `table` fail with `StoreError::Unavailable`.
    pub fn fail(&self, table: Table, op: Operation) {
        self.faults_guard().insert((table, op));
    }

    /// Undo a previous [`fail`](Self::fail).
    pub fn recover(&self, table: Table, op: Operation) {
        self.faults_guard().remove(&(table, op));
    }

    pub fn clear_faults(&self) {
        self.faults_guard().clear();
    }

    /// Drop every change subscriber on `table`, simulating a lost channel.
    pub fn disconnect_subscribers(&self, table: Table) -> usize {
        self.fanout.get(table).map_or(0, |f| f.disconnect_all())
    }

    /// Number of open upstream subscriptions on `table`.
    pub fn subscriber_count(&self, table: Table) -> usize {
        self.fanout.subscriber_count(table)
    }

    pub fn total_subscribers(&self) -> usize {
        self.fanout.total_subscribers()
    }

    pub fn fanout_stats(&self, table: Table) -> FanoutStats {
        self.fanout.get(table).map(|f| f.stats()).unwrap_or_default()
    }

    /// Snapshot of every row in `table`.
    pub async fn rows(&self, table: Table) -> Vec<Row> {
        self.tables.read().await.get(&table).cloned().unwrap_or_default()
    }

    /// Load rows without emitting change events.
    pub async fn seed(&self, table: Table, rows: impl IntoIterator<Item = Row>) {
        self.tables.write().await.entry(table).or_default().extend(rows);
    }

    fn faults_guard(&self) -> std::sync::MutexGuard<'_, HashSet<(Table, Operation)>> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self, table: Table, op: Operation) -> Result<(), StoreError> {
        if self.faults_guard().contains(&(table, op)) {
            return Err(StoreError::Unavailable(format!("{op:?} on {table} is failing")));
        }
        Ok(())
    }

    fn publish(&self, table: Table, kind: ChangeKind, rows: Vec<Row>) {
        for row in rows {
            self.fanout.publish(&ChangeEvent::new(table, kind, row));
        }
    }
}

fn same_key(a: &Row, b: &Row, key: &[&str]) -> bool {
    key.iter().all(|column| match (a.get(*column), b.get(*column)) {
        (Some(x), Some(y)) => x == y && !x.is_null(),
        _ => false,
    })
}

fn merge_into(target: &mut Row, patch: Row) {
    for (column, value) in patch {
        target.insert(column, value);
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<&Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError> {
        self.check(table, Operation::Select)?;

        let tables = self.tables.read().await;
        let mut rows: Vec<Row> = tables
            .get(&table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        drop(tables);

        if let Some(order) = order {
            rows.sort_by(|a, b| order.compare(a, b));
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        self.check(table, Operation::Insert)?;

        let key = table.primary_key();
        {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table).or_default();
            if rows.iter().any(|existing| same_key(existing, &row, key)) {
                return Err(StoreError::Conflict(format!("{table} key {key:?} already exists")));
            }
            rows.push(row.clone());
        }

        self.publish(table, ChangeKind::Insert, vec![row.clone()]);
        Ok(row)
    }

    async fn update(&self, table: Table, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
        self.check(table, Operation::Update)?;

        let updated: Vec<Row> = {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table).or_default();
            rows.iter_mut()
                .filter(|r| filter.matches(r))
                .map(|r| {
                    merge_into(r, patch.clone());
                    r.clone()
                })
                .collect()
        };

        self.publish(table, ChangeKind::Update, updated.clone());
        Ok(updated)
    }

    async fn upsert(&self, table: Table, row: Row, conflict_key: &[&str]) -> Result<Row, StoreError> {
        self.check(table, Operation::Upsert)?;

        if conflict_key.is_empty() || conflict_key.iter().any(|c| row.get(*c).map_or(true, Value::is_null)) {
            return Err(StoreError::Rejected(format!(
                "upsert on {table} needs values for {conflict_key:?}"
            )));
        }

        let (stored, kind) = {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table).or_default();
            match rows.iter_mut().find(|existing| same_key(existing, &row, conflict_key)) {
                Some(existing) => {
                    merge_into(existing, row);
                    (existing.clone(), ChangeKind::Update)
                }
                None => {
                    rows.push(row.clone());
                    (row, ChangeKind::Insert)
                }
            }
        };

        self.publish(table, kind, vec![stored.clone()]);
        Ok(stored)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<usize, StoreError> {
        self.check(table, Operation::Delete)?;

        let removed: Vec<Row> = {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table).or_default();
            let (gone, kept): (Vec<Row>, Vec<Row>) = rows.drain(..).partition(|r| filter.matches(r));
            *rows = kept;
            gone
        };

        let count = removed.len();
        self.publish(table, ChangeKind::Delete, removed);
        Ok(count)
    }

    async fn subscribe(
        &self,
        table: Table,
        kinds: &[ChangeKind],
        filter: &Filter,
    ) -> Result<ChangeStream, StoreError> {
        self.check(table, Operation::Subscribe)?;
        Ok(self.fanout.get_or_create(table).subscribe(kinds, filter))
    }
}

// ───────────────────────────────────────────────────────────────────
// Blob store
// ───────────────────────────────────────────────────────────────────

/// In-memory [`BlobStore`] returning `memory://<bucket>/<path>` URLs.
pub struct MemoryBlobStore {
    bucket: String,
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
    fail_uploads: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            blobs: RwLock::new(HashMap::new()),
            fail_uploads: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, AtomicOrdering::SeqCst);
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.blobs.read().await.contains_key(path)
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("memory://{}/{}", self.bucket, path)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new("shared-files")
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime_type: &str) -> Result<String, StoreError> {
        if self.fail_uploads.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("blob upload failing".into()));
        }
        self.blobs
            .write()
            .await
            .insert(path.to_string(), (bytes, mime_type.to_string()));
        Ok(self.url_for(path))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        if self.fail_removes.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("blob removal failing".into()));
        }
        match self.blobs.write().await.remove(path) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }
}
