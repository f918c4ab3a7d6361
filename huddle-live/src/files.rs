//! Shared file registry: blob upload plus a metadata row.
//!
//! Registration uploads first and inserts second. If the insert fails the
//! blob is removed again; if that removal fails too the caller receives
//! [`LiveError::OrphanedBlob`] naming the URL that has no registry row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::context::LiveContext;
use crate::coordinator::{ChangeListener, SubscriptionCoordinator, SubscriptionScope, SubscriptionToken};
use crate::error::{LiveError, LiveResult};
use crate::model::{AccessLevel, EntityRef, FileType, JsonMap, Record, SharedFile};
use crate::state::ViewState;
use crate::store::{row_uuid, BlobStore, ChangeEvent, ChangeKind, Filter, Order, Row, Table};

/// Raw file handed to [`FileRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// Original name; sanitized only for the storage path.
    pub file_name: String,
    /// Also decides the [`FileType`] category.
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { file_name: file_name.into(), mime_type: mime_type.into(), bytes }
    }
}

/// Metadata for a registered file. The default is a `shared`, unattached,
/// non-expiring file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOptions {
    /// Entity the file belongs to; [`FileRegistry::list_for`] filters on it.
    pub related_entity: Option<EntityRef>,
    pub access_level: AccessLevel,
    pub permissions: JsonMap,
    pub metadata: JsonMap,
    /// Past this instant the file is hidden from listings. The row and blob stay.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            related_entity: None,
            access_level: AccessLevel::Shared,
            permissions: JsonMap::new(),
            metadata: JsonMap::new(),
            expires_at: None,
        }
    }
}

impl FileOptions {
    /// Defaults, attached to `entity`.
    pub fn related_to(entity: EntityRef) -> Self {
        Self { related_entity: Some(entity), ..Self::default() }
    }
}

/// Storage path for an upload: `{uploader}/{file id}/{sanitized name}`.
pub fn storage_path(uploader: Uuid, file_id: Uuid, file_name: &str) -> String {
    let mut name: String = file_name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    name = name.trim_start_matches('.').to_string();
    if name.is_empty() {
        name.push_str("file");
    }
    format!("{uploader}/{file_id}/{name}")
}

struct FileState {
    /// Newest first.
    files: Vec<SharedFile>,
    view: ViewState,
}

impl FileState {
    fn upsert(&mut self, file: SharedFile) {
        match self.files.iter_mut().find(|f| f.id == file.id) {
            Some(existing) => *existing = file,
            None => {
                let at = self
                    .files
                    .iter()
                    .position(|f| f.created_at <= file.created_at)
                    .unwrap_or(self.files.len());
                self.files.insert(at, file);
            }
        }
    }
}

struct FileInner {
    ctx: LiveContext,
    coordinator: Arc<SubscriptionCoordinator>,
    blobs: Arc<dyn BlobStore>,
    state: RwLock<FileState>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

/// The current user's uploads: blob plus metadata row, kept in step.
#[derive(Clone)]
pub struct FileRegistry {
    inner: Arc<FileInner>,
}

impl FileRegistry {
    pub fn new(ctx: LiveContext, coordinator: Arc<SubscriptionCoordinator>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            inner: Arc::new(FileInner {
                ctx,
                coordinator,
                blobs,
                state: RwLock::new(FileState { files: Vec::new(), view: ViewState::default() }),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to changes on the user's own uploads and load them.
    pub async fn activate(&self) -> LiveResult<()> {
        let actor = self.inner.ctx.actor_id()?;
        {
            let mut subscription = self.inner.subscription.lock().await;
            if subscription.is_none() {
                let scope = SubscriptionScope::all(Table::SharedFiles, Filter::new().eq("uploaded_by", actor));
                let listener: Arc<dyn ChangeListener> = self.inner.clone();
                *subscription = Some(self.inner.coordinator.subscribe(scope, listener).await);
            }
        }
        self.inner.load().await
    }

    /// Release the uploads subscription.
    pub async fn deactivate(&self) {

        if let Some(token) = self.inner.subscription.lock().await.take() {
            self.inner.coordinator.release(token).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.subscription.lock().await.is_some()
    }

    /// Upload `upload` and register its metadata.
    ///
    /// The blob goes up first. A failed upload inserts nothing and returns
    /// [`LiveError::Upload`]. A failed insert removes the blob again before
    /// returning the write error.

    pub async fn register(&self, upload: FileUpload, options: FileOptions) -> LiveResult<SharedFile> {
        let actor = self.inner.ctx.actor_id()?;
        let id = Uuid::new_v4();
        let path = storage_path(actor, id, &upload.file_name);
        let file_size = upload.bytes.len() as u64;

        let url = self
            .inner
            .blobs
            .upload(&path, upload.bytes, &upload.mime_type)
            .await
            .map_err(|source| LiveError::Upload { path: path.clone(), source })?;

        let file = SharedFile {
            id,
            file_name: upload.file_name,
            file_url: url.clone(),
            file_type: FileType::from_mime(&upload.mime_type),
            file_size,
            mime_type: upload.mime_type,
            uploaded_by: actor,
            related_entity: options.related_entity,
            access_level: options.access_level,
            permissions: options.permissions,
            metadata: options.metadata,
            created_at: self.inner.ctx.now(),
            expires_at: options.expires_at,
        };

        let inserted = self.inner.ctx.store.insert(Table::SharedFiles, file.to_row()?).await;
        let stored = match inserted {
            Ok(row) => SharedFile::from_row(row)?,
            Err(insert_err) => {
                log::warn!("metadata insert for {path} failed, removing blob: {insert_err}");
                return Err(match self.inner.blobs.remove(&path).await {
                    Ok(()) => LiveError::Write { table: Table::SharedFiles, source: insert_err },
                    Err(remove_err) => {
                        log::error!("blob {url} orphaned, remove failed: {remove_err}");
                        LiveError::OrphanedBlob { url, source: insert_err }
                    }
                });
            }
        };

        self.inner.state.write().await.upsert(stored.clone());
        log::info!("registered {} ({} bytes) as {}", stored.file_name, stored.file_size, stored.id);
        Ok(stored)
    }

    /// Unexpired files attached to `entity`, newest first.
    pub async fn list_for(&self, entity: &EntityRef) -> LiveResult<Vec<SharedFile>> {
        let rows = self
            .inner
            .ctx
            .store
            .select(
                Table::SharedFiles,
                &Filter::new().eq("related_entity", entity),
                Some(&Order::desc("created_at")),
                None,
            )
            .await
            .map_err(LiveError::fetch(Table::SharedFiles))?;
        let now = self.inner.ctx.now();
        Ok(decode_all(rows).into_iter().filter(|f| !f.is_expired(now)).collect())
    }

    /// Re-fetch the current user's uploads.
    pub async fn load(&self) -> LiveResult<()> {
        self.inner.load().await
    }

    /// Cached uploads that have not expired, newest first.
    pub async fn files(&self) -> Vec<SharedFile> {
        let now = self.inner.ctx.now();
        self.inner
            .state
            .read()
            .await
            .files
            .iter()
            .filter(|f| !f.is_expired(now))
            .cloned()
            .collect()
    }

    pub async fn state(&self) -> ViewState {
        self.inner.state.read().await.view.clone()
    }
}

impl FileInner {
    async fn load(&self) -> LiveResult<()> {
        let actor = self.ctx.actor_id()?;
        self.state.write().await.view.begin_load();
        let fetched = self
            .ctx
            .store
            .select(
                Table::SharedFiles,
                &Filter::new().eq("uploaded_by", actor),
                Some(&Order::desc("created_at")),
                None,
            )
            .await
            .map_err(LiveError::fetch(Table::SharedFiles));

        let mut state = self.state.write().await;
        match fetched {
            Ok(rows) => {
                state.files = decode_all(rows);
                log::info!("loaded {} shared file(s)", state.files.len());
                state.view.load_succeeded();
                Ok(())
            }
            Err(e) => {
                log::error!("shared file load failed: {e}");
                state.files.clear();
                state.view.load_failed(&e);
                Err(e)
            }
        }
    }
}

fn decode_all(rows: Vec<Row>) -> Vec<SharedFile> {
    rows.into_iter()
        .filter_map(|row| match SharedFile::from_row(row) {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("skipping shared file row: {e}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ChangeListener for FileInner {
    async fn on_change(&self, event: &ChangeEvent) {
        if event.kind == ChangeKind::Delete {
            if let Some(id) = row_uuid(&event.row, "id") {
                self.state.write().await.files.retain(|f| f.id != id);
            }
            return;
        }
        match SharedFile::from_row(event.row.clone()) {
            Ok(file) => self.state.write().await.upsert(file),
            Err(e) => log::warn!("ignoring shared file change: {e}"),
        }
    }

    async fn on_stale(&self, error: &LiveError) {
        let mut state = self.state.write().await;
        state.view.mark_stale();
        state.view.set_error(error);
    }

    async fn on_resync(&self) {
        if self.load().await.is_ok() {
            self.state.write().await.view.clear_stale();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;
    use crate::identity::StaticIdentity;
    use crate::store::{MemoryBlobStore, MemoryStore, Operation};

    struct Fixture {
        store: Arc<MemoryStore>,
        blobs: Arc<MemoryBlobStore>,
        clock: Arc<ManualClock>,
        registry: FileRegistry,
        actor: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let clock = Arc::new(ManualClock::default());
        let actor = Uuid::new_v4();
        let config = EngineConfig::for_testing();
        let coordinator = Arc::new(SubscriptionCoordinator::new(store.clone(), config.backoff()));
        let ctx = LiveContext::new(store.clone(), Arc::new(StaticIdentity::member(actor)), clock.clone(), config);
        let registry = FileRegistry::new(ctx, coordinator, blobs.clone());
        Fixture { store, blobs, clock, registry, actor }
    }

    fn upload() -> FileUpload {
        FileUpload::new("Q3 plan.pdf", "application/pdf", vec![7; 128])
    }

    #[test]
    fn test_storage_path_sanitizes_name() {
        let user = Uuid::nil();
        let id = Uuid::nil();
        assert_eq!(storage_path(user, id, "Q3 plan.pdf"), format!("{user}/{id}/Q3_plan.pdf"));
        assert_eq!(storage_path(user, id, "../../etc"), format!("{user}/{id}/_.._etc"));
        assert_eq!(storage_path(user, id, "  "), format!("{user}/{id}/file"));
    }

    #[tokio::test]
    async fn test_register_uploads_then_inserts() {
        let fx = fixture();
        let file = fx.registry.register(upload(), FileOptions::default()).await.unwrap();

        assert_eq!(file.file_type, FileType::Document);
        assert_eq!(file.file_size, 128);
        assert_eq!(file.uploaded_by, fx.actor);
        let path = storage_path(fx.actor, file.id, "Q3 plan.pdf");
        assert_eq!(file.file_url, fx.blobs.url_for(&path));
        assert!(fx.blobs.contains(&path).await);
        assert_eq!(fx.store.rows(Table::SharedFiles).await.len(), 1);
        assert_eq!(fx.registry.files().await, vec![file]);
    }

    #[tokio::test]
    async fn test_upload_failure_inserts_nothing() {
        let fx = fixture();
        fx.blobs.set_fail_uploads(true);
        let err = fx.registry.register(upload(), FileOptions::default()).await.unwrap_err();
        assert!(matches!(err, LiveError::Upload { .. }));
        assert!(fx.store.rows(Table::SharedFiles).await.is_empty());
    }

    #[tokio::test]
    async fn test_insert_failure_removes_blob() {
        let fx = fixture();
        fx.store.fail(Table::SharedFiles, Operation::Insert);
        let err = fx.registry.register(upload(), FileOptions::default()).await.unwrap_err();
        assert!(matches!(err, LiveError::Write { table: Table::SharedFiles, .. }));
        assert!(fx.blobs.is_empty().await);
    }

    #[tokio::test]
    async fn test_insert_and_remove_failure_reports_orphan() {
        let fx = fixture();
        fx.store.fail(Table::SharedFiles, Operation::Insert);
        fx.blobs.set_fail_removes(true);
        let err = fx.registry.register(upload(), FileOptions::default()).await.unwrap_err();
        match err {
            LiveError::OrphanedBlob { url, .. } => assert!(url.starts_with("memory://shared-files/")),
            other => panic!("expected orphaned blob, got {other:?}"),
        }
        assert_eq!(fx.blobs.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_for_entity_skips_expired() {
        let fx = fixture();
        let project = EntityRef::new("project", Uuid::new_v4());
        let keep = fx
            .registry
            .register(upload(), FileOptions::related_to(project.clone()))
            .await
            .unwrap();
        let expiring = FileOptions {
            expires_at: Some(fx.clock.now() + chrono::Duration::minutes(5)),
            ..FileOptions::related_to(project.clone())
        };
        fx.registry.register(upload(), expiring).await.unwrap();
        fx.registry.register(upload(), FileOptions::default()).await.unwrap();

        assert_eq!(fx.registry.list_for(&project).await.unwrap().len(), 2);
        fx.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(fx.registry.list_for(&project).await.unwrap(), vec![keep]);
        assert_eq!(fx.registry.files().await.len(), 2);
    }
}
