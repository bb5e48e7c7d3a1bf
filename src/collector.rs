use crate::cleanup::{run_orphan_cleanup, CleanupOutcome, CleanupSafeguard};
use crate::errors::PersistResult;
use crate::io::FileIo;
use crate::listener::{FileListener, ListenerCallback, ListenerEvent, ListenerFuture, ListenerHandle, WatchHub};
use crate::models::{
    is_empty_changes, ChangedTables, OrphanCleanupConfig, StoreChange, TableChanges, Tables, WriteOperation,
};
use crate::settings::SyncSettings;
use crate::store::TableStore;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub use crate::listener::ListenerMode as WatchMode;

/// Everything a persister needs from the outside world.
#[derive(Clone)]
pub struct PersistContext {
    pub store: Arc<dyn TableStore>,
    pub io: Arc<dyn FileIo>,
    pub settings: Arc<SyncSettings>,
    pub watch_hub: WatchHub,
}

impl PersistContext {
    pub fn new(
        store: Arc<dyn TableStore>,
        io: Arc<dyn FileIo>,
        settings: Arc<SyncSettings>,
        watch_hub: WatchHub,
    ) -> Self {
        Self {
            store,
            io,
            settings,
            watch_hub,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.settings.data_dir
    }
}

/// Per-entity-kind behaviour plugged into the generic persister.
#[async_trait]
pub trait CollectorHooks: Send + Sync + 'static {
    /// Store tables this persister writes; auto-save ignores commits that
    /// touch none of them.
    fn tables(&self) -> Vec<String>;

    fn save(&self, tables: &Tables, data_dir: &Path, changed: Option<&ChangedTables>) -> Vec<WriteOperation>;

    async fn load(&self, _data_dir: &Path) -> Option<TableChanges> {
        None
    }

    fn cleanup(&self, _tables: &Tables) -> Vec<OrphanCleanupConfig> {
        Vec::new()
    }

    async fn load_single(&self, _data_dir: &Path, _entity_id: &str) -> PersistResult<Option<TableChanges>> {
        Ok(None)
    }
}

/// Receives what a watch event means for the store.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn on_change(&self, change: StoreChange);
}

#[derive(Clone)]
pub struct WatchOptions {
    pub paths: Vec<String>,
    pub mode: WatchMode,
}

#[derive(Clone)]
pub struct CollectorOptions {
    pub label: String,
    pub watch: Option<WatchOptions>,
    pub safeguard: CleanupSafeguard,
}

impl CollectorOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            watch: None,
            safeguard: CleanupSafeguard::default(),
        }
    }

    pub fn with_watch(mut self, paths: Vec<String>, mode: WatchMode) -> Self {
        self.watch = Some(WatchOptions { paths, mode });
        self
    }

    pub fn with_safeguard(mut self, safeguard: CleanupSafeguard) -> Self {
        self.safeguard = safeguard;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    pub json_writes: usize,
    pub document_writes: usize,
    pub deletes: usize,
    pub failed_kinds: Vec<&'static str>,
    pub cleanup: Vec<CleanupOutcome>,
}

impl SaveReport {
    pub fn is_success(&self) -> bool {
        self.failed_kinds.is_empty()
            && self
                .cleanup
                .iter()
                .all(|outcome| !matches!(outcome, CleanupOutcome::Failed { .. }))
    }

    pub fn operation_count(&self) -> usize {
        self.json_writes + self.document_writes + self.deletes
    }
}

#[derive(Clone)]
pub struct CollectorPersister {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    hooks: Arc<dyn CollectorHooks>,
    ctx: PersistContext,
    options: CollectorOptions,
    listener: Option<FileListener>,
}

impl CollectorPersister {
    pub fn new(ctx: PersistContext, hooks: Arc<dyn CollectorHooks>, options: CollectorOptions) -> Self {
        let listener = options.watch.clone().map(|watch| {
            let mode = match watch.mode {
                WatchMode::Simple { fallback_interval: None } => WatchMode::Simple {
                    fallback_interval: Some(ctx.settings.watch_interval()),
                },
                mode => mode,
            };
            FileListener::new(ctx.watch_hub.clone(), watch.paths, mode)
        });
        Self {
            inner: Arc::new(CollectorInner {
                hooks,
                ctx,
                options,
                listener,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.options.label
    }

    pub fn context(&self) -> &PersistContext {
        &self.inner.ctx
    }

    pub fn listener(&self) -> Option<&FileListener> {
        self.inner.listener.as_ref()
    }

    pub async fn save(&self, changed: Option<&ChangedTables>) -> SaveReport {
        self.inner.save(changed).await
    }

    pub async fn load(&self) -> Option<TableChanges> {
        self.inner.load().await
    }

    pub async fn load_into_store(&self) -> bool {
        self.inner.load_into_store().await
    }

    /// Subscribes `sink` to this persister's file events. Returns `None` when
    /// the persister was built without watch options.
    pub fn listen(&self, sink: Arc<dyn ChangeSink>) -> Option<WatchSubscription> {
        let listener = self.inner.listener.clone()?;
        let persister = Arc::downgrade(&self.inner);
        let callback: ListenerCallback = Arc::new(move |event: ListenerEvent| -> ListenerFuture {
            let persister = persister.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let Some(persister) = persister.upgrade() else {
                    return;
                };
                if let Some(change) = persister.resolve_event(event).await {
                    sink.on_change(change).await;
                }
            })
        });
        let handle = listener.add_listener(callback);
        Some(WatchSubscription {
            listener,
            handle: Some(handle),
        })
    }

    /// Saves every store commit that touches this persister's tables, one at a
    /// time, in commit order.
    pub fn start_auto_save(&self) -> JoinHandle<()> {
        let mut commits = self.inner.ctx.store.subscribe();
        let persister = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match commits.recv().await {
                    Ok(changed) => {
                        if persister.touches(&changed) {
                            persister.save(Some(&changed)).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            label = %persister.options.label,
                            skipped,
                            "auto-save lagged behind commits; saving full snapshot"
                        );
                        persister.save(None).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Loads once, then keeps the store in sync with file events.
    pub async fn start_auto_load(&self) -> Option<WatchSubscription> {
        self.inner.load_into_store().await;
        let sink = Arc::new(StoreSink {
            persister: Arc::downgrade(&self.inner),
        });
        self.listen(sink)
    }

    pub async fn start_auto_persisting(&self) -> AutoPersisting {
        let subscription = self.start_auto_load().await;
        let save_task = self.start_auto_save();
        AutoPersisting {
            label: self.label().to_string(),
            save_task: Some(save_task),
            subscription,
        }
    }
}

impl CollectorInner {
    fn touches(&self, changed: &ChangedTables) -> bool {
        self.hooks.tables().iter().any(|table_name| {
            changed
                .get(table_name)
                .is_some_and(|rows| !rows.is_empty())
        })
    }

    async fn save(&self, changed: Option<&ChangedTables>) -> SaveReport {
        let label = self.options.label.as_str();
        let data_dir = self.ctx.data_dir();
        let tables = self.ctx.store.tables();
        let operations = self.hooks.save(&tables, data_dir, changed);

        let mut json_items: Vec<(Value, PathBuf)> = Vec::new();
        let mut document_items = Vec::new();
        let mut delete_paths: Vec<PathBuf> = Vec::new();
        for operation in operations {
            match operation {
                WriteOperation::WriteJson { content, path } => json_items.push((content, path)),
                WriteOperation::WriteDocumentBatch { items } => document_items.extend(items),
                WriteOperation::Delete { paths } => delete_paths.extend(paths),
            }
        }

        let mut report = SaveReport {
            json_writes: json_items.len(),
            document_writes: document_items.len(),
            deletes: delete_paths.len(),
            ..SaveReport::default()
        };

        if !json_items.is_empty() {
            if let Err(error) = self.ctx.io.write_json_batch(json_items).await {
                tracing::error!(label = %label, kind = "write-json", error = %error, "save failed");
                report.failed_kinds.push("write-json");
            }
        }

        if !document_items.is_empty() {
            if let Err(error) = self.ctx.io.write_document_batch(document_items).await {
                tracing::error!(label = %label, kind = "write-document-batch", error = %error, "save failed");
                report.failed_kinds.push("write-document-batch");
            }
        }

        let mut delete_failed = false;
        for path in delete_paths {
            match self.ctx.io.remove(&path).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    tracing::debug!(label = %label, path = %path.display(), "delete target already absent");
                }
                Err(error) => {
                    tracing::error!(label = %label, kind = "delete", path = %path.display(), error = %error, "save failed");
                    delete_failed = true;
                }
            }
        }
        if delete_failed {
            report.failed_kinds.push("delete");
        }

        let configs = self.hooks.cleanup(&tables);
        if !configs.is_empty() {
            report.cleanup =
                run_orphan_cleanup(self.ctx.io.as_ref(), data_dir, &configs, label, &self.options.safeguard).await;
        }

        tracing::debug!(
            label = %label,
            operations = report.operation_count(),
            failed = report.failed_kinds.len(),
            "save finished"
        );
        report
    }

    async fn load(&self) -> Option<TableChanges> {
        let changes = self.hooks.load(self.ctx.data_dir()).await?;
        if is_empty_changes(&changes) {
            return None;
        }
        Some(changes)
    }

    async fn load_into_store(&self) -> bool {
        match self.load().await {
            Some(changes) => {
                self.ctx.store.apply_changes(&changes);
                true
            }
            None => false,
        }
    }

    async fn resolve_event(&self, event: ListenerEvent) -> Option<StoreChange> {
        match event {
            ListenerEvent::Entity { entity_id, path } => {
                match self.hooks.load_single(self.ctx.data_dir(), &entity_id).await {
                    Ok(Some(changes)) if !is_empty_changes(&changes) => Some(StoreChange::Changes(changes)),
                    Ok(_) => None,
                    Err(error) => {
                        tracing::warn!(
                            label = %self.options.label,
                            entity_id = %entity_id,
                            path = %path,
                            error = %error,
                            "single entity reload failed; requesting full reload"
                        );
                        Some(StoreChange::Rederive)
                    }
                }
            }
            ListenerEvent::Changed => Some(StoreChange::Rederive),
        }
    }
}

/// Applies watch results to the persister's own store.
struct StoreSink {
    persister: Weak<CollectorInner>,
}

#[async_trait]
impl ChangeSink for StoreSink {
    async fn on_change(&self, change: StoreChange) {
        let Some(persister) = self.persister.upgrade() else {
            return;
        };
        match change {
            StoreChange::Changes(changes) => persister.ctx.store.apply_changes(&changes),
            StoreChange::Rederive => {
                persister.load_into_store().await;
            }
        }
    }
}

/// A registered watch callback. Dropping it unregisters the callback.
pub struct WatchSubscription {
    listener: FileListener,
    handle: Option<ListenerHandle>,
}

impl WatchSubscription {
    pub fn unlisten(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.listener.del_listener(handle);
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.unlisten();
    }
}

pub struct AutoPersisting {
    label: String,
    save_task: Option<JoinHandle<()>>,
    subscription: Option<WatchSubscription>,
}

impl AutoPersisting {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_watching(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(task) = self.save_task.take() {
            task.abort();
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unlisten();
        }
    }
}

impl Drop for AutoPersisting {
    fn drop(&mut self) {
        self.halt();
    }
}
