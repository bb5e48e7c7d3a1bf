use crate::chat::create_chat_persister;
use crate::collector::{AutoPersisting, CollectorPersister, PersistContext, SaveReport};
use crate::entities::{
    ChatShortcut, Human, Organization, CALENDARS_FILE, CALENDARS_TABLE, CHAT_SHORTCUTS_TABLE,
    CHAT_SHORTCUT_BODY_FIELD, HUMANS_TABLE, HUMAN_BODY_FIELD, ORGANIZATIONS_TABLE,
};
use crate::errors::PersistResult;
use crate::io::LocalFileIo;
use crate::json_file::{create_json_file_persister, JsonFileConfig};
use crate::listener::WatchHub;
use crate::logging::init_tracing;
use crate::markdown_dir::{create_markdown_dir_persister, MarkdownDirConfig, TypedCodec};
use crate::session::create_session_persister;
use crate::settings::SyncSettings;
use crate::store::MemoryStore;
use crate::watcher::FsWatcher;
use std::path::Path;
use std::sync::Arc;

/// One persister per entity kind kept on disk.
pub struct PersisterSet {
    pub humans: CollectorPersister,
    pub organizations: CollectorPersister,
    pub chat_shortcuts: CollectorPersister,
    pub chats: CollectorPersister,
    pub sessions: CollectorPersister,
    pub calendars: CollectorPersister,
}

impl PersisterSet {
    pub fn new(ctx: &PersistContext) -> Self {
        Self {
            humans: create_markdown_dir_persister(
                ctx.clone(),
                MarkdownDirConfig::new(HUMANS_TABLE, HUMANS_TABLE, "humans"),
                Arc::new(TypedCodec::<Human>::new(Some(HUMAN_BODY_FIELD))),
            ),
            organizations: create_markdown_dir_persister(
                ctx.clone(),
                MarkdownDirConfig::new(ORGANIZATIONS_TABLE, ORGANIZATIONS_TABLE, "organizations"),
                Arc::new(TypedCodec::<Organization>::new(None)),
            ),
            chat_shortcuts: create_markdown_dir_persister(
                ctx.clone(),
                MarkdownDirConfig::new(CHAT_SHORTCUTS_TABLE, CHAT_SHORTCUTS_TABLE, "chat_shortcuts"),
                Arc::new(TypedCodec::<ChatShortcut>::new(Some(CHAT_SHORTCUT_BODY_FIELD))),
            ),
            chats: create_chat_persister(ctx.clone()),
            sessions: create_session_persister(ctx.clone()),
            calendars: create_json_file_persister(
                ctx.clone(),
                JsonFileConfig::new(CALENDARS_TABLE, CALENDARS_FILE, "calendars"),
            ),
        }
    }

    pub fn all(&self) -> [&CollectorPersister; 6] {
        [
            &self.humans,
            &self.organizations,
            &self.chat_shortcuts,
            &self.chats,
            &self.sessions,
            &self.calendars,
        ]
    }

    /// Returns how many persisters found content on disk.
    pub async fn load_all(&self) -> usize {
        let mut loaded = 0;
        for persister in self.all() {
            if persister.load_into_store().await {
                loaded += 1;
            }
        }
        loaded
    }

    pub async fn save_all(&self) -> Vec<SaveReport> {
        let mut reports = Vec::new();
        for persister in self.all() {
            reports.push(persister.save(None).await);
        }
        reports
    }
}

/// The running synchronizer: store, OS watcher and auto-persisting tasks.
pub struct SyncRuntime {
    store: Arc<MemoryStore>,
    ctx: PersistContext,
    persisters: PersisterSet,
    auto: Vec<AutoPersisting>,
    _watcher: FsWatcher,
}

impl SyncRuntime {
    pub async fn start(settings: SyncSettings) -> PersistResult<Self> {
        settings.validate()?;
        tokio::fs::create_dir_all(&settings.data_dir).await?;

        let store = Arc::new(MemoryStore::default());
        let hub = WatchHub::new(settings.watch_channel_capacity);
        let watcher = FsWatcher::start(&settings.data_dir, hub.clone())?;
        let ctx = PersistContext::new(store.clone(), Arc::new(LocalFileIo::new()), Arc::new(settings), hub);
        let persisters = PersisterSet::new(&ctx);

        let mut auto = Vec::new();
        for persister in persisters.all() {
            auto.push(persister.start_auto_persisting().await);
        }
        tracing::info!(
            data_dir = %ctx.data_dir().display(),
            persisters = auto.len(),
            "sync runtime started"
        );

        Ok(Self {
            store,
            ctx,
            persisters,
            auto,
            _watcher: watcher,
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn context(&self) -> &PersistContext {
        &self.ctx
    }

    pub fn persisters(&self) -> &PersisterSet {
        &self.persisters
    }

    pub fn shutdown(self) {
        for auto in self.auto {
            tracing::debug!(label = %auto.label(), "stopping auto-persisting");
            auto.stop();
        }
        tracing::info!("sync runtime stopped");
    }
}

/// Loads settings, installs logging under `logs/` next to the settings file
/// and starts the runtime.
pub async fn run(settings_path: &Path) -> PersistResult<SyncRuntime> {
    let settings = SyncSettings::load(settings_path)?;
    let app_dir = settings_path.parent().unwrap_or_else(|| Path::new("."));
    init_tracing(&app_dir.join("logs"))?;
    SyncRuntime::start(settings).await
}
