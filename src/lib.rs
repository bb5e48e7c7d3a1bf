pub mod app;
pub mod chat;
pub mod cleanup;
pub mod collector;
pub mod deletion_marker;
pub mod entities;
pub mod errors;
pub mod frontmatter;
pub mod io;
pub mod json_file;
pub mod listener;
pub mod logging;
pub mod markdown_dir;
pub mod models;
pub mod paths;
pub mod session;
pub mod settings;
pub mod store;
pub mod watcher;

pub use crate::app::{run, PersisterSet, SyncRuntime};
pub use crate::cleanup::{CleanupOutcome, CleanupSafeguard};
pub use crate::collector::{
    AutoPersisting, ChangeSink, CollectorHooks, CollectorOptions, CollectorPersister, PersistContext, SaveReport,
    WatchMode, WatchOptions, WatchSubscription,
};
pub use crate::deletion_marker::{DeletionMarker, DeletionTable};
pub use crate::errors::{PersistError, PersistResult};
pub use crate::io::{FileIo, LocalFileIo};
pub use crate::listener::{FileListener, ListenerEvent, ListenerHandle, WatchHub};
pub use crate::logging::init_tracing;
pub use crate::markdown_dir::{create_markdown_dir_persister, EntityCodec, FieldCodec, MarkdownDirConfig, TypedCodec};
pub use crate::models::{
    ChangedTables, CleanupTarget, EntityId, OrphanCleanupConfig, ParsedDocument, Row, StoreChange, Table,
    TableChanges, Tables, WriteOperation,
};
pub use crate::session::create_session_persister;
pub use crate::settings::SyncSettings;
pub use crate::store::{MemoryStore, TableStore};
pub use crate::watcher::FsWatcher;
