use crate::errors::PersistResult;
use crate::listener::WatchHub;
use crate::paths::relative_watch_path;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

/// Recursive OS watcher on the data directory. Every reported path is
/// published on the hub relative to the data directory.
pub struct FsWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    pub fn start(data_dir: &Path, hub: WatchHub) -> PersistResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let root = data_dir.canonicalize()?;
        let event_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => publish_event(&event_root, &hub, &event),
            Err(error) => {
                tracing::warn!(error = %error, "file watcher reported an error");
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(path = %root.display(), "file watcher started");
        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn publish_event(root: &Path, hub: &WatchHub, event: &Event) {
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    for path in &event.paths {
        if let Some(relative) = relative_watch_path(root, path) {
            hub.notify(relative);
        }
    }
}
