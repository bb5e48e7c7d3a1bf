use crate::collector::{CollectorHooks, CollectorOptions, CollectorPersister, PersistContext, WatchMode};
use crate::deletion_marker::{DeletionMarker, DeletionTable};
use crate::io::FileIo;
use crate::models::{ChangedTables, Table, TableChanges, Tables, WriteOperation};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonFileConfig {
    pub table_name: String,
    pub filename: String,
    pub label: String,
}

impl JsonFileConfig {
    pub fn new(table_name: &str, filename: &str, label: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            filename: filename.to_string(),
            label: label.to_string(),
        }
    }
}

/// Persists one whole table as a single JSON object keyed by row ID.
pub fn create_json_file_persister(ctx: PersistContext, config: JsonFileConfig) -> CollectorPersister {
    let options = CollectorOptions::new(config.label.clone())
        .with_safeguard(ctx.settings.cleanup)
        .with_watch(
            vec![config.filename.clone()],
            WatchMode::Simple {
                fallback_interval: Some(ctx.settings.json_poll_interval()),
            },
        );
    let hooks = JsonFileHooks {
        marker: DeletionMarker::new(ctx.store.clone(), vec![DeletionTable::primary(&config.table_name)]),
        io: ctx.io.clone(),
        config,
    };
    CollectorPersister::new(ctx, Arc::new(hooks), options)
}

struct JsonFileHooks {
    config: JsonFileConfig,
    io: Arc<dyn FileIo>,
    marker: DeletionMarker,
}

impl JsonFileHooks {
    async fn read_table(&self, data_dir: &Path) -> Option<Table> {
        let path = data_dir.join(&self.config.filename);
        let text = match self.io.read_text_file(&path).await {
            Ok(text) => text,
            Err(error) => {
                if !error.is_not_found() {
                    tracing::error!(label = %self.config.label, path = %path.display(), error = %error, "load failed");
                }
                return None;
            }
        };
        if self.io.is_own_write(&path, &text) {
            tracing::debug!(label = %self.config.label, path = %path.display(), "file unchanged since last save");
            return None;
        }

        let object = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                tracing::error!(label = %self.config.label, path = %path.display(), "expected a JSON object of rows");
                return None;
            }
            Err(error) => {
                tracing::error!(label = %self.config.label, path = %path.display(), error = %error, "JSON parse error");
                return None;
            }
        };

        let mut table = Table::new();
        for (entity_id, value) in object {
            match value {
                Value::Object(row) => {
                    table.insert(entity_id, row);
                }
                _ => {
                    tracing::warn!(label = %self.config.label, entity_id = %entity_id, "skipping non-object row");
                }
            }
        }
        Some(table)
    }
}

#[async_trait]
impl CollectorHooks for JsonFileHooks {
    fn tables(&self) -> Vec<String> {
        vec![self.config.table_name.clone()]
    }

    fn save(&self, tables: &Tables, data_dir: &Path, changed: Option<&ChangedTables>) -> Vec<WriteOperation> {
        if let Some(changed) = changed {
            if !changed.contains_key(&self.config.table_name) {
                return Vec::new();
            }
        }
        let table = tables.get(&self.config.table_name).cloned().unwrap_or_default();
        // Full saves never write an empty table over an unloaded file.
        if changed.is_none() && table.is_empty() {
            return Vec::new();
        }
        let content = Value::Object(
            table
                .into_iter()
                .map(|(entity_id, row)| (entity_id, Value::Object(row)))
                .collect(),
        );
        vec![WriteOperation::WriteJson {
            content,
            path: data_dir.join(&self.config.filename),
        }]
    }

    async fn load(&self, data_dir: &Path) -> Option<TableChanges> {
        let table = self.read_table(data_dir).await?;
        let mut loaded = Tables::new();
        loaded.insert(self.config.table_name.clone(), table);
        Some(self.marker.mark_all(&loaded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileIo;
    use crate::listener::WatchHub;
    use crate::settings::SyncSettings;
    use crate::store::{MemoryStore, TableStore};
    use serde_json::json;

    fn setup(data_dir: &Path) -> (CollectorPersister, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let ctx = PersistContext::new(
            store.clone(),
            Arc::new(LocalFileIo::new()),
            Arc::new(SyncSettings::new(data_dir)),
            WatchHub::new(16),
        );
        let persister =
            create_json_file_persister(ctx, JsonFileConfig::new("calendars", "calendars.json", "calendars"));
        (persister, store)
    }

    fn calendar(name: &str) -> crate::models::Row {
        json!({ "name": name, "enabled": true })
            .as_object()
            .cloned()
            .expect("object row")
    }

    #[tokio::test]
    async fn writes_whole_table_as_one_file() {
        let root = tempfile::tempdir().expect("temp dir");
        let (persister, store) = setup(root.path());
        store.set_row("calendars", "c1", calendar("Work"));
        store.set_row("calendars", "c2", calendar("Home"));

        let report = persister.save(None).await;
        assert_eq!(report.json_writes, 1);

        let written: Value = serde_json::from_str(
            &std::fs::read_to_string(root.path().join("calendars.json")).expect("read file"),
        )
        .expect("parse file");
        assert_eq!(written["c2"]["name"], "Home");
    }

    #[tokio::test]
    async fn skips_diffs_that_do_not_touch_the_table() {
        let root = tempfile::tempdir().expect("temp dir");
        let (persister, store) = setup(root.path());
        store.set_row("calendars", "c1", calendar("Work"));

        let mut unrelated = ChangedTables::new();
        unrelated
            .entry("humans".to_string())
            .or_default()
            .insert("h1".to_string(), None);
        assert_eq!(persister.save(Some(&unrelated)).await.operation_count(), 0);
        assert!(!root.path().join("calendars.json").exists());
    }

    #[tokio::test]
    async fn load_tolerates_missing_and_corrupt_files() {
        let root = tempfile::tempdir().expect("temp dir");
        let (persister, store) = setup(root.path());
        store.set_row("calendars", "c1", calendar("Work"));
        assert_eq!(persister.load().await, None);

        std::fs::write(root.path().join("calendars.json"), "{ not json").expect("write corrupt");
        assert_eq!(persister.load().await, None);

        std::fs::write(
            root.path().join("calendars.json"),
            r#"{ "c2": { "name": "Home", "enabled": true }, "bad": 3 }"#,
        )
        .expect("write file");
        let changes = persister.load().await.expect("loaded changes");
        assert_eq!(changes["calendars"]["c2"], Some(calendar("Home")));
        assert_eq!(changes["calendars"]["c1"], None);
        assert!(!changes["calendars"].contains_key("bad"));
    }

    #[tokio::test]
    async fn reload_of_own_write_keeps_unsaved_rows() {
        let root = tempfile::tempdir().expect("temp dir");
        let (persister, store) = setup(root.path());
        store.set_row("calendars", "c1", calendar("Work"));
        persister.save(None).await;

        store.set_row("calendars", "c2", calendar("Home"));
        assert_eq!(persister.load().await, None);
        assert!(!persister.load_into_store().await);
        assert!(store.has_row("calendars", "c2"));

        std::fs::write(root.path().join("calendars.json"), r#"{ "c3": { "name": "Shared" } }"#)
            .expect("external edit");
        let changes = persister.load().await.expect("external changes");
        assert_eq!(changes["calendars"]["c1"], None);
        assert_eq!(changes["calendars"]["c2"], None);
        assert!(changes["calendars"]["c3"].is_some());
    }
}
