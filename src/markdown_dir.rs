use crate::collector::{CollectorHooks, CollectorOptions, CollectorPersister, PersistContext, WatchMode};
use crate::deletion_marker::{DeletionMarker, DeletionTable};
use crate::errors::{PersistError, PersistResult};
use crate::frontmatter::deserialize_document;
use crate::io::FileIo;
use crate::models::{
    ChangedTables, CleanupTarget, DocumentBatch, EntityId, OrphanCleanupConfig, ParsedDocument, Row, Table, TableChanges, Tables,
    WriteOperation,
};
use crate::paths::{build_entity_file_path, build_entity_path, markdown_entity_parser, MARKDOWN_EXTENSION};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Converts between a store row and its Markdown document.
pub trait EntityCodec: Send + Sync + 'static {
    fn to_document(&self, row: &Row) -> PersistResult<ParsedDocument>;

    fn from_document(&self, frontmatter: &Map<String, Value>, body: &str) -> PersistResult<Row>;
}

/// Every field goes to frontmatter except `body_field`, which becomes the
/// document body.
#[derive(Debug, Clone, Default)]
pub struct FieldCodec {
    body_field: Option<String>,
}

impl FieldCodec {
    pub fn new(body_field: Option<&str>) -> Self {
        Self {
            body_field: body_field.map(str::to_string),
        }
    }
}

impl EntityCodec for FieldCodec {
    fn to_document(&self, row: &Row) -> PersistResult<ParsedDocument> {
        let mut frontmatter = row.clone();
        let content = match &self.body_field {
            Some(field) => match frontmatter.remove(field) {
                Some(Value::String(body)) => body,
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
            None => String::new(),
        };
        Ok(ParsedDocument::new(frontmatter, content))
    }

    fn from_document(&self, frontmatter: &Map<String, Value>, body: &str) -> PersistResult<Row> {
        let mut row = frontmatter.clone();
        if let Some(field) = &self.body_field {
            row.insert(field.clone(), Value::String(body.to_string()));
        }
        Ok(row)
    }
}

/// A [`FieldCodec`] that validates both directions through `T`.
pub struct TypedCodec<T> {
    fields: FieldCodec,
    _entity: PhantomData<fn() -> T>,
}

impl<T> TypedCodec<T> {
    pub fn new(body_field: Option<&str>) -> Self {
        Self {
            fields: FieldCodec::new(body_field),
            _entity: PhantomData,
        }
    }
}

impl<T> EntityCodec for TypedCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn to_document(&self, row: &Row) -> PersistResult<ParsedDocument> {
        let normalized = normalize_row::<T>(row.clone())?;
        self.fields.to_document(&normalized)
    }

    fn from_document(&self, frontmatter: &Map<String, Value>, body: &str) -> PersistResult<Row> {
        let row = self.fields.from_document(frontmatter, body)?;
        normalize_row::<T>(row)
    }
}

fn normalize_row<T>(row: Row) -> PersistResult<Row>
where
    T: Serialize + DeserializeOwned,
{
    let entity = serde_json::from_value::<T>(Value::Object(row))?;
    match serde_json::to_value(entity)? {
        Value::Object(row) => Ok(row),
        _ => Err(PersistError::Decode("entity must serialize to an object".to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownDirConfig {
    pub table_name: String,
    pub dir_name: String,
    pub label: String,
}

impl MarkdownDirConfig {
    pub fn new(table_name: &str, dir_name: &str, label: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            dir_name: dir_name.to_string(),
            label: label.to_string(),
        }
    }
}

pub fn create_markdown_dir_persister(
    ctx: PersistContext,
    config: MarkdownDirConfig,
    codec: Arc<dyn EntityCodec>,
) -> CollectorPersister {
    let options = CollectorOptions::new(config.label.clone())
        .with_safeguard(ctx.settings.cleanup)
        .with_watch(
            vec![format!("{}/", config.dir_name)],
            WatchMode::Entity {
                parser: markdown_entity_parser(&config.dir_name),
            },
        );
    let hooks = MarkdownDirHooks {
        marker: DeletionMarker::new(ctx.store.clone(), vec![DeletionTable::primary(&config.table_name)]),
        io: ctx.io.clone(),
        unreadable: Mutex::new(BTreeSet::new()),
        config,
        codec,
    };
    CollectorPersister::new(ctx, Arc::new(hooks), options)
}

pub struct MarkdownDirHooks {
    config: MarkdownDirConfig,
    codec: Arc<dyn EntityCodec>,
    io: Arc<dyn FileIo>,
    marker: DeletionMarker,
    /// Entities whose file is on disk but could not be decoded. They keep
    /// their store state and are never cleaned up.
    unreadable: Mutex<BTreeSet<EntityId>>,
}

impl MarkdownDirHooks {
    fn lock_unreadable(&self) -> std::sync::MutexGuard<'_, BTreeSet<EntityId>> {
        self.unreadable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn document_items<'a>(
        &self,
        rows: impl Iterator<Item = (&'a String, &'a Row)>,
        data_dir: &Path,
    ) -> Vec<(ParsedDocument, std::path::PathBuf)> {
        rows.filter_map(|(entity_id, row)| match self.codec.to_document(row) {
            Ok(document) => Some((
                document,
                build_entity_file_path(data_dir, &self.config.dir_name, entity_id),
            )),
            Err(error) => {
                tracing::warn!(
                    label = %self.config.label,
                    entity_id = %entity_id,
                    error = %error,
                    "skipping row that cannot be encoded"
                );
                None
            }
        })
        .collect()
    }

    fn decode(&self, entity_id: &str, document: &ParsedDocument) -> Option<Row> {
        match self.codec.from_document(&document.frontmatter, document.content.trim()) {
            Ok(row) => Some(row),
            Err(error) => {
                tracing::warn!(
                    label = %self.config.label,
                    entity_id = %entity_id,
                    error = %error,
                    "skipping document that does not match the entity shape"
                );
                None
            }
        }
    }

    fn loaded(&self, rows: Table) -> Tables {
        let mut loaded = Tables::new();
        loaded.insert(self.config.table_name.clone(), rows);
        loaded
    }
}

#[async_trait]
impl CollectorHooks for MarkdownDirHooks {
    fn tables(&self) -> Vec<String> {
        vec![self.config.table_name.clone()]
    }

    fn save(&self, tables: &Tables, data_dir: &Path, changed: Option<&ChangedTables>) -> Vec<WriteOperation> {
        let table = tables.get(&self.config.table_name);
        let mut operations = Vec::new();

        let Some(changed) = changed else {
            // Full saves leave undecodable files for the user to fix.
            let unreadable = self.lock_unreadable().clone();
            let rows = table
                .into_iter()
                .flatten()
                .filter(|(entity_id, _)| !unreadable.contains(*entity_id));
            let items = self.document_items(rows, data_dir);
            if !items.is_empty() {
                operations.push(WriteOperation::WriteDocumentBatch { items });
            }
            return operations;
        };

        let Some(changed_rows) = changed.get(&self.config.table_name) else {
            return operations;
        };

        let mut present = Vec::new();
        let mut deleted = Vec::new();
        for entity_id in changed_rows.keys() {
            match table.and_then(|rows| rows.get(entity_id)) {
                Some(row) => present.push((entity_id, row)),
                None => deleted.push(build_entity_file_path(data_dir, &self.config.dir_name, entity_id)),
            }
        }

        let items = self.document_items(present.into_iter(), data_dir);
        if !items.is_empty() {
            operations.push(WriteOperation::WriteDocumentBatch { items });
        }
        if !deleted.is_empty() {
            operations.push(WriteOperation::Delete { paths: deleted });
        }
        operations
    }

    async fn load(&self, data_dir: &Path) -> Option<TableChanges> {
        let dir = build_entity_path(data_dir, &self.config.dir_name);
        let batch = match self.io.read_document_batch(&dir).await {
            Ok(batch) => batch,
            Err(error) if error.is_not_found() => DocumentBatch::default(),
            Err(error) => {
                tracing::error!(label = %self.config.label, error = %error, "load failed");
                return None;
            }
        };

        let mut unreadable = batch.unreadable;
        let mut rows = Table::new();
        for (entity_id, document) in &batch.documents {
            match self.decode(entity_id, document) {
                Some(row) => {
                    rows.insert(entity_id.clone(), row);
                }
                None => {
                    unreadable.insert(entity_id.clone());
                }
            }
        }

        let preserved = unreadable.union(&batch.unchanged).cloned().collect::<BTreeSet<_>>();
        *self.lock_unreadable() = unreadable;
        let changes = self.marker.mark_all_preserving(&self.loaded(rows), &preserved);
        if changes
            .get(&self.config.table_name)
            .map_or(true, BTreeMap::is_empty)
        {
            return None;
        }
        Some(changes)
    }

    fn cleanup(&self, tables: &Tables) -> Vec<OrphanCleanupConfig> {
        let mut keep_ids = tables
            .get(&self.config.table_name)
            .map(|rows| rows.keys().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default();
        keep_ids.extend(self.lock_unreadable().iter().cloned());
        vec![OrphanCleanupConfig::new(
            CleanupTarget::Files {
                subdir: self.config.dir_name.clone(),
                extension: MARKDOWN_EXTENSION.to_string(),
            },
            keep_ids,
        )]
    }

    async fn load_single(&self, data_dir: &Path, entity_id: &str) -> PersistResult<Option<TableChanges>> {
        let path = build_entity_file_path(data_dir, &self.config.dir_name, entity_id);
        let text = match self.io.read_text_file(&path).await {
            Ok(text) => text,
            Err(error) if error.is_not_found() => {
                self.lock_unreadable().remove(entity_id);
                let changes = self
                    .marker
                    .mark_for_entity(&self.loaded(Table::new()), &entity_id.to_string());
                let removed = changes
                    .get(&self.config.table_name)
                    .is_some_and(|rows| !rows.is_empty());
                return Ok(removed.then_some(changes));
            }
            Err(error) => return Err(error),
        };
        if self.io.is_own_write(&path, &text) {
            return Ok(None);
        }

        let document = match deserialize_document(&text) {
            Ok(document) => document,
            Err(error) => {
                tracing::debug!(label = %self.config.label, path = %path.display(), error = %error, "ignoring unparsable document");
                self.lock_unreadable().insert(entity_id.to_string());
                return Ok(None);
            }
        };
        let Some(row) = self.decode(entity_id, &document) else {
            self.lock_unreadable().insert(entity_id.to_string());
            return Ok(None);
        };
        self.lock_unreadable().remove(entity_id);

        let mut rows = Table::new();
        rows.insert(entity_id.to_string(), row);
        Ok(Some(crate::models::upserts(&self.config.table_name, rows)))
    }
}
