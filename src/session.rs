use crate::collector::{CollectorHooks, CollectorOptions, CollectorPersister, PersistContext, WatchMode};
use crate::deletion_marker::{DeletionMarker, DeletionTable};
use crate::errors::PersistResult;
use crate::frontmatter::{deserialize_document, document_id};
use crate::io::FileIo;
use crate::models::{
    ChangedTables, CleanupTarget, EntityId, OrphanCleanupConfig, ParsedDocument, Row, Table, TableChanges, Tables,
    WriteOperation,
};
use crate::paths::{
    build_session_path, sanitize_filename, session_entity_parser, MARKDOWN_EXTENSION, SESSIONS_DIR,
    SESSION_MEMO_FILE, SESSION_META_FILE, SESSION_TRANSCRIPT_FILE,
};
use crate::store::TableStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Arc, Mutex, PoisonError};

pub const SESSIONS_TABLE: &str = "sessions";
pub const TRANSCRIPTS_TABLE: &str = "transcripts";
pub const ENHANCED_NOTES_TABLE: &str = "enhanced_notes";
/// Read only: enhanced notes are named after their template's title.
pub const TEMPLATES_TABLE: &str = "templates";
pub const SESSION_ID_FIELD: &str = "session_id";
pub const FOLDER_ID_FIELD: &str = "folder_id";
pub const RAW_MD_FIELD: &str = "raw_md";

const SUMMARY_NOTE_NAME: &str = "_summary";

/// On-disk shape of `transcript.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFile {
    #[serde(default)]
    pub transcripts: Vec<Row>,
}

pub fn create_session_persister(ctx: PersistContext) -> CollectorPersister {
    let options = CollectorOptions::new("sessions")
        .with_safeguard(ctx.settings.cleanup)
        .with_watch(
            vec![format!("{SESSIONS_DIR}/")],
            WatchMode::Entity {
                parser: session_entity_parser(),
            },
        );
    let hooks = SessionHooks::new(ctx.store.clone(), ctx.io.clone());
    CollectorPersister::new(ctx, Arc::new(hooks), options)
}

struct SessionHooks {
    io: Arc<dyn FileIo>,
    marker: DeletionMarker,
    /// Sessions whose `_meta.json` exists but could not be parsed.
    unreadable: Mutex<BTreeSet<EntityId>>,
    /// Where each session and note was last seen on disk, so moves and
    /// renames can drop the old location.
    locations: Mutex<Locations>,
}

#[derive(Debug, Default)]
struct Locations {
    sessions: HashMap<EntityId, PathBuf>,
    notes: HashMap<EntityId, PathBuf>,
}

/// Rows read from a set of session folders.
#[derive(Debug, Default)]
struct SessionRead {
    tables: Tables,
    unreadable: BTreeSet<EntityId>,
    /// Sessions whose files all hold this process's last write.
    unchanged: BTreeSet<EntityId>,
    locations: Locations,
}

impl SessionHooks {
    fn new(store: Arc<dyn TableStore>, io: Arc<dyn FileIo>) -> Self {
        Self {
            marker: DeletionMarker::new(
                store,
                vec![
                    DeletionTable::primary(SESSIONS_TABLE),
                    DeletionTable::secondary(TRANSCRIPTS_TABLE).owned_by(SESSIONS_TABLE, SESSION_ID_FIELD),
                    DeletionTable::secondary(ENHANCED_NOTES_TABLE).owned_by(SESSIONS_TABLE, SESSION_ID_FIELD),
                ],
            ),
            io,
            unreadable: Mutex::new(BTreeSet::new()),
            locations: Mutex::new(Locations::default()),
        }
    }

    fn lock_unreadable(&self) -> std::sync::MutexGuard<'_, BTreeSet<EntityId>> {
        self.unreadable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_locations(&self) -> std::sync::MutexGuard<'_, Locations> {
        self.locations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sessions whose folder must be rewritten or removed.
    fn affected_sessions(&self, tables: &Tables, changed: Option<&ChangedTables>) -> BTreeSet<EntityId> {
        let all_sessions = || {
            tables
                .get(SESSIONS_TABLE)
                .into_iter()
                .flat_map(|rows| rows.keys().cloned())
        };
        let mut affected = BTreeSet::new();
        match changed {
            None => {
                affected.extend(all_sessions());
                affected.extend(self.lock_locations().sessions.keys().cloned());
            }
            Some(changed) => {
                if let Some(rows) = changed.get(SESSIONS_TABLE) {
                    affected.extend(rows.keys().cloned());
                }
                for table_name in [TRANSCRIPTS_TABLE, ENHANCED_NOTES_TABLE] {
                    let Some(rows) = changed.get(table_name) else {
                        continue;
                    };
                    for entity_id in rows.keys() {
                        match tables.get(table_name).and_then(|table| table.get(entity_id)) {
                            Some(row) => {
                                if let Some(session_id) = session_id_of(row) {
                                    affected.insert(session_id.to_string());
                                }
                            }
                            // Removed rows no longer say which session held them.
                            None => affected.extend(all_sessions()),
                        }
                    }
                }
            }
        }
        affected
    }

    fn session_operations(
        &self,
        tables: &Tables,
        data_dir: &Path,
        session_id: &str,
        session: &Row,
        locations: &mut Locations,
        operations: &mut SessionOperations,
    ) {
        let folder_id = session.get(FOLDER_ID_FIELD).and_then(Value::as_str).unwrap_or_default();
        let session_dir = build_session_path(data_dir, session_id, folder_id);
        if let Some(previous) = locations.sessions.insert(session_id.to_string(), session_dir.clone()) {
            if previous != session_dir && !session_dir.starts_with(&previous) {
                tracing::debug!(label = "sessions", session_id = %session_id, from = %previous.display(), "session moved");
                locations.notes.retain(|_, path| !path.starts_with(&previous));
                operations.deletes.push(previous);
            }
        }

        let mut meta = session.clone();
        meta.remove(RAW_MD_FIELD);
        meta.insert("id".to_string(), Value::String(session_id.to_string()));
        operations.json.push((Value::Object(meta), session_dir.join(SESSION_META_FILE)));

        let transcripts = owned_rows(tables, TRANSCRIPTS_TABLE, session_id);
        let transcript_path = session_dir.join(SESSION_TRANSCRIPT_FILE);
        if transcripts.is_empty() {
            operations.deletes.push(transcript_path);
        } else {
            let file = TranscriptFile {
                transcripts: transcripts.into_iter().map(|(id, row)| with_id(id, row)).collect(),
            };
            match serde_json::to_value(&file) {
                Ok(content) => operations.json.push((content, transcript_path)),
                Err(error) => {
                    tracing::warn!(label = "sessions", session_id = %session_id, error = %error, "skipping transcript that cannot be encoded");
                }
            }
        }

        let memo_path = session_dir.join(SESSION_MEMO_FILE);
        match session.get(RAW_MD_FIELD).and_then(Value::as_str).map(str::trim) {
            Some(raw_md) if !raw_md.is_empty() => {
                let mut frontmatter = Row::new();
                frontmatter.insert("id".to_string(), Value::String(session_id.to_string()));
                frontmatter.insert(SESSION_ID_FIELD.to_string(), Value::String(session_id.to_string()));
                operations.documents.push((ParsedDocument::new(frontmatter, raw_md), memo_path));
            }
            _ => operations.deletes.push(memo_path),
        }

        let mut used_names = HashSet::from([SESSION_MEMO_FILE.to_string()]);
        for (note_id, note) in owned_rows(tables, ENHANCED_NOTES_TABLE, session_id) {
            let content = note.get("content").and_then(Value::as_str).unwrap_or_default();
            if content.trim().is_empty() {
                continue;
            }
            let mut name = format!("{}.{MARKDOWN_EXTENSION}", note_file_stem(tables, note));
            if !used_names.insert(name.clone()) {
                name = format!("{}_{}.{MARKDOWN_EXTENSION}", note_file_stem(tables, note), sanitize_filename(note_id));
                used_names.insert(name.clone());
            }
            let path = session_dir.join(name);
            if let Some(previous) = locations.notes.insert(note_id.clone(), path.clone()) {
                if previous != path && !operations.deletes.contains(&previous) && previous.starts_with(&session_dir) {
                    operations.deletes.push(previous);
                }
            }

            let mut frontmatter = Row::new();
            frontmatter.insert("id".to_string(), Value::String(note_id.clone()));
            for (key, value) in note {
                if key == "content" || value.is_null() || value.as_str() == Some("") {
                    continue;
                }
                frontmatter.insert(key.clone(), value.clone());
            }
            operations.documents.push((ParsedDocument::new(frontmatter, content), path));
        }
    }

    /// Parses the session folders `files` belong to. Folders without a
    /// `_meta.json` are not sessions and are skipped.
    fn read_sessions(&self, sessions_dir: &Path, files: BTreeMap<PathBuf, String>) -> SessionRead {
        let mut by_dir: BTreeMap<PathBuf, Vec<(PathBuf, String)>> = BTreeMap::new();
        for (path, text) in files {
            if let Some(dir) = path.parent() {
                by_dir.entry(dir.to_path_buf()).or_default().push((path, text));
            }
        }

        let mut read = SessionRead {
            tables: empty_session_tables(),
            ..SessionRead::default()
        };
        for (session_dir, files) in by_dir {
            let Some(session_id) = dir_name(&session_dir) else {
                continue;
            };
            let Some(folder_id) = session_dir.parent().and_then(|parent| relative_folder(sessions_dir, parent)) else {
                continue;
            };
            let Some((meta_path, meta_text)) = files.iter().find(|(path, _)| file_name(path) == SESSION_META_FILE)
            else {
                continue;
            };

            for (path, text) in &files {
                if has_markdown_extension(path) && file_name(path) != SESSION_MEMO_FILE {
                    if let Some(note_id) = document_id(text).filter(|note_id| *note_id != session_id) {
                        read.locations.notes.insert(note_id, path.clone());
                    }
                }
            }
            if files.iter().all(|(path, text)| self.io.is_own_write(path, text)) {
                read.unchanged.insert(session_id.clone());
                read.locations.sessions.insert(session_id, session_dir);
                continue;
            }

            let mut session = match serde_json::from_str::<Row>(meta_text) {
                Ok(row) => row,
                Err(error) => {
                    tracing::warn!(label = "sessions", path = %meta_path.display(), error = %error, "skipping malformed session meta");
                    read.unreadable.insert(session_id);
                    continue;
                }
            };
            session.remove("id");
            session.insert(FOLDER_ID_FIELD.to_string(), Value::String(folder_id));
            session.insert(RAW_MD_FIELD.to_string(), Value::String(String::new()));

            for (path, text) in &files {
                if file_name(path) == SESSION_TRANSCRIPT_FILE {
                    self.read_transcripts(path, text, &session_id, &mut read.tables);
                } else if has_markdown_extension(path) {
                    self.read_note(path, text, &session_id, &mut session, &mut read.tables);
                }
            }

            table_mut(&mut read.tables, SESSIONS_TABLE).insert(session_id.clone(), session);
            read.locations.sessions.insert(session_id, session_dir);
        }
        read
    }

    fn read_transcripts(&self, path: &Path, text: &str, session_id: &str, tables: &mut Tables) {
        let file = match serde_json::from_str::<TranscriptFile>(text) {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!(label = "sessions", path = %path.display(), error = %error, "skipping malformed transcript");
                return;
            }
        };
        let transcripts = table_mut(tables, TRANSCRIPTS_TABLE);
        for mut row in file.transcripts {
            let Some(transcript_id) = take_id(&mut row) else {
                tracing::warn!(label = "sessions", path = %path.display(), "skipping transcript without an id");
                continue;
            };
            row.insert(SESSION_ID_FIELD.to_string(), Value::String(session_id.to_string()));
            transcripts.insert(transcript_id, row);
        }
    }

    fn read_note(&self, path: &Path, text: &str, session_id: &str, session: &mut Row, tables: &mut Tables) {
        let document = match deserialize_document(text) {
            Ok(document) => document,
            Err(error) => {
                tracing::warn!(label = "sessions", path = %path.display(), error = %error, "skipping malformed note");
                return;
            }
        };
        let mut frontmatter = document.frontmatter;
        let note_id = take_id(&mut frontmatter);
        if file_name(path) == SESSION_MEMO_FILE || note_id.as_deref() == Some(session_id) {
            session.insert(RAW_MD_FIELD.to_string(), Value::String(document.content));
            return;
        }
        let Some(note_id) = note_id else {
            tracing::warn!(label = "sessions", path = %path.display(), "skipping note without an id");
            return;
        };
        frontmatter.insert(SESSION_ID_FIELD.to_string(), Value::String(session_id.to_string()));
        frontmatter.insert("content".to_string(), Value::String(document.content));
        table_mut(tables, ENHANCED_NOTES_TABLE).insert(note_id, frontmatter);
    }

    async fn scan(&self, sessions_dir: &Path, path_filter: Option<&str>) -> PersistResult<BTreeMap<PathBuf, String>> {
        let patterns = [
            SESSION_META_FILE.to_string(),
            SESSION_TRANSCRIPT_FILE.to_string(),
            format!("*.{MARKDOWN_EXTENSION}"),
        ];
        match self.io.scan_and_read(sessions_dir, &patterns, true, path_filter).await {
            Ok(scan) => Ok(scan.files),
            Err(error) if error.is_not_found() => Ok(BTreeMap::new()),
            Err(error) => Err(error),
        }
    }
}

#[derive(Default)]
struct SessionOperations {
    json: Vec<(Value, PathBuf)>,
    documents: Vec<(ParsedDocument, PathBuf)>,
    deletes: Vec<PathBuf>,
}

impl SessionOperations {
    fn into_operations(self) -> Vec<WriteOperation> {
        let mut operations = self
            .json
            .into_iter()
            .map(|(content, path)| WriteOperation::WriteJson { content, path })
            .collect::<Vec<_>>();
        if !self.documents.is_empty() {
            operations.push(WriteOperation::WriteDocumentBatch { items: self.documents });
        }
        if !self.deletes.is_empty() {
            operations.push(WriteOperation::Delete { paths: self.deletes });
        }
        operations
    }
}

fn session_id_of(row: &Row) -> Option<&str> {
    row.get(SESSION_ID_FIELD).and_then(Value::as_str)
}

fn owned_rows<'a>(tables: &'a Tables, table_name: &str, session_id: &str) -> Vec<(&'a EntityId, &'a Row)> {
    tables
        .get(table_name)
        .into_iter()
        .flat_map(|rows| rows.iter())
        .filter(|(_, row)| session_id_of(row) == Some(session_id))
        .collect()
}

fn with_id(entity_id: &str, row: &Row) -> Row {
    let mut row = row.clone();
    row.insert("id".to_string(), Value::String(entity_id.to_string()));
    row
}

fn take_id(row: &mut Row) -> Option<EntityId> {
    match row.remove("id")? {
        Value::String(id) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Template title, else template id, else `_summary`.
fn note_file_stem(tables: &Tables, note: &Row) -> String {
    let Some(template_id) = note.get("template_id").and_then(Value::as_str).filter(|id| !id.is_empty()) else {
        return SUMMARY_NOTE_NAME.to_string();
    };
    let title = tables
        .get(TEMPLATES_TABLE)
        .and_then(|templates| templates.get(template_id))
        .and_then(|template| template.get("title"))
        .and_then(Value::as_str)
        .filter(|title| !title.trim().is_empty());
    let stem = sanitize_filename(title.unwrap_or(template_id));
    if stem.is_empty() {
        return SUMMARY_NOTE_NAME.to_string();
    }
    stem
}

/// `/`-joined path of `dir` below `sessions_dir`; `None` outside it.
fn relative_folder(sessions_dir: &Path, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(sessions_dir).ok()?;
    let parts = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>();
    Some(parts.join("/"))
}

fn dir_name(path: &Path) -> Option<EntityId> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn has_markdown_extension(path: &Path) -> bool {
    path.extension().and_then(|value| value.to_str()) == Some(MARKDOWN_EXTENSION)
}

fn table_mut<'a>(tables: &'a mut Tables, table_name: &str) -> &'a mut Table {
    tables.entry(table_name.to_string()).or_default()
}

fn empty_session_tables() -> Tables {
    [SESSIONS_TABLE, TRANSCRIPTS_TABLE, ENHANCED_NOTES_TABLE]
        .into_iter()
        .map(|table_name| (table_name.to_string(), Table::new()))
        .collect()
}

#[async_trait]
impl CollectorHooks for SessionHooks {
    fn tables(&self) -> Vec<String> {
        vec![
            SESSIONS_TABLE.to_string(),
            TRANSCRIPTS_TABLE.to_string(),
            ENHANCED_NOTES_TABLE.to_string(),
        ]
    }

    fn save(&self, tables: &Tables, data_dir: &Path, changed: Option<&ChangedTables>) -> Vec<WriteOperation> {
        let empty = Table::new();
        let sessions = tables.get(SESSIONS_TABLE).unwrap_or(&empty);
        let unreadable = self.lock_unreadable().clone();
        let affected = self.affected_sessions(tables, changed);

        let mut locations = self.lock_locations();
        let mut operations = SessionOperations::default();
        for session_id in affected {
            match sessions.get(&session_id) {
                Some(session) => {
                    // Full saves leave folders with an undecodable meta for the user to fix.
                    if changed.is_none() && unreadable.contains(&session_id) {
                        continue;
                    }
                    self.session_operations(tables, data_dir, &session_id, session, &mut locations, &mut operations);
                }
                None => {
                    if unreadable.contains(&session_id) {
                        continue;
                    }
                    let session_dir = locations
                        .sessions
                        .remove(&session_id)
                        .unwrap_or_else(|| build_session_path(data_dir, &session_id, ""));
                    locations.notes.retain(|_, path| !path.starts_with(&session_dir));
                    operations.deletes.push(session_dir);
                }
            }
        }
        operations.into_operations()
    }

    async fn load(&self, data_dir: &Path) -> Option<TableChanges> {
        let sessions_dir = data_dir.join(SESSIONS_DIR);
        let files = match self.scan(&sessions_dir, None).await {
            Ok(files) => files,
            Err(error) => {
                tracing::error!(label = "sessions", error = %error, "scan failed");
                return None;
            }
        };

        let read = self.read_sessions(&sessions_dir, files);
        let mut preserved = read.unchanged;
        preserved.extend(read.unreadable.iter().cloned());
        *self.lock_unreadable() = read.unreadable;
        *self.lock_locations() = read.locations;
        Some(self.marker.mark_all_preserving(&read.tables, &preserved))
    }

    fn cleanup(&self, tables: &Tables) -> Vec<OrphanCleanupConfig> {
        let mut keep_ids = tables
            .get(ENHANCED_NOTES_TABLE)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter(|(_, note)| {
                note.get("content")
                    .and_then(Value::as_str)
                    .is_some_and(|content| !content.trim().is_empty())
            })
            .map(|(note_id, _)| note_id.clone())
            .collect::<BTreeSet<_>>();
        keep_ids.extend(
            tables
                .get(SESSIONS_TABLE)
                .into_iter()
                .flat_map(|rows| rows.iter())
                .filter(|(_, session)| {
                    session
                        .get(RAW_MD_FIELD)
                        .and_then(Value::as_str)
                        .is_some_and(|raw_md| !raw_md.trim().is_empty())
                })
                .map(|(session_id, _)| session_id.clone()),
        );
        keep_ids.extend(self.lock_unreadable().iter().cloned());
        vec![OrphanCleanupConfig::new(
            CleanupTarget::FilesRecursive {
                subdir: SESSIONS_DIR.to_string(),
                marker_file: SESSION_META_FILE.to_string(),
                extension: MARKDOWN_EXTENSION.to_string(),
            },
            keep_ids,
        )]
    }

    async fn load_single(&self, data_dir: &Path, entity_id: &str) -> PersistResult<Option<TableChanges>> {
        let sessions_dir = data_dir.join(SESSIONS_DIR);
        let path_filter = format!("{MAIN_SEPARATOR}{entity_id}{MAIN_SEPARATOR}");
        let files = self
            .scan(&sessions_dir, Some(&path_filter))
            .await?
            .into_iter()
            .filter(|(path, _)| path.parent().and_then(dir_name).as_deref() == Some(entity_id))
            .collect::<BTreeMap<_, _>>();
        if !files.is_empty() && files.iter().all(|(path, text)| self.io.is_own_write(path, text)) {
            return Ok(None);
        }

        let read = self.read_sessions(&sessions_dir, files);
        if read.unreadable.contains(entity_id) {
            self.lock_unreadable().insert(entity_id.to_string());
            return Ok(None);
        }
        self.lock_unreadable().remove(entity_id);
        {
            let mut locations = self.lock_locations();
            if let Some(previous) = locations.sessions.remove(entity_id) {
                locations.notes.retain(|_, path| !path.starts_with(&previous));
            }
            locations.sessions.extend(read.locations.sessions);
            locations.notes.extend(read.locations.notes);
        }

        let changes = self.marker.mark_for_entity(&read.tables, &entity_id.to_string());
        if changes.values().all(|rows| rows.is_empty()) {
            return Ok(None);
        }
        Ok(Some(changes))
    }
}
