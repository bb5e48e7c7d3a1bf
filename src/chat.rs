use crate::collector::{CollectorHooks, CollectorOptions, CollectorPersister, PersistContext, WatchMode};
use crate::deletion_marker::{DeletionMarker, DeletionTable};
use crate::errors::{PersistError, PersistResult};
use crate::io::FileIo;
use crate::models::{
    ChangedTables, CleanupTarget, EntityId, OrphanCleanupConfig, Row, Table, TableChanges, Tables, WriteOperation,
};
use crate::paths::{build_chat_messages_path, build_chat_path, folder_entity_parser, CHATS_DIR, CHAT_MESSAGES_FILE};
use crate::store::TableStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

pub const CHAT_GROUPS_TABLE: &str = "chat_groups";
pub const CHAT_MESSAGES_TABLE: &str = "chat_messages";
pub const CHAT_GROUP_ID_FIELD: &str = "chat_group_id";

/// On-disk shape of `chats/<group_id>/messages.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFile {
    pub chat_group: Row,
    #[serde(default)]
    pub messages: Vec<Row>,
}

impl ChatFile {
    pub fn from_tables(group_id: &str, group: &Row, messages: &Table) -> Self {
        let mut chat_group = group.clone();
        chat_group.insert("id".to_string(), Value::String(group_id.to_string()));

        let mut ordered = messages
            .iter()
            .filter(|(_, message)| message_group_id(message) == Some(group_id))
            .collect::<Vec<_>>();
        ordered.sort_by(|(left_id, left), (right_id, right)| {
            created_at(left)
                .cmp(&created_at(right))
                .then_with(|| left_id.cmp(right_id))
        });

        let messages = ordered
            .into_iter()
            .map(|(message_id, message)| {
                let mut row = message.clone();
                row.insert("id".to_string(), Value::String(message_id.clone()));
                row
            })
            .collect();
        Self { chat_group, messages }
    }

    /// Splits the file back into table rows, dropping the embedded IDs.
    pub fn into_tables(self) -> PersistResult<Tables> {
        let mut group = self.chat_group;
        let group_id = take_id(&mut group)
            .ok_or_else(|| PersistError::Decode("chat_group is missing its id".to_string()))?;

        let mut groups = Table::new();
        groups.insert(group_id, group);

        let mut messages = Table::new();
        for mut message in self.messages {
            match take_id(&mut message) {
                Some(message_id) => {
                    messages.insert(message_id, message);
                }
                None => {
                    tracing::warn!("skipping chat message without an id");
                }
            }
        }

        let mut tables = Tables::new();
        tables.insert(CHAT_GROUPS_TABLE.to_string(), groups);
        tables.insert(CHAT_MESSAGES_TABLE.to_string(), messages);
        Ok(tables)
    }
}

fn take_id(row: &mut Row) -> Option<EntityId> {
    match row.remove("id")? {
        Value::String(id) if !id.is_empty() => Some(id),
        _ => None,
    }
}

fn message_group_id(message: &Row) -> Option<&str> {
    message.get(CHAT_GROUP_ID_FIELD).and_then(Value::as_str)
}

fn created_at(row: &Row) -> &str {
    row.get("created_at").and_then(Value::as_str).unwrap_or_default()
}

pub fn create_chat_persister(ctx: PersistContext) -> CollectorPersister {
    let options = CollectorOptions::new("chats")
        .with_safeguard(ctx.settings.cleanup)
        .with_watch(
            vec![format!("{CHATS_DIR}/")],
            WatchMode::Entity {
                parser: folder_entity_parser(CHATS_DIR),
            },
        );
    let hooks = ChatHooks::new(ctx.store.clone(), ctx.io.clone());
    CollectorPersister::new(ctx, Arc::new(hooks), options)
}

struct ChatHooks {
    io: Arc<dyn FileIo>,
    marker: DeletionMarker,
    /// Groups whose file exists but could not be parsed.
    unreadable: Mutex<BTreeSet<EntityId>>,
}

impl ChatHooks {
    fn new(store: Arc<dyn TableStore>, io: Arc<dyn FileIo>) -> Self {
        Self {
            marker: DeletionMarker::new(
                store,
                vec![
                    DeletionTable::primary(CHAT_GROUPS_TABLE),
                    DeletionTable::secondary(CHAT_MESSAGES_TABLE)
                        .owned_by(CHAT_GROUPS_TABLE, CHAT_GROUP_ID_FIELD),
                ],
            ),
            io,
            unreadable: Mutex::new(BTreeSet::new()),
        }
    }

    fn lock_unreadable(&self) -> std::sync::MutexGuard<'_, BTreeSet<EntityId>> {
        self.unreadable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Groups whose file must be rewritten (`true`) or removed (`false`).
    fn affected_groups(&self, tables: &Tables, changed: Option<&ChangedTables>) -> Vec<(EntityId, bool)> {
        let groups = tables.get(CHAT_GROUPS_TABLE);
        let messages = tables.get(CHAT_MESSAGES_TABLE);
        let mut affected = BTreeSet::new();

        match changed {
            None => affected.extend(groups.into_iter().flat_map(|rows| rows.keys().cloned())),
            Some(changed) => {
                if let Some(rows) = changed.get(CHAT_GROUPS_TABLE) {
                    affected.extend(rows.keys().cloned());
                }
                if let Some(rows) = changed.get(CHAT_MESSAGES_TABLE) {
                    for message_id in rows.keys() {
                        match messages.and_then(|table| table.get(message_id)) {
                            Some(message) => {
                                if let Some(group_id) = message_group_id(message) {
                                    affected.insert(group_id.to_string());
                                }
                            }
                            // Removed messages no longer say which group held them.
                            None => affected.extend(groups.into_iter().flat_map(|rows| rows.keys().cloned())),
                        }
                    }
                }
            }
        }

        affected
            .into_iter()
            .map(|group_id| {
                let exists = groups.is_some_and(|rows| rows.contains_key(&group_id));
                (group_id, exists)
            })
            .collect()
    }

    fn parse(&self, path: &Path, text: &str) -> Option<Tables> {
        let parsed = serde_json::from_str::<ChatFile>(text)
            .map_err(PersistError::from)
            .and_then(ChatFile::into_tables);
        match parsed {
            Ok(tables) => Some(tables),
            Err(error) => {
                tracing::warn!(label = "chats", path = %path.display(), error = %error, "skipping malformed chat file");
                None
            }
        }
    }
}

fn empty_chat_tables() -> Tables {
    let mut tables = Tables::new();
    tables.insert(CHAT_GROUPS_TABLE.to_string(), Table::new());
    tables.insert(CHAT_MESSAGES_TABLE.to_string(), Table::new());
    tables
}

#[async_trait]
impl CollectorHooks for ChatHooks {
    fn tables(&self) -> Vec<String> {
        vec![CHAT_GROUPS_TABLE.to_string(), CHAT_MESSAGES_TABLE.to_string()]
    }

    fn save(&self, tables: &Tables, data_dir: &Path, changed: Option<&ChangedTables>) -> Vec<WriteOperation> {
        let empty = Table::new();
        let groups = tables.get(CHAT_GROUPS_TABLE).unwrap_or(&empty);
        let messages = tables.get(CHAT_MESSAGES_TABLE).unwrap_or(&empty);

        let unreadable = if changed.is_none() {
            self.lock_unreadable().clone()
        } else {
            BTreeSet::new()
        };
        let mut operations = Vec::new();
        let mut removed = Vec::new();
        for (group_id, exists) in self.affected_groups(tables, changed) {
            if !exists {
                removed.push(build_chat_path(data_dir, &group_id));
                continue;
            }
            if unreadable.contains(&group_id) {
                continue;
            }
            let Some(group) = groups.get(&group_id) else {
                continue;
            };
            let file = ChatFile::from_tables(&group_id, group, messages);
            match serde_json::to_value(&file) {
                Ok(content) => operations.push(WriteOperation::WriteJson {
                    content,
                    path: build_chat_messages_path(data_dir, &group_id),
                }),
                Err(error) => {
                    tracing::warn!(label = "chats", group_id = %group_id, error = %error, "skipping chat group that cannot be encoded");
                }
            }
        }
        if !removed.is_empty() {
            operations.push(WriteOperation::Delete { paths: removed });
        }
        operations
    }

    async fn load(&self, data_dir: &Path) -> Option<TableChanges> {
        let chats_dir = data_dir.join(CHATS_DIR);
        let scan = match self
            .io
            .scan_and_read(&chats_dir, &[CHAT_MESSAGES_FILE.to_string()], false, None)
            .await
        {
            Ok(scan) => Some(scan),
            Err(error) if error.is_not_found() => None,
            Err(error) => {
                tracing::error!(label = "chats", error = %error, "scan failed");
                return None;
            }
        };

        let mut loaded = empty_chat_tables();
        let mut unreadable = BTreeSet::new();
        let mut preserved = BTreeSet::new();
        for (path, text) in scan.map(|scan| scan.files).unwrap_or_default() {
            let Some(group_dir) = path.parent() else {
                continue;
            };
            if group_dir.parent() != Some(chats_dir.as_path()) {
                continue;
            }
            let group_id = group_dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            if self.io.is_own_write(&path, &text) {
                preserved.insert(group_id);
                continue;
            }
            let Some(tables) = self.parse(&path, &text) else {
                unreadable.insert(group_id);
                continue;
            };
            for (table_name, rows) in tables {
                loaded.entry(table_name).or_default().extend(rows);
            }
        }
        preserved.extend(unreadable.iter().cloned());
        *self.lock_unreadable() = unreadable;
        Some(self.marker.mark_all_preserving(&loaded, &preserved))
    }

    fn cleanup(&self, tables: &Tables) -> Vec<OrphanCleanupConfig> {
        let mut keep_ids = tables
            .get(CHAT_GROUPS_TABLE)
            .map(|rows| rows.keys().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default();
        keep_ids.extend(self.lock_unreadable().iter().cloned());
        vec![OrphanCleanupConfig::new(
            CleanupTarget::Dirs {
                subdir: CHATS_DIR.to_string(),
                marker_file: CHAT_MESSAGES_FILE.to_string(),
            },
            keep_ids,
        )]
    }

    async fn load_single(&self, data_dir: &Path, entity_id: &str) -> PersistResult<Option<TableChanges>> {
        let path = build_chat_messages_path(data_dir, entity_id);
        let loaded = match self.io.read_text_file(&path).await {
            Ok(text) if self.io.is_own_write(&path, &text) => return Ok(None),
            Ok(text) => match self.parse(&path, &text) {
                Some(tables) => tables,
                None => {
                    self.lock_unreadable().insert(entity_id.to_string());
                    return Ok(None);
                }
            },
            Err(error) if error.is_not_found() => empty_chat_tables(),
            Err(error) => return Err(error),
        };
        self.lock_unreadable().remove(entity_id);
        let changes = self.marker.mark_for_entity(&loaded, &entity_id.to_string());
        if changes.values().all(|rows| rows.is_empty()) {
            return Ok(None);
        }
        Ok(Some(changes))
    }
}
