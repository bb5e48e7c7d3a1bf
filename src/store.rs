use crate::models::{ChangedTables, EntityId, Row, Table, TableChanges, Tables};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

/// The reactive table store the persisters synchronize with.
pub trait TableStore: Send + Sync {
    fn tables(&self) -> Tables;

    fn table(&self, table_name: &str) -> Table;

    fn has_row(&self, table_name: &str, entity_id: &str) -> bool;

    fn row_ids(&self, table_name: &str) -> Vec<EntityId>;

    /// Merges changes loaded from disk. Loaded changes are not re-broadcast to
    /// commit subscribers, so loading never triggers a save.
    fn apply_changes(&self, changes: &TableChanges);

    /// Receives one diff per local commit.
    fn subscribe(&self) -> broadcast::Receiver<ChangedTables>;
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    commits: broadcast::Sender<ChangedTables>,
}

impl MemoryStore {
    pub fn new(commit_capacity: usize) -> Self {
        let (commits, _) = broadcast::channel(commit_capacity.max(1));
        Self {
            tables: RwLock::new(Tables::new()),
            commits,
        }
    }

    /// Applies a local edit and notifies commit subscribers with its diff.
    pub fn commit(&self, changes: TableChanges) {
        if changes.values().all(|rows| rows.is_empty()) {
            return;
        }
        self.apply_changes(&changes);
        // No subscribers yet is fine; nothing is listening for saves.
        let _ = self.commits.send(changes);
    }

    pub fn set_row(&self, table_name: &str, entity_id: &str, row: Row) {
        self.commit(single_change(table_name, entity_id, Some(row)));
    }

    pub fn delete_row(&self, table_name: &str, entity_id: &str) {
        self.commit(single_change(table_name, entity_id, None));
    }

    pub fn row(&self, table_name: &str, entity_id: &str) -> Option<Row> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(table_name)?.get(entity_id).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TableStore for MemoryStore {
    fn tables(&self) -> Tables {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn table(&self, table_name: &str) -> Table {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table_name)
            .cloned()
            .unwrap_or_default()
    }

    fn has_row(&self, table_name: &str, entity_id: &str) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table_name)
            .is_some_and(|table| table.contains_key(entity_id))
    }

    fn row_ids(&self, table_name: &str) -> Vec<EntityId> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table_name)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn apply_changes(&self, changes: &TableChanges) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        for (table_name, rows) in changes {
            let table = tables.entry(table_name.clone()).or_default();
            for (entity_id, row) in rows {
                match row {
                    Some(row) => {
                        table.insert(entity_id.clone(), row.clone());
                    }
                    None => {
                        table.remove(entity_id);
                    }
                }
            }
            if table.is_empty() {
                tables.remove(table_name);
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangedTables> {
        self.commits.subscribe()
    }
}

fn single_change(table_name: &str, entity_id: &str, row: Option<Row>) -> TableChanges {
    let mut changes = TableChanges::new();
    changes
        .entry(table_name.to_string())
        .or_default()
        .insert(entity_id.to_string(), row);
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().expect("object row")
    }

    #[test]
    fn apply_changes_upserts_and_removes() {
        let store = MemoryStore::default();
        let mut changes = TableChanges::new();
        changes.entry("humans".to_string()).or_default().extend([
            ("a".to_string(), Some(row(json!({"name": "A"})))),
            ("b".to_string(), Some(row(json!({"name": "B"})))),
        ]);
        store.apply_changes(&changes);
        assert_eq!(store.row_ids("humans"), vec!["a", "b"]);

        let mut removal = TableChanges::new();
        removal
            .entry("humans".to_string())
            .or_default()
            .insert("a".to_string(), None);
        store.apply_changes(&removal);
        assert!(!store.has_row("humans", "a"));
        assert!(store.has_row("humans", "b"));
    }

    #[test]
    fn emptied_tables_disappear_from_the_snapshot() {
        let store = MemoryStore::default();
        store.set_row("humans", "a", row(json!({"name": "A"})));
        store.delete_row("humans", "a");
        assert!(store.tables().is_empty());
        assert!(store.table("humans").is_empty());
    }

    #[tokio::test]
    async fn commits_are_broadcast_but_loads_are_not() {
        let store = MemoryStore::default();
        let mut commits = store.subscribe();

        store.apply_changes(&crate::models::upserts(
            "humans",
            [("loaded".to_string(), row(json!({})))].into_iter().collect(),
        ));
        store.set_row("humans", "a", row(json!({"name": "A"})));

        let diff = commits.recv().await.expect("commit diff");
        assert_eq!(diff["humans"].keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(commits.try_recv().is_err());
        assert_eq!(store.row("humans", "loaded"), Some(row(json!({}))));
    }
}
