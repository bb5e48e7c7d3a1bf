use crate::models::{EntityId, TableChanges, Tables};
use crate::store::TableStore;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionTable {
    pub table_name: String,
    /// Only primary tables are owned wholesale by their persister, so only they
    /// may have rows inferred as deleted.
    pub is_primary: bool,
    /// Secondary rows are removed with the primary row they point at.
    pub owner: Option<TableOwner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOwner {
    pub table_name: String,
    pub foreign_key: String,
}

impl DeletionTable {
    pub fn primary(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            is_primary: true,
            owner: None,
        }
    }

    pub fn secondary(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            is_primary: false,
            owner: None,
        }
    }

    pub fn owned_by(mut self, owner_table: &str, foreign_key: &str) -> Self {
        self.owner = Some(TableOwner {
            table_name: owner_table.to_string(),
            foreign_key: foreign_key.to_string(),
        });
        self
    }
}

/// Turns a disk load into store changes, inferring explicit removals for rows
/// whose files disappeared.
#[derive(Clone)]
pub struct DeletionMarker {
    store: Arc<dyn TableStore>,
    tables: Vec<DeletionTable>,
}

impl DeletionMarker {
    pub fn new(store: Arc<dyn TableStore>, tables: Vec<DeletionTable>) -> Self {
        Self { store, tables }
    }

    pub fn mark_all(&self, loaded: &Tables) -> TableChanges {
        self.mark_all_preserving(loaded, &BTreeSet::new())
    }

    /// Like [`mark_all`](Self::mark_all), but primary rows listed in
    /// `preserved` keep their store state: their files exist even though the
    /// load could not use them.
    pub fn mark_all_preserving(&self, loaded: &Tables, preserved: &BTreeSet<EntityId>) -> TableChanges {
        let mut changes = pass_through(loaded);
        for table in self.tables.iter().filter(|table| table.is_primary) {
            let loaded_rows = loaded.get(&table.table_name);
            let removed = self
                .store
                .row_ids(&table.table_name)
                .into_iter()
                .filter(|entity_id| !preserved.contains(entity_id))
                .filter(|entity_id| !loaded_rows.is_some_and(|rows| rows.contains_key(entity_id)))
                .collect::<Vec<_>>();
            if removed.is_empty() {
                continue;
            }
            let entry = changes.entry(table.table_name.clone()).or_default();
            for entity_id in removed {
                entry.insert(entity_id, None);
            }
        }
        self.cascade(&mut changes, loaded);
        changes
    }

    pub fn mark_for_entity(&self, loaded: &Tables, entity_id: &EntityId) -> TableChanges {
        let mut changes = pass_through(loaded);
        for table in self.tables.iter().filter(|table| table.is_primary) {
            let present = loaded
                .get(&table.table_name)
                .is_some_and(|rows| rows.contains_key(entity_id));
            if !present && self.store.has_row(&table.table_name, entity_id) {
                changes
                    .entry(table.table_name.clone())
                    .or_default()
                    .insert(entity_id.clone(), None);
            }
        }
        self.cascade(&mut changes, loaded);
        changes
    }

    /// Removes stored rows of owned tables whose owner row is being removed,
    /// unless the load brought them back.
    fn cascade(&self, changes: &mut TableChanges, loaded: &Tables) {
        for table in &self.tables {
            let Some(owner) = &table.owner else {
                continue;
            };
            let removed_owners = changes
                .get(&owner.table_name)
                .map(|rows| {
                    rows.iter()
                        .filter(|(_, row)| row.is_none())
                        .map(|(entity_id, _)| entity_id.clone())
                        .collect::<BTreeSet<_>>()
                })
                .unwrap_or_default();
            if removed_owners.is_empty() {
                continue;
            }

            let loaded_rows = loaded.get(&table.table_name);
            let orphans = self
                .store
                .table(&table.table_name)
                .into_iter()
                .filter(|(_, row)| {
                    matches!(row.get(&owner.foreign_key), Some(Value::String(key)) if removed_owners.contains(key))
                })
                .filter(|(entity_id, _)| !loaded_rows.is_some_and(|rows| rows.contains_key(entity_id)))
                .map(|(entity_id, _)| entity_id)
                .collect::<Vec<_>>();
            if orphans.is_empty() {
                continue;
            }
            let entry = changes.entry(table.table_name.clone()).or_default();
            for entity_id in orphans {
                entry.insert(entity_id, None);
            }
        }
    }
}

fn pass_through(loaded: &Tables) -> TableChanges {
    loaded
        .iter()
        .map(|(table_name, rows)| {
            (
                table_name.clone(),
                rows.iter()
                    .map(|(entity_id, row)| (entity_id.clone(), Some(row.clone())))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Row, Table};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn row(name: &str) -> Row {
        json!({ "name": name }).as_object().cloned().expect("object row")
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        for id in ["a", "b", "c"] {
            store.set_row("humans", id, row(id));
        }
        store.set_row("mapping", "m1", row("m1"));
        store
    }

    fn loaded(entries: &[(&str, &[&str])]) -> Tables {
        entries
            .iter()
            .map(|(table_name, ids)| {
                (
                    table_name.to_string(),
                    ids.iter().map(|id| (id.to_string(), row(id))).collect::<Table>(),
                )
            })
            .collect()
    }

    #[test]
    fn mark_all_removes_missing_primary_rows_only() {
        let store = seeded_store();
        let marker = DeletionMarker::new(
            store,
            vec![DeletionTable::primary("humans"), DeletionTable::secondary("mapping")],
        );

        let changes = marker.mark_all(&loaded(&[("humans", &["a", "c"])]));
        let humans = &changes["humans"];
        assert_eq!(humans["a"], Some(row("a")));
        assert_eq!(humans["b"], None);
        assert_eq!(humans["c"], Some(row("c")));
        assert!(!changes.contains_key("mapping"));
    }

    #[test]
    fn mark_all_with_empty_load_removes_every_primary_row() {
        let marker = DeletionMarker::new(seeded_store(), vec![DeletionTable::primary("humans")]);
        let changes = marker.mark_all(&Tables::new());
        assert_eq!(changes["humans"].len(), 3);
        assert!(changes["humans"].values().all(Option::is_none));
    }

    #[test]
    fn mark_for_entity_only_touches_that_id() {
        let marker = DeletionMarker::new(seeded_store(), vec![DeletionTable::primary("humans")]);

        let changes = marker.mark_for_entity(&Tables::new(), &"b".to_string());
        assert_eq!(changes["humans"].len(), 1);
        assert_eq!(changes["humans"]["b"], None);

        let changes = marker.mark_for_entity(&Tables::new(), &"unknown".to_string());
        assert!(changes.is_empty());

        let changes = marker.mark_for_entity(&loaded(&[("humans", &["b"])]), &"b".to_string());
        assert_eq!(changes["humans"]["b"], Some(row("b")));
    }

    #[test]
    fn preserved_ids_are_never_removed() {
        let marker = DeletionMarker::new(seeded_store(), vec![DeletionTable::primary("humans")]);
        let preserved = BTreeSet::from(["b".to_string()]);

        let changes = marker.mark_all_preserving(&loaded(&[("humans", &["a"])]), &preserved);
        assert_eq!(changes["humans"]["c"], None);
        assert!(!changes["humans"].contains_key("b"));
    }

    #[test]
    fn removing_an_owner_removes_its_secondary_rows() {
        let store = Arc::new(MemoryStore::default());
        store.set_row("chat_groups", "g1", row("g1"));
        store.set_row("chat_groups", "g2", row("g2"));
        for (id, group) in [("m1", "g1"), ("m2", "g1"), ("m3", "g2")] {
            store.set_row(
                "chat_messages",
                id,
                json!({ "chat_group_id": group }).as_object().cloned().expect("object row"),
            );
        }
        let marker = DeletionMarker::new(
            store,
            vec![
                DeletionTable::primary("chat_groups"),
                DeletionTable::secondary("chat_messages").owned_by("chat_groups", "chat_group_id"),
            ],
        );

        let changes = marker.mark_all(&loaded(&[("chat_groups", &["g2"]), ("chat_messages", &["m3"])]));
        assert_eq!(changes["chat_groups"]["g1"], None);
        assert_eq!(changes["chat_messages"]["m1"], None);
        assert_eq!(changes["chat_messages"]["m2"], None);
        assert!(changes["chat_messages"]["m3"].is_some());

        let changes = marker.mark_for_entity(&Tables::new(), &"g2".to_string());
        assert_eq!(changes["chat_messages"].keys().collect::<Vec<_>>(), vec!["m3"]);
    }
}
