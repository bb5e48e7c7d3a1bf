use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub type EntityId = String;
pub type Row = Map<String, Value>;
pub type Table = BTreeMap<EntityId, Row>;
pub type Tables = BTreeMap<String, Table>;

/// Per-table row changes. `Some` is an upsert, `None` an explicit removal.
pub type TableChanges = BTreeMap<String, BTreeMap<EntityId, Option<Row>>>;

/// The subset of rows that changed since the last save, as computed by the store.
pub type ChangedTables = TableChanges;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub frontmatter: Map<String, Value>,
    pub content: String,
}

impl ParsedDocument {
    pub fn new(frontmatter: Map<String, Value>, content: impl Into<String>) -> Self {
        Self {
            frontmatter,
            content: content.into(),
        }
    }
}

/// Result of reading every document in one directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentBatch {
    pub documents: BTreeMap<EntityId, ParsedDocument>,
    /// Files that exist but could not be read or parsed.
    pub unreadable: BTreeSet<EntityId>,
    /// Files whose content is exactly what this process last wrote there.
    pub unchanged: BTreeSet<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    WriteJson { content: Value, path: PathBuf },
    WriteDocumentBatch { items: Vec<(ParsedDocument, PathBuf)> },
    Delete { paths: Vec<PathBuf> },
}

impl WriteOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WriteJson { .. } => "write-json",
            Self::WriteDocumentBatch { .. } => "write-document-batch",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CleanupTarget {
    Dirs {
        subdir: String,
        marker_file: String,
    },
    Files {
        subdir: String,
        extension: String,
    },
    FilesRecursive {
        subdir: String,
        marker_file: String,
        extension: String,
    },
}

impl CleanupTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dirs { .. } => "dirs",
            Self::Files { .. } => "files",
            Self::FilesRecursive { .. } => "filesRecursive",
        }
    }

    pub fn subdir(&self) -> &str {
        match self {
            Self::Dirs { subdir, .. }
            | Self::Files { subdir, .. }
            | Self::FilesRecursive { subdir, .. } => subdir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCleanupConfig {
    #[serde(flatten)]
    pub target: CleanupTarget,
    pub keep_ids: Vec<EntityId>,
}

impl OrphanCleanupConfig {
    pub fn new(target: CleanupTarget, keep_ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            target,
            keep_ids: keep_ids.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub dirs: Vec<PathBuf>,
    pub files: BTreeMap<PathBuf, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Changes(TableChanges),
    /// Incremental data is unavailable; the consumer should re-run a full load.
    Rederive,
}

pub fn upserts(table_name: &str, rows: Table) -> TableChanges {
    let mut changes = TableChanges::new();
    changes.insert(
        table_name.to_string(),
        rows.into_iter().map(|(id, row)| (id, Some(row))).collect(),
    );
    changes
}

pub fn is_empty_changes(changes: &TableChanges) -> bool {
    changes.values().all(BTreeMap::is_empty)
}
