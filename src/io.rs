use crate::errors::{PersistError, PersistResult};
use crate::frontmatter::{deserialize_document, document_id, serialize_document};
use crate::models::{CleanupTarget, DocumentBatch, EntityId, ParsedDocument, ScanResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;

/// Batched file operations consumed by the persisters.
///
/// Implementations report missing directories and files as
/// [`PersistError::NotFound`]; `remove` treats a missing path as success.
#[async_trait]
pub trait FileIo: Send + Sync {
    /// Reads every `*.md` document directly inside `dir`, keyed by file stem.
    /// Documents that fail to parse are reported in `unreadable`; documents
    /// still holding this port's last write are reported in `unchanged`.
    async fn read_document_batch(&self, dir: &Path) -> PersistResult<DocumentBatch>;

    /// Returns the number of files actually rewritten.
    async fn write_document_batch(&self, items: Vec<(ParsedDocument, PathBuf)>) -> PersistResult<usize>;

    async fn write_json_batch(&self, items: Vec<(Value, PathBuf)>) -> PersistResult<usize>;

    async fn read_text_file(&self, path: &Path) -> PersistResult<String>;

    async fn remove(&self, path: &Path) -> PersistResult<()>;

    /// Whether `content` is exactly what this port last wrote to `path`.
    fn is_own_write(&self, _path: &Path, _content: &str) -> bool {
        false
    }

    /// Collects files under `dir` whose name matches one of `patterns`
    /// (`"*.ext"` or an exact file name). Without `recursive` only `dir` and
    /// its immediate subdirectories are visited.
    async fn scan_and_read(
        &self,
        dir: &Path,
        patterns: &[String],
        recursive: bool,
        path_filter: Option<&str>,
    ) -> PersistResult<ScanResult>;

    /// Deletes every item of `target`'s shape whose ID is not in `keep_ids`.
    async fn cleanup_orphan(
        &self,
        data_dir: &Path,
        target: &CleanupTarget,
        keep_ids: &[EntityId],
    ) -> PersistResult<usize>;
}

/// `tokio::fs` implementation. Remembers a fingerprint of every file it
/// writes so file events caused by its own writes can be told apart from
/// external edits.
#[derive(Debug, Clone, Default)]
pub struct LocalFileIo {
    written: Arc<Mutex<HashMap<PathBuf, u64>>>,
}

impl LocalFileIo {
    pub fn new() -> Self {
        Self::default()
    }

    async fn write_tracked(&self, path: &Path, rendered: &str) -> PersistResult<bool> {
        let changed = write_if_changed(path, rendered).await?;
        self.lock_written().insert(path.to_path_buf(), fingerprint(rendered));
        Ok(changed)
    }

    fn forget(&self, path: &Path) {
        self.lock_written().retain(|written, _| !written.starts_with(path));
    }

    fn lock_written(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, u64>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FileIo for LocalFileIo {
    async fn read_document_batch(&self, dir: &Path) -> PersistResult<DocumentBatch> {
        let mut batch = DocumentBatch::default();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || !has_extension(&path, "md") {
                continue;
            }
            let Some(entity_id) = file_stem(&path) else {
                continue;
            };
            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "skipping unreadable document");
                    batch.unreadable.insert(entity_id);
                    continue;
                }
            };
            if self.is_own_write(&path, &text) {
                batch.unchanged.insert(entity_id);
                continue;
            }
            match deserialize_document(&text) {
                Ok(document) => {
                    batch.documents.insert(entity_id, document);
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "skipping malformed document");
                    batch.unreadable.insert(entity_id);
                }
            }
        }
        Ok(batch)
    }

    async fn write_document_batch(&self, items: Vec<(ParsedDocument, PathBuf)>) -> PersistResult<usize> {
        let mut failures = BatchFailures::new(items.len());
        let mut written = 0;
        for (document, path) in items {
            let result = match serialize_document(&document) {
                Ok(rendered) => self.write_tracked(&path, &rendered).await,
                Err(error) => Err(error),
            };
            match result {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(error) => failures.record(&path, error),
            }
        }
        failures.into_result(written)
    }

    async fn write_json_batch(&self, items: Vec<(Value, PathBuf)>) -> PersistResult<usize> {
        let mut failures = BatchFailures::new(items.len());
        let mut written = 0;
        for (content, path) in items {
            let result = match serde_json::to_string_pretty(&content) {
                Ok(rendered) => self.write_tracked(&path, &rendered).await,
                Err(error) => Err(error.into()),
            };
            match result {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(error) => failures.record(&path, error),
            }
        }
        failures.into_result(written)
    }

    async fn read_text_file(&self, path: &Path) -> PersistResult<String> {
        Ok(fs::read_to_string(path).await?)
    }

    async fn remove(&self, path: &Path) -> PersistResult<()> {
        self.forget(path);
        let metadata = match fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        let result = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn is_own_write(&self, path: &Path, content: &str) -> bool {
        self.lock_written().get(path) == Some(&fingerprint(content))
    }

    async fn scan_and_read(
        &self,
        dir: &Path,
        patterns: &[String],
        recursive: bool,
        path_filter: Option<&str>,
    ) -> PersistResult<ScanResult> {
        fs::metadata(dir).await?;
        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut dirs = BTreeSet::new();
        let mut files = BTreeMap::new();
        let mut pending = vec![(dir.to_path_buf(), 0usize)];

        while let Some((current, depth)) = pending.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if depth < max_depth {
                        pending.push((path, depth + 1));
                    }
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !patterns.iter().any(|pattern| matches_pattern(&name, pattern)) {
                    continue;
                }
                if let Some(filter) = path_filter {
                    if !path.to_string_lossy().contains(filter) {
                        continue;
                    }
                }
                match fs::read_to_string(&path).await {
                    Ok(content) => {
                        dirs.insert(current.clone());
                        files.insert(path, content);
                    }
                    Err(error) => {
                        tracing::warn!(path = %path.display(), error = %error, "skipping unreadable file during scan");
                    }
                }
            }
        }

        Ok(ScanResult {
            dirs: dirs.into_iter().collect(),
            files,
        })
    }

    async fn cleanup_orphan(
        &self,
        data_dir: &Path,
        target: &CleanupTarget,
        keep_ids: &[EntityId],
    ) -> PersistResult<usize> {
        let keep = keep_ids.iter().map(String::as_str).collect::<HashSet<_>>();
        let candidates = match cleanup_candidates(data_dir, target).await {
            Ok(candidates) => candidates,
            Err(error) if error.is_not_found() => return Ok(0),
            Err(error) => return Err(error),
        };

        let mut removed = 0;
        for (entity_id, path) in candidates {
            if keep.contains(entity_id.as_str()) {
                continue;
            }
            self.remove(&path).await?;
            tracing::debug!(path = %path.display(), kind = target.kind(), "removed orphan");
            removed += 1;
        }
        Ok(removed)
    }
}

/// Lists `(entity_id, path)` for every on-disk item of `target`'s shape.
pub async fn cleanup_candidates(
    data_dir: &Path,
    target: &CleanupTarget,
) -> PersistResult<Vec<(EntityId, PathBuf)>> {
    let root = data_dir.join(target.subdir());
    let mut candidates = Vec::new();
    match target {
        CleanupTarget::Dirs { marker_file, .. } => {
            let mut entries = fs::read_dir(&root).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                if !fs::try_exists(path.join(marker_file)).await? {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                candidates.push((name, path));
            }
        }
        CleanupTarget::Files { extension, .. } => {
            let mut entries = fs::read_dir(&root).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !entry.file_type().await?.is_file() || !has_extension(&path, extension) {
                    continue;
                }
                if let Some(stem) = file_stem(&path) {
                    candidates.push((stem, path));
                }
            }
        }
        CleanupTarget::FilesRecursive {
            marker_file,
            extension,
            ..
        } => {
            fs::metadata(&root).await?;
            let mut pending = vec![root];
            while let Some(current) = pending.pop() {
                let marked = fs::try_exists(current.join(marker_file)).await?;
                let mut entries = fs::read_dir(&current).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        pending.push(path);
                    } else if marked && file_type.is_file() && has_extension(&path, extension) {
                        // Documents without a readable `id` are never orphans.
                        let Ok(text) = fs::read_to_string(&path).await else {
                            continue;
                        };
                        if let Some(entity_id) = document_id(&text) {
                            candidates.push((entity_id, path));
                        }
                    }
                }
            }
        }
    }
    Ok(candidates)
}

pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|value| value.to_str()) == Some(extension)
}

fn file_stem(path: &Path) -> Option<EntityId> {
    path.file_stem()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

async fn write_if_changed(path: &Path, rendered: &str) -> PersistResult<bool> {
    if let Ok(existing) = fs::read_to_string(path).await {
        if existing == rendered {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let staging = staging_path(path);
    fs::write(&staging, rendered).await?;
    if let Err(error) = fs::rename(&staging, path).await {
        let _ = fs::remove_file(&staging).await;
        return Err(error.into());
    }
    Ok(true)
}

fn fingerprint(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

struct BatchFailures {
    total: usize,
    failed: usize,
    first: Option<String>,
}

impl BatchFailures {
    fn new(total: usize) -> Self {
        Self {
            total,
            failed: 0,
            first: None,
        }
    }

    fn record(&mut self, path: &Path, error: PersistError) {
        self.failed += 1;
        if self.first.is_none() {
            self.first = Some(format!("{}: {}", path.display(), error));
        }
    }

    fn into_result(self, written: usize) -> PersistResult<usize> {
        match self.first {
            None => Ok(written),
            Some(first) => Err(PersistError::Io(format!(
                "{} of {} writes failed; first: {}",
                self.failed, self.total, first
            ))),
        }
    }
}
