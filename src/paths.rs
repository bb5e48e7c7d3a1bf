use crate::models::EntityId;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub const MARKDOWN_EXTENSION: &str = "md";
pub const CHATS_DIR: &str = "chats";
pub const CHAT_MESSAGES_FILE: &str = "messages.json";
pub const SESSIONS_DIR: &str = "sessions";
pub const SESSION_META_FILE: &str = "_meta.json";
pub const SESSION_TRANSCRIPT_FILE: &str = "transcript.json";
pub const SESSION_MEMO_FILE: &str = "_memo.md";

/// Maps a data-dir-relative path to the entity it belongs to, or `None` when
/// the path is not ours.
pub type EntityParser = Arc<dyn Fn(&str) -> Option<EntityId> + Send + Sync>;

pub fn build_entity_path(data_dir: &Path, dir_name: &str) -> PathBuf {
    data_dir.join(dir_name)
}

pub fn build_entity_file_path(data_dir: &Path, dir_name: &str, entity_id: &str) -> PathBuf {
    data_dir
        .join(dir_name)
        .join(format!("{entity_id}.{MARKDOWN_EXTENSION}"))
}

pub fn build_chat_path(data_dir: &Path, chat_group_id: &str) -> PathBuf {
    data_dir.join(CHATS_DIR).join(chat_group_id)
}

pub fn build_chat_messages_path(data_dir: &Path, chat_group_id: &str) -> PathBuf {
    build_chat_path(data_dir, chat_group_id).join(CHAT_MESSAGES_FILE)
}

/// `sessions/<folder...>/<session_id>`; `folder_id` is a `/`-separated path.
pub fn build_session_path(data_dir: &Path, session_id: &str, folder_id: &str) -> PathBuf {
    let mut path = data_dir.join(SESSIONS_DIR);
    for part in folder_id.split('/').filter(|part| !part.is_empty()) {
        path.push(part);
    }
    path.join(session_id)
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// `humans/<id>.md` -> `<id>`. Deeper paths and other extensions are rejected.
pub fn markdown_entity_id(dir_name: &str, path: &str) -> Option<EntityId> {
    let parts = path.split('/').collect::<Vec<_>>();
    let dir_index = parts.iter().position(|part| *part == dir_name)?;
    let filename = parts.get(dir_index + 1)?;
    let stem = filename.strip_suffix(".md")?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

/// `chats/<id>/...` -> `<id>`.
pub fn folder_entity_id(dir_name: &str, path: &str) -> Option<EntityId> {
    let parts = path.split('/').collect::<Vec<_>>();
    let dir_index = parts.iter().position(|part| *part == dir_name)?;
    let folder = parts.get(dir_index + 1)?;
    if folder.is_empty() {
        return None;
    }
    Some(folder.to_string())
}

/// `sessions/<folder...>/<id>/_meta.json` -> `<id>`. Paths naming a directory
/// resolve to its last component; other files are ignored.
pub fn session_entity_id(path: &str) -> Option<EntityId> {
    let parts = path.split('/').filter(|part| !part.is_empty()).collect::<Vec<_>>();
    let dir_index = parts.iter().position(|part| *part == SESSIONS_DIR)?;
    let (last, rest) = parts[dir_index + 1..].split_last()?;
    if last.starts_with('.') {
        return None;
    }
    let is_session_file = *last == SESSION_META_FILE
        || *last == SESSION_TRANSCRIPT_FILE
        || last.ends_with(&format!(".{MARKDOWN_EXTENSION}"));
    if is_session_file {
        return rest.last().map(|dir| dir.to_string());
    }
    if last.contains('.') {
        return None;
    }
    Some(last.to_string())
}

pub fn session_entity_parser() -> EntityParser {
    Arc::new(|path: &str| session_entity_id(path))
}

pub fn markdown_entity_parser(dir_name: &str) -> EntityParser {
    let dir_name = dir_name.to_string();
    Arc::new(move |path: &str| markdown_entity_id(&dir_name, path))
}

pub fn folder_entity_parser(dir_name: &str) -> EntityParser {
    let dir_name = dir_name.to_string();
    Arc::new(move |path: &str| folder_entity_id(&dir_name, path))
}

/// Renders `path` relative to `root` with `/` separators, the form watch
/// prefixes and entity parsers expect.
pub fn relative_watch_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
