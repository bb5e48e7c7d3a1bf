use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("DECODE_FAILED: {0}")]
    Decode(String),
    #[error("SETTINGS_INVALID: {0}")]
    Settings(String),
    #[error("WATCH_FAILURE: {0}")]
    Watch(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl PersistError {
    /// Missing directories and files are a valid empty state for loaders.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for PersistError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(value.to_string())
        } else {
            Self::Io(value.to_string())
        }
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<serde_yaml::Error> for PersistError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<notify::Error> for PersistError {
    fn from(value: notify::Error) -> Self {
        Self::Watch(value.to_string())
    }
}

pub type PersistResult<T> = Result<T, PersistError>;
