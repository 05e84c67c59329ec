use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the backup engine.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed character header in {path:?}: {source}")]
    Header { path: PathBuf, source: HeaderError },

    #[error("no free name left for {prefix}NNNN{extension}")]
    NameSpaceExhausted { prefix: String, extension: String },

    #[error("{file_name} has no backup to archive from")]
    NoBackupToArchive { file_name: String },

    #[error("{file_name} has no backup #{index} ({available} available)")]
    NoSuchBackup {
        file_name: String,
        index: usize,
        available: usize,
    },

    #[error("{file_name} is not archived")]
    NotArchived { file_name: String },

    #[error("no tracked character named {file_name}")]
    UnknownCharacter { file_name: String },

    #[error("failed to watch game directory: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GuardError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors reading the character name out of a save header.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("file ends before the name field at offset {offset}")]
    Truncated { offset: u64 },

    #[error("name field has no terminating zero byte")]
    Unterminated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Attach a path to a raw I/O result.
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T, GuardError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T, GuardError> {
        self.map_err(|e| GuardError::io(path, e))
    }
}
