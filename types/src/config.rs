//! Runner configuration
//!
//! Everything here has a default matching the layout the game itself uses,
//! so an empty (or missing) config file yields a working setup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the backup engine and its runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Directory holding the live character files. `None` means the
    /// working directory of the process.
    pub game_directory: Option<PathBuf>,

    /// Name of the backup directory, relative to the game directory.
    pub backup_subdirectory: String,

    /// Extension of active character files, with leading dot.
    pub character_extension: String,

    /// Extension of archived character files, with leading dot.
    pub archive_extension: String,

    /// Name prefix used when allocating active file names.
    pub character_prefix: String,

    /// Name prefix used when allocating archived file names.
    pub archive_prefix: String,

    /// A save smaller than this right after one at or above it is treated as a death.
    pub death_threshold_bytes: u64,

    /// Retry policy for copying a file the game may still hold open.
    pub copy_retry: CopyRetryConfig,

    /// When set, logs go to a daily rolling file in this directory instead of stderr.
    pub log_directory: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            game_directory: None,
            backup_subdirectory: "backups".to_string(),
            character_extension: ".chr".to_string(),
            archive_extension: ".arch".to_string(),
            character_prefix: "game".to_string(),
            archive_prefix: "archive".to_string(),
            death_threshold_bytes: 1000,
            copy_retry: CopyRetryConfig::default(),
            log_directory: None,
        }
    }
}

/// Backoff between copy attempts that hit a sharing violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyRetryConfig {
    pub backoff_ms: u64,

    /// `None` retries forever. The game holding a file open is expected to be
    /// brief, and a stalled handler is preferred over a lost backup.
    pub max_attempts: Option<u32>,
}

impl Default for CopyRetryConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 20,
            max_attempts: None,
        }
    }
}
