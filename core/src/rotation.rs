//! Rotating backups
//!
//! Rotation frees slot 1 by sliding existing backups up until the first
//! empty slot, then copies the live file into slot 1. A hole left by a
//! deleted backup is filled by the slide, so older backups past the hole
//! stay where they are.

use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::Duration;

use charguard_types::GuardConfig;

use crate::error::{GuardError, IoContext};
use crate::layout::{ROTATING_SLOTS, SaveLayout};

/// How to retry a copy that fails because the game holds the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    /// `None` retries until the copy succeeds.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(20),
            max_attempts: None,
        }
    }
}

/// Tunables shared by every tracked character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPolicy {
    /// Saves smaller than this are taken to be written right after a death.
    pub death_threshold: u64,
    pub retry: RetryPolicy,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            death_threshold: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

impl BackupPolicy {
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            death_threshold: config.death_threshold_bytes,
            retry: RetryPolicy {
                backoff: Duration::from_millis(config.copy_retry.backoff_ms),
                max_attempts: config.copy_retry.max_attempts,
            },
        }
    }
}

/// Shift existing backups of `file_name` and copy the live file into slot 1.
pub async fn rotate_slots(
    layout: &SaveLayout,
    file_name: &str,
    main_path: &Path,
    retry: &RetryPolicy,
) -> Result<(), GuardError> {
    // First free slot among 1..=4; when all are taken slot 5 is overwritten.
    let mut free = 1;
    while free < ROTATING_SLOTS && layout.backup_path(file_name, free).exists() {
        free += 1;
    }

    for slot in (1..free).rev() {
        let from = layout.backup_path(file_name, slot);
        let to = layout.backup_path(file_name, slot + 1);
        if to.exists() {
            fs::remove_file(&to).at(&to)?;
        }
        fs::rename(&from, &to).at(&from)?;
    }

    let newest = layout.backup_path(file_name, 1);
    copy_with_retry(main_path, &newest, retry).await
}

/// Copy `src` to `dst`, retrying while the source is locked by another process.
///
/// The copy is stamped with the source's modification time so it can be
/// compared against the live file later.
pub async fn copy_with_retry(src: &Path, dst: &Path, retry: &RetryPolicy) -> Result<(), GuardError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match copy_preserving_mtime(src, dst) {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) => {
                if retry.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(GuardError::io(src, e));
                }
                tracing::trace!(src = %src.display(), attempts, error = %e, "Copy blocked, retrying");
                tokio::time::sleep(retry.backoff).await;
            }
            Err(e) => return Err(GuardError::io(src, e)),
        }
    }
}

fn copy_preserving_mtime(src: &Path, dst: &Path) -> io::Result<()> {
    // Read before copying: a save landing mid-copy must leave the copy looking older
    let modified = fs::metadata(src)?.modified()?;
    fs::copy(src, dst)?;
    File::options().write(true).open(dst)?.set_modified(modified)
}

/// Errors worth waiting out: the game has the file open.
fn is_transient(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    #[cfg(windows)]
    if matches!(err.raw_os_error(), Some(32) | Some(33)) {
        return true;
    }

    matches!(
        err.kind(),
        ErrorKind::PermissionDenied | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// A small slot 1 right after a large slot 2 means the character just died.
pub fn is_death_transition(slots: &[impl AsRef<Path>], threshold: u64) -> Result<bool, GuardError> {
    let [newest, previous, ..] = slots else {
        return Ok(false);
    };
    let newest = newest.as_ref();
    let previous = previous.as_ref();

    let newest_len = fs::metadata(newest).at(newest)?.len();
    let previous_len = fs::metadata(previous).at(previous)?.len();

    Ok(newest_len < threshold && previous_len >= threshold)
}
