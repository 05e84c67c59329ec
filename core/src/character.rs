//! A tracked character file and its backups
//!
//! Every operation that touches a character's files runs while holding that
//! character's state lock, so rotation, archiving and restores never
//! interleave for the same character. Notifications caused by those
//! operations are recognised by looking at the files afterwards rather than
//! by muting the watcher:
//! - a deletion is only acted on if the file is really gone
//! - a modification only rotates if slot 1 no longer matches the live file

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};

use crate::error::{GuardError, IoContext};
use crate::header::read_character_name_from_path;
use crate::layout::{SaveLayout, renamed_backup};
use crate::rotation::{BackupPolicy, copy_with_retry, is_death_transition, rotate_slots};

const EVENT_CAPACITY: usize = 64;

/// Point-in-time view of a tracked character.
#[derive(Debug, Clone, Serialize)]
pub struct CharacterInfo {
    pub file_name: String,
    pub full_path: PathBuf,
    pub display_name: String,
    pub size: u64,
    pub last_played: DateTime<Local>,
    pub archived: bool,
    /// Newest first
    pub backups: Vec<BackupInfo>,
    pub pre_death_backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub modified: DateTime<Local>,
}

impl BackupInfo {
    /// `None` if the backup disappeared since the last scan.
    fn read(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            file_name: path.file_name()?.to_string_lossy().into_owned(),
            size: metadata.len(),
            modified: metadata.modified().ok()?.into(),
        })
    }
}

/// Published on a character's own channel whenever its files change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterEvent {
    /// File name after the change
    pub file_name: String,
    pub change: CharacterChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CharacterChange {
    BackedUp,
    DeathDetected,
    Archived { previous: String },
    Unpacked { previous: String },
    /// An archived file was deleted and put back from its newest backup
    Recreated,
    Restored { index: usize },
    Resurrected,
    NameReloaded,
}

/// File name change produced by archiving or unpacking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRename {
    pub from: String,
    pub to: String,
}

#[derive(Debug)]
struct CharacterState {
    main_path: PathBuf,
    display_name: String,
    last_modified: SystemTime,
    size: u64,
    archived: bool,
    backups: Vec<PathBuf>,
    pre_death: Option<PathBuf>,
}

impl CharacterState {
    fn file_name(&self) -> String {
        self.main_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub struct TrackedCharacter {
    layout: Arc<SaveLayout>,
    policy: BackupPolicy,
    state: Mutex<CharacterState>,
    events: broadcast::Sender<CharacterEvent>,
}

impl TrackedCharacter {
    /// Start tracking the character file at `path`.
    ///
    /// Fails without side effects if the header cannot be read. A fresh
    /// backup is taken right away when an active file has none, or when the
    /// newest backup no longer matches the live file.
    pub async fn open(
        path: PathBuf,
        layout: Arc<SaveLayout>,
        policy: BackupPolicy,
    ) -> Result<Self, GuardError> {
        let file_name = utf8_file_name(&path)?;
        let metadata = fs::metadata(&path).at(&path)?;
        let display_name = read_character_name_from_path(&path)?;
        let backups = layout.scan_backups(&file_name)?;

        let state = CharacterState {
            display_name,
            last_modified: metadata.modified().at(&path)?,
            size: metadata.len(),
            archived: layout.is_archive_file(&file_name),
            backups: backups.slots,
            pre_death: backups.pre_death,
            main_path: path,
        };

        let character = Self {
            layout,
            policy,
            state: Mutex::new(state),
            events: broadcast::channel(EVENT_CAPACITY).0,
        };

        {
            let mut state = character.state.lock().await;
            let needs_baseline = match state.backups.first() {
                None => !state.archived,
                Some(newest) => is_stale(&state.main_path, newest)?,
            };
            if needs_baseline {
                tracing::debug!(file = %file_name, "Taking baseline backup");
                character.rotate(&mut state).await?;
            }
        }

        Ok(character)
    }

    pub async fn file_name(&self) -> String {
        self.state.lock().await.file_name()
    }

    pub async fn is_archived(&self) -> bool {
        self.state.lock().await.archived
    }

    pub async fn info(&self) -> CharacterInfo {
        let state = self.state.lock().await;
        CharacterInfo {
            file_name: state.file_name(),
            full_path: state.main_path.clone(),
            display_name: state.display_name.clone(),
            size: state.size,
            last_played: state.last_modified.into(),
            archived: state.archived,
            backups: state
                .backups
                .iter()
                .filter_map(|p| BackupInfo::read(p))
                .collect(),
            pre_death_backup: state.pre_death.clone(),
        }
    }

    /// Receive this character's change notifications. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<CharacterEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// The live file was written. Rotates unless slot 1 already holds it.
    pub(crate) async fn handle_modified(&self) -> Result<bool, GuardError> {
        let mut state = self.state.lock().await;
        if !state.main_path.exists() {
            return Ok(false);
        }

        let newest = self.layout.backup_path(&state.file_name(), 1);
        if newest.exists() && !is_stale(&state.main_path, &newest)? {
            tracing::trace!(file = %state.file_name(), "Backup already current");
            return Ok(false);
        }

        self.rotate(&mut state).await
    }

    /// The live file disappeared. Active characters are moved to the archive
    /// naming scheme; archived ones are put back from their newest backup.
    pub(crate) async fn handle_deleted(&self) -> Result<Option<FileRename>, GuardError> {
        let mut state = self.state.lock().await;
        let file_name = state.file_name();
        if state.main_path.exists() {
            tracing::trace!(file = %file_name, "Delete notification for a present file");
            return Ok(None);
        }

        let backups = self.layout.scan_backups(&file_name)?;
        let Some(newest) = backups.slots.first().cloned() else {
            return Err(GuardError::NoBackupToArchive { file_name });
        };

        if state.archived {
            copy_with_retry(&newest, &state.main_path, &self.policy.retry).await?;
            self.refresh(&mut state)?;
            tracing::info!(file = %file_name, "Archived file deleted, restored from newest backup");
            self.publish(&state, CharacterChange::Recreated);
            return Ok(None);
        }

        let base = self
            .layout
            .find_viable_name(&self.layout.archive_prefix, &self.layout.archive_extension)?;

        // The rename below moves the live file, so put it back first
        copy_with_retry(&newest, &state.main_path, &self.policy.retry).await?;
        state.backups = backups.slots;
        state.pre_death = backups.pre_death;

        let extension = self.layout.archive_extension.clone();
        let rename = match self.rename_all(&mut state, &base, &extension) {
            Ok(rename) => rename,
            Err(e) => {
                // Leave the character deleted, as the player left it
                if let Err(undo) = fs::remove_file(&state.main_path) {
                    tracing::error!(file = %file_name, error = %undo, "Failed to remove restored copy");
                }
                return Err(e);
            }
        };
        state.archived = true;
        self.refresh(&mut state)?;

        tracing::info!(from = %rename.from, to = %rename.to, "Character deleted, archived");
        self.publish(
            &state,
            CharacterChange::Archived {
                previous: rename.from.clone(),
            },
        );
        Ok(Some(rename))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operator commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Rotate unconditionally.
    pub(crate) async fn backup_now(&self) -> Result<bool, GuardError> {
        let mut state = self.state.lock().await;
        self.rotate(&mut state).await
    }

    /// Move an archived character back under an active name.
    pub(crate) async fn unpack(&self) -> Result<FileRename, GuardError> {
        let mut state = self.state.lock().await;
        if !state.archived {
            return Err(GuardError::NotArchived {
                file_name: state.file_name(),
            });
        }

        let base = self
            .layout
            .find_viable_name(&self.layout.character_prefix, &self.layout.character_extension)?;
        let extension = self.layout.character_extension.clone();
        let rename = self.rename_all(&mut state, &base, &extension)?;
        state.archived = false;
        self.refresh(&mut state)?;

        tracing::info!(from = %rename.from, to = %rename.to, "Character unpacked");
        self.publish(
            &state,
            CharacterChange::Unpacked {
                previous: rename.from.clone(),
            },
        );
        Ok(rename)
    }

    /// Replace the live file with backup `index` (0 = newest) and rotate.
    pub(crate) async fn restore(&self, index: usize) -> Result<(), GuardError> {
        let mut state = self.state.lock().await;
        let file_name = state.file_name();
        state.backups = self.layout.scan_backups(&file_name)?.slots;

        let Some(source) = state.backups.get(index).cloned() else {
            return Err(GuardError::NoSuchBackup {
                file_name,
                index,
                available: state.backups.len(),
            });
        };

        replace_main(&state.main_path, &source)?;
        tracing::info!(file = %file_name, backup = %source.display(), "Restored from backup");

        self.rotate(&mut state).await?;
        self.publish(&state, CharacterChange::Restored { index });
        Ok(())
    }

    /// Replace the live file with the pre-death backup and rotate.
    ///
    /// Returns `false` when there is no pre-death backup to use; a recorded
    /// one that vanished from disk is forgotten.
    pub(crate) async fn resurrect(&self) -> Result<bool, GuardError> {
        let mut state = self.state.lock().await;
        let Some(pre_death) = state.pre_death.clone() else {
            return Ok(false);
        };

        if !pre_death.exists() {
            tracing::debug!(file = %state.file_name(), "Pre-death backup is gone");
            state.pre_death = None;
            return Ok(false);
        }

        replace_main(&state.main_path, &pre_death)?;
        state.pre_death = None;
        tracing::info!(file = %state.file_name(), "Resurrected from pre-death backup");

        self.rotate(&mut state).await?;
        self.publish(&state, CharacterChange::Resurrected);
        Ok(true)
    }

    /// Read the display name from the live file again.
    pub(crate) async fn reload_display_name(&self) -> Result<String, GuardError> {
        let mut state = self.state.lock().await;
        state.display_name = read_character_name_from_path(&state.main_path)?;
        self.publish(&state, CharacterChange::NameReloaded);
        Ok(state.display_name.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals (state lock held)
    // ─────────────────────────────────────────────────────────────────────────

    async fn rotate(&self, state: &mut CharacterState) -> Result<bool, GuardError> {
        // A racing delete notification will take care of this one
        if !state.main_path.exists() {
            return Ok(false);
        }

        let file_name = state.file_name();
        rotate_slots(&self.layout, &file_name, &state.main_path, &self.policy.retry).await?;
        self.refresh(state)?;
        tracing::debug!(file = %file_name, size = state.size, slots = state.backups.len(), "Backed up");
        self.publish(state, CharacterChange::BackedUp);

        if is_death_transition(&state.backups, self.policy.death_threshold)? {
            let pre_death = self.layout.pre_death_path(&file_name);
            if pre_death.exists() {
                fs::remove_file(&pre_death).at(&pre_death)?;
            }
            copy_with_retry(&state.backups[1], &pre_death, &self.policy.retry).await?;
            state.pre_death = Some(pre_death);

            tracing::info!(file = %file_name, name = %state.display_name, "Death detected, kept pre-death backup");
            self.publish(state, CharacterChange::DeathDetected);
        }

        Ok(true)
    }

    /// Re-read size and timestamp of the live file and rescan backups.
    fn refresh(&self, state: &mut CharacterState) -> Result<(), GuardError> {
        let metadata = fs::metadata(&state.main_path).at(&state.main_path)?;
        state.size = metadata.len();
        state.last_modified = metadata.modified().at(&state.main_path)?;

        let backups = self.layout.scan_backups(&state.file_name())?;
        state.backups = backups.slots;
        state.pre_death = backups.pre_death;
        Ok(())
    }

    /// Rename the live file to `<base><extension>` and every backup with it.
    ///
    /// All or nothing: if any rename fails, the ones already done are undone
    /// and `state` keeps pointing at the old name.
    fn rename_all(
        &self,
        state: &mut CharacterState,
        base: &str,
        extension: &str,
    ) -> Result<FileRename, GuardError> {
        let old_name = state.file_name();
        let new_name = format!("{base}{extension}");

        let mut moves = vec![(state.main_path.clone(), self.layout.main_path(&new_name))];
        moves.extend(
            state
                .backups
                .iter()
                .chain(state.pre_death.iter())
                .filter_map(|path| Some((path.clone(), renamed_backup(path, &old_name, &new_name)?))),
        );

        for (done, (from, to)) in moves.iter().enumerate() {
            if let Err(e) = fs::rename(from, to) {
                undo_renames(&moves[..done]);
                // Whatever broke the rename may have been a stale slot list
                if let Ok(backups) = self.layout.scan_backups(&old_name) {
                    state.backups = backups.slots;
                    state.pre_death = backups.pre_death;
                }
                return Err(GuardError::io(from, e));
            }
        }

        state.main_path = moves[0].1.clone();
        let backups = self.layout.scan_backups(&new_name)?;
        state.backups = backups.slots;
        state.pre_death = backups.pre_death;

        Ok(FileRename {
            from: old_name,
            to: new_name,
        })
    }

    fn publish(&self, state: &CharacterState, change: CharacterChange) {
        // No subscribers is fine
        let _ = self.events.send(CharacterEvent {
            file_name: state.file_name(),
            change,
        });
    }
}

impl std::fmt::Debug for TrackedCharacter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedCharacter")
            .field("layout", &self.layout)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// The newest backup no longer holds what the live file holds.
fn is_stale(main: &Path, newest: &Path) -> Result<bool, GuardError> {
    let main_meta = fs::metadata(main).at(main)?;
    let backup_meta = fs::metadata(newest).at(newest)?;

    if main_meta.len() != backup_meta.len()
        || main_meta.modified().at(main)? > backup_meta.modified().at(newest)?
    {
        return Ok(true);
    }
    // Equal size and timestamp still happen on coarse clocks
    Ok(fs::read(main).at(main)? != fs::read(newest).at(newest)?)
}

/// Move each `(from, to)` back, newest first. Failures are only logged.
fn undo_renames(moves: &[(PathBuf, PathBuf)]) {
    for (from, to) in moves.iter().rev() {
        if let Err(e) = fs::rename(to, from) {
            tracing::error!(from = %to.display(), to = %from.display(), error = %e, "Failed to undo rename");
        }
    }
}

fn replace_main(main: &Path, source: &Path) -> Result<(), GuardError> {
    if main.exists() {
        fs::remove_file(main).at(main)?;
    }
    fs::rename(source, main).at(source)
}

fn utf8_file_name(path: &Path) -> Result<String, GuardError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            GuardError::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "file name is not valid UTF-8"),
            )
        })
}
