//! On-disk layout of character files and their backups
//!
//! ```text
//! <game>/game0001.chr                    active character
//! <game>/archive0000.arch                archived character
//! <game>/backups/game0001.chr.bak1..5    rotating backups, 1 = newest
//! <game>/backups/game0001.chr.bak6       pre-death backup
//! ```
//!
//! Backup names are derived from the full file name of the character file,
//! so renaming a character means renaming every backup with it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use charguard_types::GuardConfig;

use crate::error::{GuardError, IoContext};

/// Number of rotating backup slots kept per character.
pub const ROTATING_SLOTS: u8 = 5;

/// Slot number reserved for the pre-death backup.
pub const PRE_DEATH_SLOT: u8 = 6;

/// Numeric suffixes run from 0000 to 9999.
pub const MAX_NAME_SUFFIX: u32 = 10_000;

/// Resolved directories and naming scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveLayout {
    pub tracked_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub character_extension: String,
    pub archive_extension: String,
    pub character_prefix: String,
    pub archive_prefix: String,
}

/// Backups found on disk for one character file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSet {
    /// Existing rotating slots, ascending by slot number
    pub slots: Vec<PathBuf>,
    pub pre_death: Option<PathBuf>,
}

impl SaveLayout {
    /// Layout using the default naming scheme rooted at `tracked_dir`.
    pub fn new(tracked_dir: impl Into<PathBuf>) -> Self {
        let tracked_dir = tracked_dir.into();
        let defaults = GuardConfig::default();
        Self {
            backup_dir: tracked_dir.join(&defaults.backup_subdirectory),
            tracked_dir,
            character_extension: defaults.character_extension,
            archive_extension: defaults.archive_extension,
            character_prefix: defaults.character_prefix,
            archive_prefix: defaults.archive_prefix,
        }
    }

    /// Resolve a layout from configuration, falling back to the working
    /// directory when no game directory is configured.
    pub fn from_config(config: &GuardConfig) -> Result<Self, GuardError> {
        for (key, ext) in [
            ("character_extension", &config.character_extension),
            ("archive_extension", &config.archive_extension),
        ] {
            if ext.len() < 2 || !ext.starts_with('.') {
                return Err(GuardError::InvalidConfig(format!(
                    "{key} must start with a dot, got {ext:?}"
                )));
            }
        }
        if config.character_extension == config.archive_extension {
            return Err(GuardError::InvalidConfig(
                "character and archive extensions must differ".to_string(),
            ));
        }
        for (key, prefix) in [
            ("character_prefix", &config.character_prefix),
            ("archive_prefix", &config.archive_prefix),
        ] {
            if prefix.is_empty() || prefix.contains('.') {
                return Err(GuardError::InvalidConfig(format!(
                    "{key} must be non-empty and contain no dot, got {prefix:?}"
                )));
            }
        }

        let tracked_dir = match &config.game_directory {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().at(Path::new("."))?,
        };

        Ok(Self {
            backup_dir: tracked_dir.join(&config.backup_subdirectory),
            tracked_dir,
            character_extension: config.character_extension.clone(),
            archive_extension: config.archive_extension.clone(),
            character_prefix: config.character_prefix.clone(),
            archive_prefix: config.archive_prefix.clone(),
        })
    }

    pub fn ensure_backup_dir(&self) -> Result<(), GuardError> {
        fs::create_dir_all(&self.backup_dir).at(&self.backup_dir)
    }

    pub fn main_path(&self, file_name: &str) -> PathBuf {
        self.tracked_dir.join(file_name)
    }

    pub fn backup_path(&self, file_name: &str, slot: u8) -> PathBuf {
        self.backup_dir.join(format!("{file_name}.bak{slot}"))
    }

    pub fn pre_death_path(&self, file_name: &str) -> PathBuf {
        self.backup_path(file_name, PRE_DEATH_SLOT)
    }

    pub fn is_character_file(&self, file_name: &str) -> bool {
        has_extension(file_name, &self.character_extension)
    }

    pub fn is_archive_file(&self, file_name: &str) -> bool {
        has_extension(file_name, &self.archive_extension)
    }

    pub fn is_tracked_file(&self, file_name: &str) -> bool {
        self.is_character_file(file_name) || self.is_archive_file(file_name)
    }

    /// List the backups of `file_name` currently on disk.
    ///
    /// This is the source of truth after every mutation; nothing caches
    /// slot state across operations.
    pub fn scan_backups(&self, file_name: &str) -> Result<BackupSet, GuardError> {
        let mut set = BackupSet::default();

        if !self.backup_dir.is_dir() {
            return Ok(set);
        }

        for slot in 1..=ROTATING_SLOTS {
            let path = self.backup_path(file_name, slot);
            if path.is_file() {
                set.slots.push(path);
            }
        }

        let pre_death = self.pre_death_path(file_name);
        if pre_death.is_file() {
            set.pre_death = Some(pre_death);
        }

        Ok(set)
    }

    /// Find the lowest `<prefix>NNNN` whose file name is free in the game
    /// directory and which no backup in the backup directory starts with.
    ///
    /// Returns the base name without extension.
    pub fn find_viable_name(&self, prefix: &str, extension: &str) -> Result<String, GuardError> {
        let live = file_names(&self.tracked_dir)?;
        let backups = file_names(&self.backup_dir)?;
        // Prefixes never contain a dot, so a backup's base name ends at its first one
        let taken: HashSet<&str> = backups
            .iter()
            .filter_map(|name| name.split_once('.').map(|(base, _)| base))
            .collect();

        for suffix in 0..MAX_NAME_SUFFIX {
            let base = format!("{prefix}{suffix:04}");
            if live.contains(&format!("{base}{extension}")) || taken.contains(base.as_str()) {
                continue;
            }
            return Ok(base);
        }

        Err(GuardError::NameSpaceExhausted {
            prefix: prefix.to_string(),
            extension: extension.to_string(),
        })
    }
}

/// Rewrite a backup path of `old_name` to the matching backup path of `new_name`.
///
/// Returns `None` if the path is not a backup of `old_name`.
pub fn renamed_backup(path: &Path, old_name: &str, new_name: &str) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_str()?;
    let suffix = file_name.strip_prefix(old_name)?;
    if !suffix.starts_with(".bak") {
        return None;
    }
    Some(path.with_file_name(format!("{new_name}{suffix}")))
}

fn has_extension(file_name: &str, extension: &str) -> bool {
    file_name.len() > extension.len() && file_name.ends_with(extension)
}

fn file_names(dir: &Path) -> Result<HashSet<String>, GuardError> {
    if !dir.is_dir() {
        return Ok(HashSet::new());
    }

    let entries = fs::read_dir(dir).at(dir)?;
    Ok(entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect())
}
