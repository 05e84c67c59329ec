//! Tests for a single tracked character
//!
//! Covers rotation on save, death detection, and the archive / unpack /
//! restore / resurrect transitions against a real temporary directory.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::character::{CharacterChange, FileRename, TrackedCharacter};
use crate::error::GuardError;
use crate::header::NAME_OFFSET;
use crate::layout::{MAX_NAME_SUFFIX, SaveLayout};
use crate::rotation::BackupPolicy;

const FILE: &str = "game0001.chr";

fn setup() -> (TempDir, Arc<SaveLayout>) {
    let dir = TempDir::new().unwrap();
    let layout = SaveLayout::new(dir.path());
    layout.ensure_backup_dir().unwrap();
    (dir, Arc::new(layout))
}

/// A save with a valid header, padded with `fill` up to `size` bytes
pub(crate) fn save_bytes(name: &str, size: usize, fill: u8) -> Vec<u8> {
    let mut bytes = vec![0xEE; NAME_OFFSET as usize];
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes.resize(size.max(bytes.len()), fill);
    bytes
}

/// Overwrite a save the way the game does, always with a newer timestamp
pub(crate) fn save(path: &Path, contents: &[u8]) {
    let previous = fs::metadata(path).and_then(|m| m.modified()).ok();
    fs::write(path, contents).unwrap();
    if let Some(previous) = previous {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(previous + Duration::from_secs(1))
            .unwrap();
    }
}

async fn open_with(
    layout: &Arc<SaveLayout>,
    file_name: &str,
    contents: &[u8],
    policy: BackupPolicy,
) -> TrackedCharacter {
    let path = layout.main_path(file_name);
    fs::write(&path, contents).unwrap();
    TrackedCharacter::open(path, Arc::clone(layout), policy)
        .await
        .unwrap()
}

async fn open(layout: &Arc<SaveLayout>, contents: &[u8]) -> TrackedCharacter {
    open_with(layout, FILE, contents, BackupPolicy::default()).await
}

fn size_of(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

fn backup_dir_names(layout: &SaveLayout) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(&layout.backup_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

// ─────────────────────────────────────────────────────────────────────────────
// Open / baseline
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_open_takes_baseline_backup() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;

    let info = character.info().await;
    assert_eq!(info.display_name, "Conan");
    assert_eq!(info.size, 2000);
    assert!(!info.archived);
    assert_eq!(info.backups.len(), 1);
    assert_eq!(info.backups[0].size, 2000);
    assert_eq!(info.backups[0].file_name, "game0001.chr.bak1");
    assert!(info.pre_death_backup.is_none());
}

#[tokio::test]
async fn test_open_refreshes_stale_backup() {
    let (_dir, layout) = setup();
    fs::write(layout.backup_path(FILE, 1), b"old and short").unwrap();

    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;

    let info = character.info().await;
    assert_eq!(info.backups.len(), 2);
    assert_eq!(info.backups[0].size, 2000);
    assert_eq!(fs::read(layout.backup_path(FILE, 2)).unwrap(), b"old and short");
}

#[tokio::test]
async fn test_open_keeps_current_backup() {
    let (_dir, layout) = setup();
    let path = layout.main_path(FILE);
    fs::write(&path, save_bytes("Conan", 2000, 1)).unwrap();
    fs::copy(&path, layout.backup_path(FILE, 1)).unwrap();
    let modified = fs::metadata(&path).unwrap().modified().unwrap();
    File::options()
        .write(true)
        .open(layout.backup_path(FILE, 1))
        .unwrap()
        .set_modified(modified)
        .unwrap();

    let character = TrackedCharacter::open(path, Arc::clone(&layout), BackupPolicy::default())
        .await
        .unwrap();

    assert_eq!(character.info().await.backups.len(), 1);
}

#[tokio::test]
async fn test_open_archived_without_backups_takes_none() {
    let (_dir, layout) = setup();
    let character = open_with(
        &layout,
        "archive0000.arch",
        &save_bytes("Old", 2000, 1),
        BackupPolicy::default(),
    )
    .await;

    assert!(character.is_archived().await);
    assert!(character.info().await.backups.is_empty());
}

#[tokio::test]
async fn test_malformed_header_has_no_side_effects() {
    let (_dir, layout) = setup();
    let path = layout.main_path(FILE);
    fs::write(&path, [0xEEu8; 40]).unwrap();

    let err = TrackedCharacter::open(path, Arc::clone(&layout), BackupPolicy::default())
        .await
        .unwrap_err();

    assert!(matches!(err, GuardError::Header { .. }));
    assert!(backup_dir_names(&layout).is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Rotation and death
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_echo_does_not_rotate() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;

    // The notification caused by the baseline copy itself
    assert!(!character.handle_modified().await.unwrap());
    assert_eq!(character.info().await.backups.len(), 1);

    save(&layout.main_path(FILE), &save_bytes("Conan", 2000, 2));
    assert!(character.handle_modified().await.unwrap());
    assert!(!character.handle_modified().await.unwrap());
    assert_eq!(character.info().await.backups.len(), 2);
}

#[tokio::test]
async fn test_rewrite_with_same_size_and_time_rotates() {
    let (_dir, layout) = setup();
    let main = layout.main_path(FILE);
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;
    let modified = fs::metadata(&main).unwrap().modified().unwrap();

    // Coarse clocks can hand the next save the very same timestamp
    fs::write(&main, save_bytes("Conan", 2000, 2)).unwrap();
    File::options()
        .write(true)
        .open(&main)
        .unwrap()
        .set_modified(modified)
        .unwrap();

    assert!(character.handle_modified().await.unwrap());
    assert_eq!(
        fs::read(layout.backup_path(FILE, 1)).unwrap(),
        save_bytes("Conan", 2000, 2)
    );
    assert_eq!(character.info().await.backups.len(), 2);
    assert!(!character.handle_modified().await.unwrap());
}

#[tokio::test]
async fn test_small_save_after_large_one_keeps_pre_death() {
    // 500 bytes counts as "alive" only with a threshold below it
    let policy = BackupPolicy {
        death_threshold: 100,
        ..BackupPolicy::default()
    };
    let (_dir, layout) = setup();
    let main = layout.main_path(FILE);
    let character = open_with(&layout, FILE, &save_bytes("Conan", 500, 1), policy).await;

    assert_eq!(size_of(&layout.backup_path(FILE, 1)), 500);
    assert!(!layout.pre_death_path(FILE).exists());

    save(&main, &[0u8; 10]);
    assert!(character.handle_modified().await.unwrap());

    assert_eq!(size_of(&layout.backup_path(FILE, 1)), 10);
    assert_eq!(size_of(&layout.backup_path(FILE, 2)), 500);
    assert_eq!(size_of(&layout.pre_death_path(FILE)), 500);
    assert_eq!(
        fs::read(layout.pre_death_path(FILE)).unwrap(),
        save_bytes("Conan", 500, 1)
    );
}

#[tokio::test]
async fn test_default_threshold_death_transition() {
    let (_dir, layout) = setup();
    let main = layout.main_path(FILE);
    let alive = save_bytes("Conan", 1500, 1);
    let character = open(&layout, &alive).await;
    let mut events = character.subscribe();

    save(&main, &[0u8; 10]);
    character.handle_modified().await.unwrap();

    assert_eq!(fs::read(layout.pre_death_path(FILE)).unwrap(), alive);
    assert_eq!(
        events.try_recv().unwrap().change,
        CharacterChange::BackedUp
    );
    assert_eq!(
        events.try_recv().unwrap().change,
        CharacterChange::DeathDetected
    );

    // Growing back does not touch the pre-death backup
    save(&main, &save_bytes("Conan", 2500, 3));
    character.handle_modified().await.unwrap();
    assert_eq!(fs::read(layout.pre_death_path(FILE)).unwrap(), alive);
    assert_eq!(
        character.info().await.pre_death_backup,
        Some(layout.pre_death_path(FILE))
    );
}

#[tokio::test]
async fn test_slots_cap_at_five() {
    let (_dir, layout) = setup();
    let main = layout.main_path(FILE);
    let character = open(&layout, &save_bytes("Conan", 2000, 0)).await;

    for fill in 1..=6u8 {
        save(&main, &save_bytes("Conan", 2000, fill));
        character.handle_modified().await.unwrap();
    }

    let info = character.info().await;
    assert_eq!(info.backups.len(), 5);
    assert_eq!(fs::read(&info.backups[0].path).unwrap(), save_bytes("Conan", 2000, 6));
    assert_eq!(fs::read(&info.backups[4].path).unwrap(), save_bytes("Conan", 2000, 2));
}

#[tokio::test]
async fn test_modified_after_file_vanished_is_ignored() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;
    fs::remove_file(layout.main_path(FILE)).unwrap();

    assert!(!character.handle_modified().await.unwrap());
    assert_eq!(character.info().await.backups.len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Archive / unpack
// ─────────────────────────────────────────────────────────────────────────────

/// Three saves and a death, so every kind of backup exists
async fn seasoned_character(layout: &Arc<SaveLayout>) -> TrackedCharacter {
    let main = layout.main_path(FILE);
    let character = open(layout, &save_bytes("Conan", 2000, 1)).await;
    save(&main, &save_bytes("Conan", 2100, 2));
    character.handle_modified().await.unwrap();
    save(&main, &[0u8; 10]);
    character.handle_modified().await.unwrap();
    assert!(layout.pre_death_path(FILE).exists());
    character
}

#[tokio::test]
async fn test_delete_archives_character() {
    let (_dir, layout) = setup();
    let character = seasoned_character(&layout).await;
    let newest = fs::read(layout.backup_path(FILE, 1)).unwrap();
    let mut events = character.subscribe();

    fs::remove_file(layout.main_path(FILE)).unwrap();
    let rename = character.handle_deleted().await.unwrap();

    assert_eq!(
        rename,
        Some(FileRename {
            from: FILE.to_string(),
            to: "archive0000.arch".to_string(),
        })
    );
    assert!(!layout.main_path(FILE).exists());
    assert_eq!(fs::read(layout.main_path("archive0000.arch")).unwrap(), newest);
    assert_eq!(
        backup_dir_names(&layout),
        vec![
            "archive0000.arch.bak1",
            "archive0000.arch.bak2",
            "archive0000.arch.bak3",
            "archive0000.arch.bak6",
        ]
    );

    let info = character.info().await;
    assert!(info.archived);
    assert_eq!(info.file_name, "archive0000.arch");
    assert_eq!(info.backups.len(), 3);
    assert_eq!(
        info.pre_death_backup,
        Some(layout.pre_death_path("archive0000.arch"))
    );

    let event = events.try_recv().unwrap();
    assert_eq!(event.file_name, "archive0000.arch");
    assert_eq!(
        event.change,
        CharacterChange::Archived {
            previous: FILE.to_string()
        }
    );
}

#[tokio::test]
async fn test_delete_notification_for_present_file_is_ignored() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;

    assert_eq!(character.handle_deleted().await.unwrap(), None);
    assert!(!character.is_archived().await);
    assert_eq!(character.file_name().await, FILE);
}

#[tokio::test]
async fn test_delete_without_backups_fails() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;
    fs::remove_file(layout.backup_path(FILE, 1)).unwrap();
    fs::remove_file(layout.main_path(FILE)).unwrap();

    let err = character.handle_deleted().await.unwrap_err();
    assert!(matches!(err, GuardError::NoBackupToArchive { .. }));
    assert!(!character.is_archived().await);
}

#[tokio::test]
async fn test_archive_with_no_free_name_leaves_state() {
    let (_dir, layout) = setup();
    let character = seasoned_character(&layout).await;
    for suffix in 0..MAX_NAME_SUFFIX {
        fs::write(layout.main_path(&format!("archive{suffix:04}.arch")), b"").unwrap();
    }
    let before = backup_dir_names(&layout);

    fs::remove_file(layout.main_path(FILE)).unwrap();
    let err = character.handle_deleted().await.unwrap_err();

    assert!(matches!(err, GuardError::NameSpaceExhausted { .. }));
    assert!(!character.is_archived().await);
    assert_eq!(character.file_name().await, FILE);
    assert_eq!(backup_dir_names(&layout), before);
}

#[tokio::test]
async fn test_deleted_archive_is_recreated() {
    let (_dir, layout) = setup();
    let character = seasoned_character(&layout).await;
    fs::remove_file(layout.main_path(FILE)).unwrap();
    character.handle_deleted().await.unwrap();
    let mut events = character.subscribe();

    let archive = layout.main_path("archive0000.arch");
    fs::remove_file(&archive).unwrap();
    assert_eq!(character.handle_deleted().await.unwrap(), None);

    assert_eq!(
        fs::read(&archive).unwrap(),
        fs::read(layout.backup_path("archive0000.arch", 1)).unwrap()
    );
    assert!(character.is_archived().await);
    assert_eq!(events.try_recv().unwrap().change, CharacterChange::Recreated);
}

#[tokio::test]
async fn test_unpack_reverses_archive() {
    let (_dir, layout) = setup();
    let character = seasoned_character(&layout).await;
    let backups_before: Vec<Vec<u8>> = character
        .info()
        .await
        .backups
        .iter()
        .map(|b| fs::read(&b.path).unwrap())
        .collect();

    fs::remove_file(layout.main_path(FILE)).unwrap();
    character.handle_deleted().await.unwrap();
    let rename = character.unpack().await.unwrap();

    // Numbering is reallocated: game0000 is free again
    assert_eq!(rename.from, "archive0000.arch");
    assert_eq!(rename.to, "game0000.chr");
    assert!(!layout.main_path("archive0000.arch").exists());
    assert!(layout.main_path("game0000.chr").exists());

    let info = character.info().await;
    assert!(!info.archived);
    assert_eq!(info.file_name, "game0000.chr");
    let backups_after: Vec<Vec<u8>> = info
        .backups
        .iter()
        .map(|b| fs::read(&b.path).unwrap())
        .collect();
    assert_eq!(backups_after, backups_before);
    assert!(backup_dir_names(&layout).iter().all(|n| n.starts_with("game0000.chr.bak")));
}

#[tokio::test]
async fn test_unpack_active_character_fails() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;

    let err = character.unpack().await.unwrap_err();
    assert!(matches!(err, GuardError::NotArchived { .. }));
}

#[tokio::test]
async fn test_failed_unpack_puts_files_back() {
    let (_dir, layout) = setup();
    let character = seasoned_character(&layout).await;
    fs::remove_file(layout.main_path(FILE)).unwrap();
    character.handle_deleted().await.unwrap();

    // Removed by hand behind the record's back, so its rename fails midway
    fs::remove_file(layout.backup_path("archive0000.arch", 2)).unwrap();
    let err = character.unpack().await.unwrap_err();

    assert!(matches!(err, GuardError::Io { .. }));
    let info = character.info().await;
    assert!(info.archived);
    assert_eq!(info.file_name, "archive0000.arch");
    assert!(layout.main_path("archive0000.arch").exists());
    assert!(!layout.main_path("game0000.chr").exists());
    assert_eq!(
        backup_dir_names(&layout),
        vec![
            "archive0000.arch.bak1",
            "archive0000.arch.bak3",
            "archive0000.arch.bak6",
        ]
    );

    // The slot list was rescanned, so trying again works
    let rename = character.unpack().await.unwrap();
    assert_eq!(rename.to, "game0000.chr");
    assert!(!character.is_archived().await);
    assert_eq!(
        backup_dir_names(&layout),
        vec!["game0000.chr.bak1", "game0000.chr.bak3", "game0000.chr.bak6"]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Restore / resurrect
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restore_moves_backup_into_place() {
    let (_dir, layout) = setup();
    let main = layout.main_path(FILE);
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;
    save(&main, &save_bytes("Conan", 2100, 2));
    character.handle_modified().await.unwrap();
    save(&main, &save_bytes("Conan", 2200, 3));
    character.handle_modified().await.unwrap();
    let mut events = character.subscribe();

    character.restore(1).await.unwrap();

    assert_eq!(fs::read(&main).unwrap(), save_bytes("Conan", 2100, 2));
    let sizes: Vec<u64> = character
        .info()
        .await
        .backups
        .iter()
        .map(|b| b.size)
        .collect();
    assert_eq!(sizes, vec![2100, 2200, 2000]);
    assert_eq!(events.try_recv().unwrap().change, CharacterChange::BackedUp);
    assert_eq!(
        events.try_recv().unwrap().change,
        CharacterChange::Restored { index: 1 }
    );
}

#[tokio::test]
async fn test_restore_out_of_range() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;

    let err = character.restore(3).await.unwrap_err();
    assert!(matches!(
        err,
        GuardError::NoSuchBackup {
            index: 3,
            available: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn test_restore_keeps_display_name() {
    let (_dir, layout) = setup();
    let main = layout.main_path(FILE);
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;
    save(&main, &save_bytes("Renamed", 2100, 2));
    character.handle_modified().await.unwrap();

    character.restore(0).await.unwrap();
    assert_eq!(character.info().await.display_name, "Conan");

    assert_eq!(character.reload_display_name().await.unwrap(), "Renamed");
    assert_eq!(character.info().await.display_name, "Renamed");
}

#[tokio::test]
async fn test_resurrect_uses_pre_death_backup() {
    let (_dir, layout) = setup();
    let character = seasoned_character(&layout).await;
    let pre_death = fs::read(layout.pre_death_path(FILE)).unwrap();

    assert!(character.resurrect().await.unwrap());

    assert_eq!(fs::read(layout.main_path(FILE)).unwrap(), pre_death);
    assert_eq!(fs::read(layout.backup_path(FILE, 1)).unwrap(), pre_death);
    assert!(!layout.pre_death_path(FILE).exists());
    assert!(character.info().await.pre_death_backup.is_none());

    // Consumed
    assert!(!character.resurrect().await.unwrap());
}

#[tokio::test]
async fn test_resurrect_with_vanished_pre_death_is_noop() {
    let (_dir, layout) = setup();
    let character = seasoned_character(&layout).await;
    let main_before = fs::read(layout.main_path(FILE)).unwrap();
    fs::remove_file(layout.pre_death_path(FILE)).unwrap();

    assert!(!character.resurrect().await.unwrap());
    assert_eq!(fs::read(layout.main_path(FILE)).unwrap(), main_before);
    assert!(character.info().await.pre_death_backup.is_none());
}

#[tokio::test]
async fn test_backup_now_always_rotates() {
    let (_dir, layout) = setup();
    let character = open(&layout, &save_bytes("Conan", 2000, 1)).await;

    assert!(character.backup_now().await.unwrap());
    assert_eq!(character.info().await.backups.len(), 2);
}
