//! Registry of tracked characters
//!
//! Owns every [`TrackedCharacter`], keyed by current file name. Entries are
//! never dropped: archiving and unpacking move a character to its new key.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast, watch};

use crate::character::{CharacterInfo, FileRename, TrackedCharacter};
use crate::error::{GuardError, IoContext};
use crate::layout::SaveLayout;
use crate::rotation::BackupPolicy;
use crate::watcher::WatchEvent;

const EVENT_CAPACITY: usize = 64;

/// Membership changes of the character list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RegistryEvent {
    Discovered { count: usize },
    Added { file_name: String },
    Renamed { from: String, to: String },
}

/// Outcome of the startup scan.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub tracked: usize,
    /// Files that could not be tracked, with the reason
    pub skipped: Vec<(String, GuardError)>,
}

pub struct CharacterRegistry {
    layout: Arc<SaveLayout>,
    policy: BackupPolicy,
    characters: RwLock<BTreeMap<String, Arc<TrackedCharacter>>>,
    /// Number of live [`DiscoveryPause`] guards
    paused: watch::Sender<usize>,
    events: broadcast::Sender<RegistryEvent>,
}

/// Keeps new-file discovery paused while alive.
#[must_use = "discovery resumes as soon as the guard is dropped"]
pub struct DiscoveryPause<'a> {
    registry: &'a CharacterRegistry,
}

impl Drop for DiscoveryPause<'_> {
    fn drop(&mut self) {
        self.registry.paused.send_modify(|n| *n -= 1);
    }
}

impl CharacterRegistry {
    pub fn new(layout: SaveLayout, policy: BackupPolicy) -> Self {
        Self {
            layout: Arc::new(layout),
            policy,
            characters: RwLock::new(BTreeMap::new()),
            paused: watch::channel(0).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub fn layout(&self) -> &SaveLayout {
        &self.layout
    }

    /// Track every active and archived file in the game directory.
    ///
    /// A file that cannot be tracked is logged and reported; the rest are
    /// still picked up.
    pub async fn discover(&self) -> Result<DiscoveryReport, GuardError> {
        self.layout.ensure_backup_dir()?;

        let dir = &self.layout.tracked_dir;
        let mut active = Vec::new();
        let mut archived = Vec::new();
        for entry in fs::read_dir(dir).at(dir)?.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if self.layout.is_character_file(&name) {
                active.push(name);
            } else if self.layout.is_archive_file(&name) {
                archived.push(name);
            }
        }
        active.sort();
        archived.sort();

        let mut report = DiscoveryReport::default();
        for name in active.into_iter().chain(archived) {
            if self.get(&name).await.is_some() {
                continue;
            }
            // Opening may wait on a locked file; keep the map available meanwhile
            match self.open(&name).await {
                Ok(character) => {
                    if self.insert(&name, character).await {
                        report.tracked += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Skipping character file");
                    report.skipped.push((name, e));
                }
            }
        }

        let count = self.len().await;

        tracing::info!(
            tracked = report.tracked,
            skipped = report.skipped.len(),
            dir = %dir.display(),
            "Discovery finished"
        );
        if report.tracked > 0 {
            self.publish(RegistryEvent::Discovered { count });
        }
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot of all characters, ordered by file name.
    pub async fn characters(&self) -> Vec<CharacterInfo> {
        // Don't hold the map while waiting on each character
        let characters: Vec<_> = self.characters.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(characters.len());
        for character in characters {
            infos.push(character.info().await);
        }
        infos
    }

    pub async fn get(&self, file_name: &str) -> Option<Arc<TrackedCharacter>> {
        self.characters.read().await.get(file_name).cloned()
    }

    pub async fn file_names(&self) -> Vec<String> {
        self.characters.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.characters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.characters.read().await.is_empty()
    }

    /// Receive list change notifications. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operator commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Bring an archived character back. Returns its new file name.
    pub async fn unpack(&self, file_name: &str) -> Result<String, GuardError> {
        let character = self.require(file_name).await?;
        let _pause = self.pause_discovery();

        let rename = character.unpack().await?;
        let new_name = rename.to.clone();
        self.rekey(rename).await;
        Ok(new_name)
    }

    /// Restore from backup `index`, 0 being the newest.
    pub async fn restore(&self, file_name: &str, index: usize) -> Result<(), GuardError> {
        self.require(file_name).await?.restore(index).await
    }

    /// Restore from the pre-death backup. `false` if there was none.
    pub async fn resurrect(&self, file_name: &str) -> Result<bool, GuardError> {
        self.require(file_name).await?.resurrect().await
    }

    pub async fn backup_now(&self, file_name: &str) -> Result<bool, GuardError> {
        self.require(file_name).await?.backup_now().await
    }

    pub async fn reload_display_name(&self, file_name: &str) -> Result<String, GuardError> {
        self.require(file_name).await?.reload_display_name().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Route a filesystem notification. Failures are logged, never propagated,
    /// so one broken character cannot stop the others from being handled.
    pub async fn handle_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Created(name) => self.on_created(&name).await,
            WatchEvent::Changed(name) => self.on_changed(&name).await,
            WatchEvent::Deleted(name) => self.on_deleted(&name).await,
        }
    }

    /// Hold back tracking of new files until the guard is dropped.
    ///
    /// New files noticed meanwhile are checked again once every guard is gone,
    /// by which time a renamed record already sits under its new key.
    pub fn pause_discovery(&self) -> DiscoveryPause<'_> {
        self.paused.send_modify(|n| *n += 1);
        DiscoveryPause { registry: self }
    }

    pub fn is_discovery_paused(&self) -> bool {
        *self.paused.borrow() > 0
    }

    async fn wait_for_resume(&self) {
        let mut paused = self.paused.subscribe();
        // The sender lives as long as `self`
        let _ = paused.wait_for(|n| *n == 0).await;
    }

    async fn on_created(&self, name: &str) {
        if self.is_discovery_paused() {
            tracing::debug!(file = %name, "Discovery paused, holding new file");
            self.wait_for_resume().await;
        }

        if let Some(character) = self.get(name).await {
            if let Err(e) = character.handle_modified().await {
                tracing::warn!(file = %name, error = %e, "Backup failed");
            }
            return;
        }
        if !self.layout.is_character_file(name) {
            return;
        }
        if !self.layout.main_path(name).is_file() {
            tracing::debug!(file = %name, "New file vanished before tracking");
            return;
        }

        // Opening may wait on a locked file; keep the map available meanwhile
        let character = match self.open(name).await {
            Ok(character) => character,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Failed to track new character");
                return;
            }
        };
        if !self.insert(name, character).await {
            tracing::debug!(file = %name, "New file already tracked");
            return;
        }

        tracing::info!(file = %name, "Tracking new character");
        self.publish(RegistryEvent::Added {
            file_name: name.to_string(),
        });
    }

    async fn on_changed(&self, name: &str) {
        let Some(character) = self.get(name).await else {
            tracing::trace!(file = %name, "Change for untracked file");
            return;
        };
        if let Err(e) = character.handle_modified().await {
            tracing::warn!(file = %name, error = %e, "Backup failed");
        }
    }

    async fn on_deleted(&self, name: &str) {
        let Some(character) = self.get(name).await else {
            tracing::trace!(file = %name, "Delete for untracked file");
            return;
        };

        let _pause = self.pause_discovery();
        match character.handle_deleted().await {
            Ok(Some(rename)) => self.rekey(rename).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(file = %name, error = %e, "Failed to archive deleted character");
            }
        }
    }

    async fn open(&self, name: &str) -> Result<TrackedCharacter, GuardError> {
        TrackedCharacter::open(self.layout.main_path(name), Arc::clone(&self.layout), self.policy)
            .await
    }

    /// Add a record unless its name got taken meanwhile. `true` if added.
    async fn insert(&self, name: &str, character: TrackedCharacter) -> bool {
        let mut characters = self.characters.write().await;
        if characters.contains_key(name) {
            return false;
        }
        characters.insert(name.to_string(), Arc::new(character));
        true
    }

    async fn require(&self, file_name: &str) -> Result<Arc<TrackedCharacter>, GuardError> {
        self.get(file_name)
            .await
            .ok_or_else(|| GuardError::UnknownCharacter {
                file_name: file_name.to_string(),
            })
    }

    async fn rekey(&self, rename: FileRename) {
        {
            let mut characters = self.characters.write().await;
            if let Some(character) = characters.remove(&rename.from) {
                characters.insert(rename.to.clone(), character);
            }
        }
        self.publish(RegistryEvent::Renamed {
            from: rename.from,
            to: rename.to,
        });
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}
