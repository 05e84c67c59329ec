use std::sync::Arc;

use charguard_core::{CharacterInfo, CharacterRegistry, RegistryEvent, SaveDirWatcher, TrackedCharacter};
use charguard_types::formatting::{format_age, format_size};
use chrono::Local;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Discover existing characters and start watching the game directory
pub async fn init_watcher(registry: Arc<CharacterRegistry>) -> Result<JoinHandle<()>, String> {
    let report = registry.discover().await.map_err(|e| e.to_string())?;
    for (file_name, error) in &report.skipped {
        tracing::warn!(file = %file_name, error = %error, "Not tracking character");
    }

    for file_name in registry.file_names().await {
        if let Some(character) = registry.get(&file_name).await {
            log_character(&character.info().await);
            follow_character(character);
        }
    }

    let watcher = SaveDirWatcher::new(registry.layout()).map_err(|e| e.to_string())?;
    Ok(charguard_core::spawn_watch_loop(registry, watcher))
}

/// Log list changes, and start following characters as they appear
pub fn spawn_event_log(registry: Arc<CharacterRegistry>) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::Discovered { count }) => {
                    tracing::info!(count, "Characters discovered");
                }
                Ok(RegistryEvent::Added { file_name }) => {
                    if let Some(character) = registry.get(&file_name).await {
                        log_character(&character.info().await);
                        follow_character(character);
                    }
                }
                Ok(RegistryEvent::Renamed { from, to }) => {
                    tracing::info!(%from, %to, "Character renamed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Registry event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn follow_character(character: Arc<TrackedCharacter>) {
    let mut events = character.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!(file = %event.file_name, change = ?event.change, "Character changed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Character event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn log_character(info: &CharacterInfo) {
    let age = (Local::now() - info.last_played).num_seconds().max(0) as u64;
    tracing::info!(
        file = %info.file_name,
        name = %info.display_name,
        size = %format_size(info.size),
        last_played = %format_age(age),
        backups = info.backups.len(),
        pre_death = info.pre_death_backup.is_some(),
        archived = info.archived,
        "Tracking character"
    );
}
