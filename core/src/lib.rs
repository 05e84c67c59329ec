pub mod character;
pub mod error;
pub mod header;
pub mod layout;
pub mod registry;
pub mod rotation;
pub mod watcher;

#[cfg(test)]
mod character_tests;

// Re-exports for convenience
pub use character::{BackupInfo, CharacterChange, CharacterEvent, CharacterInfo, TrackedCharacter};
pub use error::{GuardError, HeaderError};
pub use layout::SaveLayout;
pub use registry::{CharacterRegistry, DiscoveryReport, RegistryEvent};
pub use rotation::{BackupPolicy, RetryPolicy};
pub use watcher::{SaveDirWatcher, WatchEvent, spawn_watch_loop};
