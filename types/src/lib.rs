//! Shared types for charguard.
//!
//! Kept free of engine dependencies so a presentation layer can depend on
//! this crate alone to read and write configuration.

pub mod config;
pub mod formatting;

pub use config::{CopyRetryConfig, GuardConfig};
