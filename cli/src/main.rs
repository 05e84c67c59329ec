mod dir_watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use charguard_core::{BackupPolicy, CharacterRegistry, SaveLayout};
use charguard_types::GuardConfig;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Keeps rotating backups of character save files")]
struct Cli {
    /// Directory holding the character files (overrides the config file)
    #[arg(short, long)]
    game_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let (mut config, config_error) = match confy::load::<GuardConfig>("charguard", None) {
        Ok(config) => (config, None),
        Err(e) => (GuardConfig::default(), Some(e)),
    };
    if let Some(dir) = cli.game_dir {
        config.game_directory = Some(dir);
    }

    let _log_guard = init_logging(config.log_directory.as_deref());
    if let Some(e) = config_error {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
    }

    let layout = SaveLayout::from_config(&config).map_err(|e| e.to_string())?;
    let registry = Arc::new(CharacterRegistry::new(
        layout,
        BackupPolicy::from_config(&config),
    ));

    let event_log = dir_watcher::spawn_event_log(Arc::clone(&registry));
    let watch_loop = dir_watcher::init_watcher(Arc::clone(&registry)).await?;

    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    tracing::info!("Shutting down");

    watch_loop.abort();
    event_log.abort();
    Ok(())
}

/// Initialize logging to a daily rolling file in `log_dir` if given, otherwise stderr.
///
/// The returned guard flushes the file writer on drop and must live until exit.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    if let Some(dir) = log_dir {
        match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("charguard")
            .filename_suffix("log")
            .build(dir)
        {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .init();
                return Some(guard);
            }
            Err(e) => eprintln!("Cannot log to {}: {e}", dir.display()),
        }
    }

    // Fallback to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
    None
}
