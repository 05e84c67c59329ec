//! Filesystem notifications for the game directory
//!
//! ```text
//! notify callback ──► translate ──► mpsc ──► EventQueue ──► dispatch ──┬─► worker "a.chr" ──► registry
//!  (its own thread)                           (collapses               └─► worker "b.chr" ──► registry
//!                                              repeats)
//! ```
//!
//! Each file name gets its own worker, so events for one file are handled in
//! arrival order while a file stuck behind a locked copy holds up nobody else.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GuardError, IoContext};
use crate::layout::SaveLayout;
use crate::registry::CharacterRegistry;

/// A change to a file in the game directory, by file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    Changed(String),
    Deleted(String),
}

impl WatchEvent {
    pub fn file_name(&self) -> &str {
        match self {
            WatchEvent::Created(name) | WatchEvent::Changed(name) | WatchEvent::Deleted(name) => {
                name
            }
        }
    }
}

/// Watches the game directory (non-recursively) for character and archive files.
pub struct SaveDirWatcher {
    _watcher: RecommendedWatcher,
    queue: EventQueue,
}

impl SaveDirWatcher {
    pub fn new(layout: &SaveLayout) -> Result<Self, GuardError> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Some backends report canonical paths; watch and filter on the same form
        let dir = layout.tracked_dir.canonicalize().at(&layout.tracked_dir)?;
        let mut filter = layout.clone();
        filter.tracked_dir = dir.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for translated in translate(&event, &filter) {
                    // Receiver gone means we're shutting down
                    let _ = tx.send(translated);
                }
            }
            Err(e) => tracing::error!(error = %e, "File watcher error"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(dir = %dir.display(), "Watching game directory");
        Ok(Self {
            _watcher: watcher,
            queue: EventQueue::new(rx),
        })
    }

    /// Next event, or `None` once the watcher has stopped.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.queue.next().await
    }
}

/// Receiving end that folds back-to-back identical events into one.
struct EventQueue {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    pending: Option<WatchEvent>,
}

impl EventQueue {
    fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx, pending: None }
    }

    async fn next(&mut self) -> Option<WatchEvent> {
        let event = match self.pending.take() {
            Some(event) => event,
            None => self.rx.recv().await?,
        };

        // Only what's already queued; never wait for more
        while let Ok(next) = self.rx.try_recv() {
            if next != event {
                self.pending = Some(next);
                break;
            }
        }
        Some(event)
    }
}

/// Map a raw notification onto zero or more [`WatchEvent`]s for tracked files.
pub fn translate(event: &Event, layout: &SaveLayout) -> Vec<WatchEvent> {
    let each = |to_event: fn(String) -> WatchEvent| -> Vec<WatchEvent> {
        event
            .paths
            .iter()
            .filter_map(|p| tracked_name(p, layout))
            .map(to_event)
            .collect()
    };

    match &event.kind {
        EventKind::Create(_) => each(WatchEvent::Created),
        EventKind::Remove(_) => each(WatchEvent::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(WatchEvent::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(WatchEvent::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first().and_then(|p| tracked_name(p, layout)) {
                out.push(WatchEvent::Deleted(from));
            }
            if let Some(to) = event.paths.get(1).and_then(|p| tracked_name(p, layout)) {
                out.push(WatchEvent::Created(to));
            }
            out
        }
        // Backend couldn't tell which side of the rename this is
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .filter_map(|p| {
                let name = tracked_name(p, layout)?;
                Some(if p.exists() {
                    WatchEvent::Created(name)
                } else {
                    WatchEvent::Deleted(name)
                })
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(WatchEvent::Changed),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn tracked_name(path: &Path, layout: &SaveLayout) -> Option<String> {
    if path.parent() != Some(layout.tracked_dir.as_path()) {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    layout.is_tracked_file(name).then(|| name.to_string())
}

/// A worker with nothing to do for this long shuts down.
const WORKER_IDLE: Duration = Duration::from_secs(60);

/// Feed watcher events into the registry until the watcher stops.
pub fn spawn_watch_loop(registry: Arc<CharacterRegistry>, watcher: SaveDirWatcher) -> JoinHandle<()> {
    let SaveDirWatcher { _watcher: notifier, queue } = watcher;
    tokio::spawn(async move {
        // Dropping the notifier would stop events
        let _notifier = notifier;
        dispatch(queue, move |event| {
            let registry = Arc::clone(&registry);
            async move { registry.handle_watch_event(event).await }
        })
        .await;
        tracing::warn!("File watcher stopped");
    })
}

/// Hand each event to the worker for its file name, starting one if needed.
async fn dispatch<H, F>(mut queue: EventQueue, handler: H)
where
    H: Fn(WatchEvent) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    let mut workers: HashMap<String, mpsc::UnboundedSender<WatchEvent>> = HashMap::new();

    while let Some(event) = queue.next().await {
        tracing::trace!(?event, "Watch event");
        let event = match workers.get(event.file_name()) {
            Some(worker) => match worker.send(event) {
                Ok(()) => continue,
                // Worker went idle and stopped; start a fresh one
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        workers.retain(|_, worker| !worker.is_closed());
        let name = event.file_name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive until the worker below drops it
        let _ = tx.send(event);
        workers.insert(name.clone(), tx);
        tokio::spawn(run_worker(name, rx, Arc::clone(&handler)));
    }
}

async fn run_worker<H, F>(name: String, mut rx: mpsc::UnboundedReceiver<WatchEvent>, handler: Arc<H>)
where
    H: Fn(WatchEvent) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    loop {
        match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
            Ok(Some(event)) => (*handler)(event).await,
            Ok(None) => return,
            Err(_) => {
                // Refuse new events, then finish what slipped in before that
                rx.close();
                while let Ok(event) = rx.try_recv() {
                    (*handler)(event).await;
                }
                tracing::trace!(file = %name, "Event worker idle, stopping");
                return;
            }
        }
    }
}
