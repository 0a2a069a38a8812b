use crate::ingestor::IngestMessage;
use crate::served::IgnoredFiles;
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{
    Config as NotifyConfig, Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Interval of polling watchers
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Watcher backend error: {0}")]
    Notify(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of a change to a regular file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
}

/// A change observed below a tier root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsNotification {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

impl FsNotification {
    fn new(kind: FsEventKind, path: &Path) -> Self {
        Self {
            kind,
            path: path.to_path_buf(),
        }
    }
}

enum WatcherBackend {
    Native(RecommendedWatcher),
    Polling(PollWatcher),
}

/// Recursive watcher over one tier directory feeding a handler's queue
pub struct TierWatcher {
    root: PathBuf,
    backend: WatcherBackend,
}

impl TierWatcher {
    /// Start watching `root`. The directory must exist.
    pub fn start(
        root: &Path,
        poll: bool,
        ignored: IgnoredFiles,
        queue: UnboundedSender<IngestMessage>,
    ) -> Result<Self, WatcherError> {
        let root_display = root.display().to_string();
        let handler = move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                for notification in translate(&event, &ignored) {
                    trace!(
                        kind = ?notification.kind,
                        path = %notification.path.display(),
                        "Filesystem event"
                    );
                    if queue.send(IngestMessage::Event(notification)).is_err() {
                        debug!(root = %root_display, "Ingest queue closed, dropping event");
                        return;
                    }
                }
            }
            Err(e) => warn!(root = %root_display, error = %e, "Watcher error"),
        };

        let backend = if poll {
            let config = NotifyConfig::default().with_poll_interval(POLL_INTERVAL);
            let mut watcher = PollWatcher::new(handler, config)?;
            watcher.watch(root, RecursiveMode::Recursive)?;
            WatcherBackend::Polling(watcher)
        } else {
            let mut watcher = RecommendedWatcher::new(handler, NotifyConfig::default())?;
            watcher.watch(root, RecursiveMode::Recursive)?;
            WatcherBackend::Native(watcher)
        };

        info!(root = %root.display(), poll, "Watching tier directory");
        Ok(Self {
            root: root.to_path_buf(),
            backend,
        })
    }

    pub fn is_polling(&self) -> bool {
        matches!(self.backend, WatcherBackend::Polling(_))
    }

    /// Stop delivering events
    pub fn stop(mut self) {
        let result = match &mut self.backend {
            WatcherBackend::Native(watcher) => watcher.unwatch(&self.root),
            WatcherBackend::Polling(watcher) => watcher.unwatch(&self.root),
        };
        if let Err(e) = result {
            debug!(root = %self.root.display(), error = %e, "Unwatch failed");
        }
        info!(root = %self.root.display(), "Stopped watching tier directory");
    }
}

fn is_ignored(path: &Path, ignored: &IgnoredFiles) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| ignored.contains(name))
}

/// Map a backend event onto file notifications. Directory events and
/// ignored filenames produce nothing; renames become a delete and a create.
///
/// A rename the backend could pair arrives as `From` and `To` followed by a
/// `Both` carrying the same tracker. The halves are authoritative and the
/// tracked `Both` is dropped, so every rename yields one delete and one
/// create.
pub fn translate(event: &Event, ignored: &IgnoredFiles) -> Vec<FsNotification> {
    use FsEventKind::{Created, Deleted, Modified};

    let mut notifications = Vec::new();
    let first = event.paths.first();

    match event.kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {}
        EventKind::Create(_) => {
            for path in &event.paths {
                if !path.is_dir() {
                    notifications.push(FsNotification::new(Created, path));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.tracker().is_some() => {}
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let Some(from) = first {
                notifications.push(FsNotification::new(Deleted, from));
            }
            if let Some(to) = event.paths.get(1).filter(|to| !to.is_dir()) {
                notifications.push(FsNotification::new(Created, to));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            if let Some(from) = first {
                notifications.push(FsNotification::new(Deleted, from));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            if let Some(to) = first.filter(|to| !to.is_dir()) {
                notifications.push(FsNotification::new(Created, to));
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Direction unknown, decide by what is on disk now
            for path in &event.paths {
                if path.is_file() {
                    notifications.push(FsNotification::new(Created, path));
                } else if !path.exists() {
                    notifications.push(FsNotification::new(Deleted, path));
                }
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                if !path.is_dir() {
                    notifications.push(FsNotification::new(Modified, path));
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                notifications.push(FsNotification::new(Deleted, path));
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }

    notifications.retain(|notification| !is_ignored(&notification.path, ignored));
    notifications
}
