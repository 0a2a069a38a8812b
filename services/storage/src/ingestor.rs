use crate::watcher::{FsEventKind, FsNotification};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Message on a handler's ingest queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestMessage {
    Event(FsNotification),
    /// Runs a throttled policy evaluation in queue order
    Evaluate,
    /// Ends the ingest loop after every earlier message was processed
    Stop,
}

/// Receiver of the notifications of one tier directory
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngestSink: Send + Sync {
    async fn on_created(&self, path: &Path) -> anyhow::Result<()>;

    async fn on_modified(&self, path: &Path) -> anyhow::Result<()>;

    async fn on_deleted(&self, path: &Path) -> anyhow::Result<()>;

    async fn on_evaluate(&self) -> anyhow::Result<()>;
}

/// Spawn the single consumer of a handler's queue
pub fn spawn_ingestor(
    name: String,
    sink: Arc<dyn IngestSink>,
    queue: UnboundedReceiver<IngestMessage>,
) -> JoinHandle<()> {
    tokio::spawn(run_ingestor(name, sink, queue))
}

/// Process messages in order until `Stop` arrives or every sender is gone.
/// A failing event is logged and does not end the loop.
pub async fn run_ingestor(
    name: String,
    sink: Arc<dyn IngestSink>,
    mut queue: UnboundedReceiver<IngestMessage>,
) {
    debug!(handler = %name, "Ingestor started");

    while let Some(message) = queue.recv().await {
        let notification = match message {
            IngestMessage::Event(notification) => notification,
            IngestMessage::Evaluate => {
                if let Err(e) = sink.on_evaluate().await {
                    error!(handler = %name, error = %e, "Requested evaluation failed");
                }
                continue;
            }
            IngestMessage::Stop => break,
        };

        let path = notification.path.as_path();
        let result = match notification.kind {
            FsEventKind::Created => sink.on_created(path).await,
            FsEventKind::Modified => sink.on_modified(path).await,
            FsEventKind::Deleted => sink.on_deleted(path).await,
        };

        match result {
            Ok(()) => {
                metrics::counter!("storage.events.processed").increment(1);
            }
            Err(e) => {
                error!(
                    handler = %name,
                    kind = ?notification.kind,
                    path = %path.display(),
                    error = %e,
                    "Failed to process filesystem event"
                );
                metrics::counter!("storage.events.failed").increment(1);
            }
        }
    }

    info!(handler = %name, "Ingestor stopped");
}
