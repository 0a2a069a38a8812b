use crate::catalog::{Catalog, Category, FileFilter, InsertOutcome, NewFile};
use crate::coordinator::TierDirectory;
use crate::ingestor::{spawn_ingestor, IngestMessage, IngestSink};
use crate::mover::{FileMover, MoveOutcome};
use crate::policy::{
    combine_segment_selection, select_files_to_move, select_recordings_to_move, RetentionPolicy,
};
use crate::routes::{FileRoute, RouteRegistrar};
use crate::schedule::{Debouncer, Throttle};
use crate::served::{IgnoredFiles, ServedFiles};
use crate::watcher::TierWatcher;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const SEGMENTS: &str = "segments";
pub const THUMBNAILS: &str = "thumbnails";
pub const RECORDINGS: &str = "recordings";

/// Rewritten continuously by the recorder, never catalogued
pub const LATEST_THUMBNAIL: &str = "latest_thumbnail.jpg";

/// Variant-specific behaviour of a tier handler
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    /// Plain age/size policy, used for snapshots
    Generic { policy: RetentionPolicy },
    /// Recorder segments with continuous and events retention and lockstep
    /// migration of thumbnails and event clips
    Segments {
        continuous: RetentionPolicy,
        events: RetentionPolicy,
    },
    /// Recording thumbnails, moved only in lockstep with segments
    Thumbnails,
    /// Event clips, moved only in lockstep with segments
    Recordings,
}

/// Lifecycle of a tier handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Starting,
    Watching,
    ProcessingEvent,
    EvaluatingPolicy,
    ShuttingDown,
    Stopped,
}

/// Where a handler sits in its chain
#[derive(Debug, Clone, PartialEq)]
pub struct TierSettings {
    pub camera_identifier: String,
    pub category: Category,
    /// `segments`, `thumbnails`, `recordings` or a snapshot domain
    pub subcategory: String,
    /// Position in the chain, 0 is the first tier
    pub tier_id: usize,
    /// Root directory of the tier
    pub tier_path: String,
    /// Root directory of the following tier, None on the last tier
    pub next_tier_path: Option<String>,
    pub poll: bool,
    pub move_on_shutdown: bool,
    /// Camera failed to initialize
    pub failed: bool,
}

/// Shared services every handler uses
#[derive(Clone)]
pub struct HandlerDeps {
    pub catalog: Arc<dyn Catalog>,
    pub served: ServedFiles,
    pub registrar: Arc<dyn RouteRegistrar>,
    pub ignored: IgnoredFiles,
    pub directory: Weak<TierDirectory>,
}

/// Counters of one handler
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub evaluations: AtomicU64,
    pub files_moved: AtomicU64,
    pub files_deleted: AtomicU64,
    pub files_skipped: AtomicU64,
}

impl HandlerStats {
    fn record(&self, outcome: &MoveOutcome) {
        let counter = match outcome {
            MoveOutcome::Moved { .. } => &self.files_moved,
            MoveOutcome::Deleted | MoveOutcome::Missing => &self.files_deleted,
            MoveOutcome::Skipped | MoveOutcome::Collision | MoveOutcome::Failed => {
                &self.files_skipped
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of one policy evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationReport {
    /// Path and outcome of every file handled
    pub outcomes: Vec<(String, MoveOutcome)>,
    /// Recordings whose thumbnail and clip followed the segments
    pub recording_ids: Vec<i64>,
}

struct HandlerRuntime {
    queue: mpsc::UnboundedSender<IngestMessage>,
    watcher: TierWatcher,
    ingestor: JoinHandle<()>,
}

/// Keeps one tier directory of one camera catalogued and evicts from it
pub struct TierHandler {
    settings: TierSettings,
    kind: HandlerKind,
    path: PathBuf,
    catalog: Arc<dyn Catalog>,
    mover: FileMover,
    registrar: Arc<dyn RouteRegistrar>,
    ignored: IgnoredFiles,
    directory: Weak<TierDirectory>,
    throttle: Throttle,
    debouncer: Debouncer,
    state: Mutex<HandlerState>,
    stats: HandlerStats,
    runtime: Mutex<Option<HandlerRuntime>>,
    weak_self: Weak<TierHandler>,
}

/// Directory a handler watches below its tier root
pub fn handler_path(settings: &TierSettings) -> PathBuf {
    let root = Path::new(&settings.tier_path);
    match settings.category {
        Category::Recorder => root
            .join(&settings.subcategory)
            .join(&settings.camera_identifier),
        Category::Snapshots => root
            .join(Category::Snapshots.as_str())
            .join(&settings.subcategory)
            .join(&settings.camera_identifier),
    }
}

/// `<parent dir>/<filename>` of a clip, stable across tiers
fn clip_suffix(path: &Path) -> Option<String> {
    let filename = path.file_name()?.to_str()?;
    let parent = path.parent()?.file_name()?.to_str()?;
    Some(format!("{parent}/{filename}"))
}

impl TierHandler {
    pub fn new(settings: TierSettings, kind: HandlerKind, deps: HandlerDeps) -> Arc<Self> {
        let path = handler_path(&settings);
        Arc::new_cyclic(|weak_self| Self {
            path,
            mover: FileMover::new(Arc::clone(&deps.catalog), deps.served.clone()),
            catalog: deps.catalog,
            registrar: deps.registrar,
            ignored: deps.ignored,
            directory: deps.directory,
            throttle: Throttle::default(),
            debouncer: Debouncer::default(),
            state: Mutex::new(HandlerState::Starting),
            stats: HandlerStats::default(),
            runtime: Mutex::new(None),
            weak_self: weak_self.clone(),
            settings,
            kind,
        })
    }

    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    /// Directory this handler watches
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    pub fn is_first_tier(&self) -> bool {
        self.settings.tier_id == 0
    }

    fn name(&self) -> String {
        format!(
            "{}/{}/tier{}",
            self.settings.camera_identifier, self.settings.subcategory, self.settings.tier_id
        )
    }

    fn set_state(&self, state: HandlerState) {
        *self.state.lock() = state;
    }

    fn filter(&self) -> FileFilter {
        FileFilter {
            camera_identifier: self.settings.camera_identifier.clone(),
            category: self.settings.category.as_str().to_string(),
            subcategory: self.settings.subcategory.clone(),
            tier_id: self.settings.tier_id as i64,
        }
    }

    fn skips(&self, path: &Path) -> bool {
        matches!(self.kind, HandlerKind::Thumbnails)
            && path.file_name().and_then(|name| name.to_str()) == Some(LATEST_THUMBNAIL)
    }

    fn routes(&self) -> Vec<FileRoute> {
        let path = self.path.to_string_lossy();
        let extensions: Vec<&str> = match self.kind {
            HandlerKind::Segments { .. } => vec!["m4s", "mp4"],
            HandlerKind::Generic { .. } | HandlerKind::Thumbnails => vec!["jpg"],
            HandlerKind::Recordings => vec![self.settings.camera_identifier.as_str()],
        };
        extensions
            .into_iter()
            .map(|extension| {
                FileRoute::for_extension(
                    &path,
                    extension,
                    &self.settings.camera_identifier,
                    self.settings.category.as_str(),
                    &self.settings.subcategory,
                    self.settings.failed,
                )
            })
            .collect()
    }

    /// Create the tier directory, register its routes and start watching
    #[instrument(skip(self), fields(handler = %self.name()))]
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.set_state(HandlerState::Starting);

        tokio::fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("Failed to create tier directory {}", self.path.display()))?;

        for route in self.routes() {
            self.registrar
                .register(route)
                .context("Failed to register file route")?;
        }

        let (queue, receiver) = mpsc::unbounded_channel();
        let sink: Arc<dyn IngestSink> = Arc::clone(self) as Arc<dyn IngestSink>;
        let ingestor = spawn_ingestor(self.name(), sink, receiver);

        let watcher = match TierWatcher::start(
            &self.path,
            self.settings.poll,
            self.ignored.clone(),
            queue.clone(),
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                let _ = queue.send(IngestMessage::Stop);
                return Err(e).with_context(|| format!("Failed to watch {}", self.path.display()));
            }
        };

        *self.runtime.lock() = Some(HandlerRuntime {
            queue,
            watcher,
            ingestor,
        });
        self.set_state(HandlerState::Watching);

        info!(path = %self.path.display(), "Tier handler started");
        Ok(())
    }

    /// Queue a throttled evaluation behind the pending filesystem events.
    /// Returns false when the handler is not running.
    pub fn request_evaluation(&self) -> bool {
        match self.runtime.lock().as_ref() {
            Some(runtime) => runtime.queue.send(IngestMessage::Evaluate).is_ok(),
            None => false,
        }
    }

    /// Throttled policy evaluation. Thumbnail and clip handlers only move in
    /// lockstep with segments.
    pub async fn check_tier(&self) {
        if matches!(self.kind, HandlerKind::Thumbnails | HandlerKind::Recordings) {
            return;
        }
        if !self.throttle.try_acquire() {
            return;
        }
        if let Err(e) = self.run_policy().await {
            error!(handler = %self.name(), error = %e, "Tier evaluation failed");
        }
    }

    /// Evaluate the policy now and move or delete what it selects
    #[instrument(skip(self), fields(handler = %self.name()))]
    pub async fn run_policy(&self) -> anyhow::Result<EvaluationReport> {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, HandlerState::EvaluatingPolicy)
        };
        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("storage.tier.evaluations").increment(1);

        let result = match &self.kind {
            HandlerKind::Generic { policy } => self.evaluate_files(policy).await,
            HandlerKind::Segments { continuous, events } => {
                self.evaluate_segments(continuous, events).await
            }
            HandlerKind::Thumbnails | HandlerKind::Recordings => Ok(EvaluationReport::default()),
        };

        {
            let mut state = self.state.lock();
            if *state == HandlerState::EvaluatingPolicy {
                *state = previous;
            }
        }
        result
    }

    async fn evaluate_files(&self, policy: &RetentionPolicy) -> anyhow::Result<EvaluationReport> {
        if !policy.is_configured() {
            return Ok(EvaluationReport::default());
        }

        let files = select_files_to_move(self.catalog.as_ref(), &self.filter(), policy, Utc::now())
            .await
            .context("Failed to select files to move")?;

        let mut report = EvaluationReport::default();
        for file in files {
            let outcome = self.handle_file(&file.path, &file.tier_path).await;
            report.outcomes.push((file.path, outcome));
        }
        Ok(report)
    }

    async fn evaluate_segments(
        &self,
        continuous: &RetentionPolicy,
        events: &RetentionPolicy,
    ) -> anyhow::Result<EvaluationReport> {
        let now = Utc::now();
        let filter = self.filter();

        let continuous_files = if continuous.is_configured() {
            Some(
                select_files_to_move(self.catalog.as_ref(), &filter, continuous, now)
                    .await
                    .context("Failed to select continuous segments")?,
            )
        } else {
            None
        };
        let event_rows = if events.is_configured() {
            Some(
                select_recordings_to_move(self.catalog.as_ref(), &filter, events, now)
                    .await
                    .context("Failed to select event segments")?,
            )
        } else {
            None
        };

        let selection = combine_segment_selection(continuous_files, event_rows);

        let mut report = EvaluationReport::default();
        let mut stayed: HashSet<String> = HashSet::new();
        for (path, file_tier_path) in selection.files {
            let outcome = self.handle_file(&path, &file_tier_path).await;
            if !outcome.is_evicted() {
                stayed.insert(path.clone());
            }
            report.outcomes.push((path, outcome));
        }

        // A recording follows only once none of its segments stayed behind
        let blocked: HashSet<i64> = selection
            .events
            .iter()
            .filter(|row| stayed.contains(&row.path))
            .filter_map(|row| row.recording_id)
            .collect();
        let mut recording_ids = Vec::new();
        for id in selection.events.iter().filter_map(|row| row.recording_id) {
            if !blocked.contains(&id) && !recording_ids.contains(&id) {
                recording_ids.push(id);
            }
        }

        if !recording_ids.is_empty() {
            self.move_siblings(&recording_ids).await;

            if self.settings.next_tier_path.is_none() {
                debug!(?recording_ids, "Deleting recordings evicted from the last tier");
                self.catalog
                    .delete_recordings(&recording_ids)
                    .await
                    .context("Failed to delete recordings")?;
            }
        }

        report.recording_ids = recording_ids;
        Ok(report)
    }

    /// Move thumbnails and clips of `recording_ids` with the handlers at the
    /// same tier index
    async fn move_siblings(&self, recording_ids: &[i64]) {
        let Some(directory) = self.directory.upgrade() else {
            return;
        };
        let camera = &self.settings.camera_identifier;
        let tier_id = self.settings.tier_id;

        match directory.lookup(camera, THUMBNAILS, tier_id) {
            Some(thumbnails) => {
                debug!(?recording_ids, "Moving thumbnails of recordings");
                for id in recording_ids {
                    thumbnails.move_thumbnail(*id).await;
                }
            }
            None => debug!(tier_id, "No thumbnail handler at this tier"),
        }

        match directory.lookup(camera, RECORDINGS, tier_id) {
            Some(recordings) => {
                debug!(?recording_ids, "Moving event clips of recordings");
                for id in recording_ids {
                    recordings.move_event_clip(*id).await;
                }
            }
            None => debug!(tier_id, "No event clip handler at this tier"),
        }
    }

    async fn handle_file(&self, path: &str, file_tier_path: &str) -> MoveOutcome {
        let outcome = self
            .mover
            .handle_file(
                path,
                file_tier_path,
                &self.settings.tier_path,
                self.settings.next_tier_path.as_deref(),
            )
            .await;
        self.stats.record(&outcome);
        outcome
    }

    /// Move or delete every catalogued file of this tier
    #[instrument(skip(self), fields(handler = %self.name()))]
    pub async fn drain(&self) -> anyhow::Result<EvaluationReport> {
        let files = self
            .catalog
            .select_files(&self.filter())
            .await
            .context("Failed to list files to drain")?;

        info!(count = files.len(), "Draining tier");
        let mut report = EvaluationReport::default();
        for file in files {
            let outcome = self.handle_file(&file.path, &file.tier_path).await;
            report.outcomes.push((file.path, outcome));
        }
        Ok(report)
    }

    /// Move the thumbnail of a recording to the next tier
    pub async fn move_thumbnail(&self, recording_id: i64) {
        let recording = match self.catalog.get_recording(recording_id).await {
            Ok(Some(recording)) => recording,
            Ok(None) => {
                debug!(recording_id, "Recording not found, no thumbnail to move");
                return;
            }
            Err(e) => {
                error!(recording_id, error = %e, "Failed to look up recording");
                return;
            }
        };
        let Some(thumbnail_path) = recording.thumbnail_path else {
            return;
        };

        let outcome = self
            .handle_file(&thumbnail_path, &self.settings.tier_path)
            .await;
        if let MoveOutcome::Moved { destination } = outcome {
            if let Err(e) = self
                .catalog
                .update_recording_thumbnail_path(recording_id, &destination)
                .await
            {
                error!(recording_id, error = %e, "Failed to update thumbnail path");
            }
        }
    }

    /// Move the event clip of a recording to the next tier
    pub async fn move_event_clip(&self, recording_id: i64) {
        let clip_path = match self.catalog.get_recording(recording_id).await {
            Ok(Some(recording)) => recording.clip_path,
            Ok(None) => None,
            Err(e) => {
                error!(recording_id, error = %e, "Failed to look up recording");
                return;
            }
        };
        let Some(clip_path) = clip_path else {
            return;
        };

        let outcome = self.handle_file(&clip_path, &self.settings.tier_path).await;
        if let MoveOutcome::Moved { destination } = outcome {
            self.update_clip_path(Path::new(&destination)).await;
        }
    }

    async fn update_clip_path(&self, path: &Path) {
        let Some(suffix) = clip_suffix(path) else {
            return;
        };
        let path = path.to_string_lossy();
        if let Err(e) = self
            .catalog
            .update_recording_clip_path(&self.settings.camera_identifier, &suffix, &path)
            .await
        {
            error!(path = %path, error = %e, "Failed to update clip path of recording");
        }
    }

    async fn update_thumbnail_path(&self, path: &Path) {
        let Some(recording_id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<i64>().ok())
        else {
            debug!(path = %path.display(), "Thumbnail is not named after a recording");
            return;
        };
        if let Err(e) = self
            .catalog
            .update_recording_thumbnail_path(recording_id, &path.to_string_lossy())
            .await
        {
            error!(
                recording_id,
                path = %path.display(),
                error = %e,
                "Failed to update thumbnail path of recording"
            );
        }
    }

    async fn apply_size_update(&self, path: &Path) {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len() as i64,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read file size");
                return;
            }
        };

        if let Err(e) = self
            .catalog
            .update_file_size(&path.to_string_lossy(), size)
            .await
        {
            error!(path = %path.display(), error = %e, "Failed to update file size");
            return;
        }
        debug!(path = %path.display(), size, "File size updated");
        self.check_tier().await;
    }

    /// Stop the handler, draining the tier first when configured
    #[instrument(skip(self), fields(handler = %self.name()))]
    pub async fn shutdown(&self) {
        self.set_state(HandlerState::ShuttingDown);

        if self.settings.move_on_shutdown {
            if let Err(e) = self.drain().await {
                error!(error = %e, "Failed to drain tier on shutdown");
            }
        }

        self.debouncer.flush().await;

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            let _ = runtime.queue.send(IngestMessage::Stop);
            if let Err(e) = runtime.ingestor.await {
                error!(error = %e, "Ingestor task failed");
            }
            runtime.watcher.stop();
        }

        self.set_state(HandlerState::Stopped);
        info!("Tier handler stopped");
    }

    fn enter_event(&self) -> HandlerState {
        let mut state = self.state.lock();
        let previous = *state;
        if previous == HandlerState::Watching {
            *state = HandlerState::ProcessingEvent;
        }
        previous
    }

    fn leave_event(&self, previous: HandlerState) {
        let mut state = self.state.lock();
        if *state == HandlerState::ProcessingEvent {
            *state = previous;
        }
    }

    async fn created(&self, path: &Path) -> anyhow::Result<()> {
        match self.kind {
            HandlerKind::Thumbnails => self.update_thumbnail_path(path).await,
            HandlerKind::Recordings if !self.is_first_tier() => self.update_clip_path(path).await,
            _ => {}
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "File vanished before it was catalogued");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", path.display()))
            }
        };
        if metadata.is_dir() {
            return Ok(());
        }

        let file = NewFile {
            tier_id: self.settings.tier_id as i64,
            tier_path: self.settings.tier_path.clone(),
            camera_identifier: self.settings.camera_identifier.clone(),
            category: self.settings.category.as_str().to_string(),
            subcategory: self.settings.subcategory.clone(),
            path: path.to_string_lossy().to_string(),
            directory: path
                .parent()
                .map(|parent| parent.to_string_lossy().to_string())
                .unwrap_or_default(),
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            size: metadata.len() as i64,
            created_at: Utc::now(),
        };

        match self
            .catalog
            .insert_file(&file)
            .await
            .context("Failed to catalogue file")?
        {
            InsertOutcome::Inserted => debug!(path = %file.path, "File catalogued"),
            InsertOutcome::Conflict => {
                warn!(path = %file.path, "File already catalogued, ignoring")
            }
        }

        self.check_tier().await;
        Ok(())
    }
}

#[async_trait]
impl IngestSink for TierHandler {
    async fn on_created(&self, path: &Path) -> anyhow::Result<()> {
        if self.skips(path) {
            return Ok(());
        }
        let previous = self.enter_event();
        let result = self.created(path).await;
        self.leave_event(previous);
        result
    }

    async fn on_modified(&self, path: &Path) -> anyhow::Result<()> {
        if self.skips(path) {
            return Ok(());
        }
        let weak = self.weak_self.clone();
        let owned = path.to_path_buf();
        self.debouncer.arm(&path.to_string_lossy(), move || async move {
            if let Some(handler) = weak.upgrade() {
                handler.apply_size_update(&owned).await;
            }
        });
        Ok(())
    }

    async fn on_evaluate(&self) -> anyhow::Result<()> {
        self.check_tier().await;
        Ok(())
    }

    async fn on_deleted(&self, path: &Path) -> anyhow::Result<()> {
        if self.skips(path) {
            return Ok(());
        }
        let previous = self.enter_event();
        let result = self
            .catalog
            .delete_file(&path.to_string_lossy())
            .await
            .map(|_| debug!(path = %path.display(), "File removed from catalog"))
            .context("Failed to remove file from catalog");
        self.leave_event(previous);
        result
    }
}
