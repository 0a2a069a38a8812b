use crate::catalog::{Catalog, Category};
use crate::config::{CameraStorageConfig, StorageConfig};
use crate::handler::{
    HandlerDeps, HandlerKind, TierHandler, TierSettings, RECORDINGS, SEGMENTS, THUMBNAILS,
};
use crate::policy::RetentionPolicy;
use crate::routes::RouteRegistrar;
use crate::served::{IgnoredFiles, ServedFiles};
use anyhow::Context;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct HandlerKey {
    camera_identifier: String,
    subcategory: String,
    tier_id: usize,
}

/// Every tier handler of the process, addressable by camera, subcategory
/// and tier index
#[derive(Default)]
pub struct TierDirectory {
    handlers: DashMap<HandlerKey, Arc<TierHandler>>,
}

impl TierDirectory {
    pub fn insert(&self, handler: Arc<TierHandler>) {
        let settings = handler.settings();
        let key = HandlerKey {
            camera_identifier: settings.camera_identifier.clone(),
            subcategory: settings.subcategory.clone(),
            tier_id: settings.tier_id,
        };
        self.handlers.insert(key, handler);
    }

    pub fn lookup(
        &self,
        camera_identifier: &str,
        subcategory: &str,
        tier_id: usize,
    ) -> Option<Arc<TierHandler>> {
        let key = HandlerKey {
            camera_identifier: camera_identifier.to_string(),
            subcategory: subcategory.to_string(),
            tier_id,
        };
        self.handlers.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Handlers of one chain, first tier first
    pub fn chain(&self, camera_identifier: &str, subcategory: &str) -> Vec<Arc<TierHandler>> {
        let mut chain: Vec<_> = self
            .handlers
            .iter()
            .filter(|entry| {
                entry.key().camera_identifier == camera_identifier
                    && entry.key().subcategory == subcategory
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        chain.sort_by_key(|handler| handler.settings().tier_id);
        chain
    }

    /// Handler of the tier following `tier_id` in the same chain
    pub fn next_tier(
        &self,
        camera_identifier: &str,
        subcategory: &str,
        tier_id: usize,
    ) -> Option<Arc<TierHandler>> {
        self.lookup(camera_identifier, subcategory, tier_id + 1)
    }

    /// All handlers in a stable order
    pub fn handlers(&self) -> Vec<Arc<TierHandler>> {
        let mut entries: Vec<_> = self
            .handlers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries.into_iter().map(|(_, handler)| handler).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn normalize_tier_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Owns every tier handler and their shared services
pub struct TierCoordinator {
    directory: Arc<TierDirectory>,
    served: ServedFiles,
    sweep_interval: Option<Duration>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TierCoordinator {
    /// Build the tier chains of every configured camera
    pub fn new(
        config: &StorageConfig,
        catalog: Arc<dyn Catalog>,
        served: ServedFiles,
        registrar: Arc<dyn RouteRegistrar>,
    ) -> Self {
        let directory = Arc::new(TierDirectory::default());
        let deps = HandlerDeps {
            catalog,
            served: served.clone(),
            registrar,
            ignored: config.ignored_files.iter().cloned().collect::<IgnoredFiles>(),
            directory: Arc::downgrade(&directory),
        };

        for camera in &config.cameras {
            build_recorder_chain(&directory, camera, &deps);
            build_snapshot_chains(&directory, camera, &deps);
        }

        info!(handlers = directory.len(), "Tier handlers created");

        Self {
            directory,
            served,
            sweep_interval: config.sweep_interval(),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Arc<TierDirectory> {
        &self.directory
    }

    /// Cancelled once shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start every handler and the periodic evaluation task
    pub async fn start_all(&self) -> anyhow::Result<()> {
        for handler in self.directory.handlers() {
            handler.start().await.with_context(|| {
                format!("Failed to start tier handler for {}", handler.path().display())
            })?;
        }

        if let Some(interval) = self.sweep_interval {
            let directory = Arc::clone(&self.directory);
            let served = self.served.clone();
            let token = self.shutdown.clone();
            *self.sweeper.lock() = Some(tokio::spawn(sweep(directory, served, interval, token)));
        }

        info!(handlers = self.directory.len(), "All tier handlers started");
        Ok(())
    }

    /// Stop every handler. Handlers drain and stop concurrently.
    pub async fn shutdown_all(&self) {
        info!("Shutting down tier handlers");
        self.shutdown.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        let handlers = self.directory.handlers();
        join_all(handlers.iter().map(|handler| handler.shutdown())).await;
        info!("All tier handlers stopped");
    }
}

/// Ask every handler for an evaluation on a fixed interval so aged files
/// leave quiet tiers too. Expired served entries are purged on each tick.
async fn sweep(
    directory: Arc<TierDirectory>,
    served: ServedFiles,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let requested = directory
                    .handlers()
                    .iter()
                    .filter(|handler| handler.request_evaluation())
                    .count();
                served.purge_expired();
                debug!(requested, served = served.len(), "Requested periodic tier evaluations");
            }
        }
    }
}

fn build_recorder_chain(
    directory: &TierDirectory,
    camera: &CameraStorageConfig,
    deps: &HandlerDeps,
) {
    let tiers = &camera.recorder.tiers;
    for (tier_id, tier) in tiers.iter().enumerate() {
        let tier_path = normalize_tier_path(&tier.path);
        let next_tier_path = tiers.get(tier_id + 1).map(|next| normalize_tier_path(&next.path));

        let mut events = RetentionPolicy::from(&tier.events);
        if tier_id == 0 {
            if let Some(days) = camera.recorder.retain {
                warn!(
                    camera = %camera.identifier,
                    days,
                    "recorder.retain is deprecated, using it as max_age of the first tier's events"
                );
                events.max_age = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
            }
        }

        let settings = |subcategory: &str| TierSettings {
            camera_identifier: camera.identifier.clone(),
            category: Category::Recorder,
            subcategory: subcategory.to_string(),
            tier_id,
            tier_path: tier_path.clone(),
            next_tier_path: next_tier_path.clone(),
            poll: tier.poll,
            move_on_shutdown: tier.move_on_shutdown,
            failed: camera.failed,
        };

        directory.insert(TierHandler::new(
            settings(SEGMENTS),
            HandlerKind::Segments {
                continuous: RetentionPolicy::from(&tier.continuous),
                events,
            },
            deps.clone(),
        ));
        directory.insert(TierHandler::new(
            settings(THUMBNAILS),
            HandlerKind::Thumbnails,
            deps.clone(),
        ));
        directory.insert(TierHandler::new(
            settings(RECORDINGS),
            HandlerKind::Recordings,
            deps.clone(),
        ));
    }
}

fn build_snapshot_chains(
    directory: &TierDirectory,
    camera: &CameraStorageConfig,
    deps: &HandlerDeps,
) {
    let tiers = &camera.snapshots.tiers;
    for domain in &camera.snapshots.domains {
        for (tier_id, tier) in tiers.iter().enumerate() {
            let settings = TierSettings {
                camera_identifier: camera.identifier.clone(),
                category: Category::Snapshots,
                subcategory: domain.as_str().to_string(),
                tier_id,
                tier_path: normalize_tier_path(&tier.path),
                next_tier_path: tiers.get(tier_id + 1).map(|next| normalize_tier_path(&next.path)),
                poll: tier.poll,
                move_on_shutdown: tier.move_on_shutdown,
                failed: camera.failed,
            };
            directory.insert(TierHandler::new(
                settings,
                HandlerKind::Generic {
                    policy: RetentionPolicy::from(&tier.retention),
                },
                deps.clone(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::config::{
        RecorderStorageConfig, RetentionConfig, SegmentTierConfig, SnapshotDomain,
        SnapshotStorageConfig, TierConfig,
    };
    use crate::handler::HandlerState;
    use crate::routes::{MockRouteRegistrar, RouteTable};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn segment_tier(path: String) -> SegmentTierConfig {
        SegmentTierConfig {
            path,
            poll: true,
            move_on_shutdown: false,
            continuous: RetentionConfig::default(),
            events: RetentionConfig::default(),
        }
    }

    fn storage_config(root: &TempDir) -> StorageConfig {
        let tier = |name: &str| format!("{}/", root.path().join(name).to_string_lossy());
        StorageConfig {
            ignored_files: vec!["latest.jpg".to_string()],
            cameras: vec![CameraStorageConfig {
                identifier: "cam1".to_string(),
                failed: false,
                recorder: RecorderStorageConfig {
                    retain: Some(7),
                    tiers: vec![segment_tier(tier("hot")), segment_tier(tier("cold"))],
                },
                snapshots: SnapshotStorageConfig {
                    domains: vec![SnapshotDomain::ObjectDetector, SnapshotDomain::MotionDetector],
                    tiers: vec![TierConfig {
                        path: tier("snapshots"),
                        poll: true,
                        move_on_shutdown: false,
                        retention: RetentionConfig::default(),
                    }],
                },
            }],
            sweep_interval_secs: 0,
        }
    }

    async fn coordinator(root: &TempDir) -> TierCoordinator {
        let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
        let mut registrar = MockRouteRegistrar::new();
        registrar.expect_register().returning(|_| Ok(()));
        TierCoordinator::new(
            &storage_config(root),
            catalog,
            ServedFiles::new(),
            Arc::new(registrar),
        )
    }

    #[tokio::test]
    async fn test_builds_chains_per_camera() {
        let root = TempDir::new().unwrap();
        let coordinator = coordinator(&root).await;
        let directory = coordinator.directory();

        // Two recorder tiers with three handlers each, two snapshot domains
        assert_eq!(directory.len(), 8);

        let segments = directory.chain("cam1", SEGMENTS);
        assert_eq!(segments.len(), 2);
        let hot = root.path().join("hot").to_string_lossy().to_string();
        let cold = root.path().join("cold").to_string_lossy().to_string();
        assert_eq!(segments[0].settings().tier_path, hot);
        assert_eq!(segments[0].settings().next_tier_path, Some(cold.clone()));
        assert_eq!(segments[1].settings().next_tier_path, None);

        let next = directory.next_tier("cam1", THUMBNAILS, 0).unwrap();
        assert_eq!(next.settings().tier_path, cold);
        assert!(directory.next_tier("cam1", THUMBNAILS, 1).is_none());

        let snapshots = directory.lookup("cam1", "motion_detector", 0).unwrap();
        assert!(snapshots.path().ends_with("snapshots/snapshots/motion_detector/cam1"));
    }

    #[tokio::test]
    async fn test_retain_becomes_first_tier_events_max_age() {
        let root = TempDir::new().unwrap();
        let coordinator = coordinator(&root).await;

        let chain = coordinator.directory().chain("cam1", SEGMENTS);
        let HandlerKind::Segments { events, .. } = chain[0].kind() else {
            panic!("expected a segments handler");
        };
        assert_eq!(events.max_age, Duration::from_secs(7 * 24 * 60 * 60));

        let HandlerKind::Segments { events, .. } = chain[1].kind() else {
            panic!("expected a segments handler");
        };
        assert!(events.max_age.is_zero());
    }

    #[tokio::test]
    async fn test_huge_retain_saturates() {
        let root = TempDir::new().unwrap();
        let mut config = storage_config(&root);
        config.cameras[0].recorder.retain = Some(u64::MAX);
        let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
        let coordinator = TierCoordinator::new(
            &config,
            catalog,
            ServedFiles::new(),
            Arc::new(MockRouteRegistrar::new()),
        );

        let chain = coordinator.directory().chain("cam1", SEGMENTS);
        let HandlerKind::Segments { events, .. } = chain[0].kind() else {
            panic!("expected a segments handler");
        };
        assert_eq!(events.max_age, Duration::from_secs(u64::MAX));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_all() {
        let root = TempDir::new().unwrap();
        let coordinator = coordinator(&root).await;

        coordinator.start_all().await.unwrap();
        for handler in coordinator.directory().handlers() {
            assert_eq!(handler.state(), HandlerState::Watching);
            assert!(handler.path().is_dir());
        }

        coordinator.shutdown_all().await;
        assert!(coordinator.shutdown_token().is_cancelled());
        for handler in coordinator.directory().handlers() {
            assert_eq!(handler.state(), HandlerState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_sweep_requests_evaluations_and_purges_served() {
        let root = TempDir::new().unwrap();
        let mut config = storage_config(&root);
        config.sweep_interval_secs = 1;
        let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
        let served = ServedFiles::with_window(Duration::from_millis(10));
        let mut registrar = MockRouteRegistrar::new();
        registrar.expect_register().returning(|_| Ok(()));
        let coordinator =
            TierCoordinator::new(&config, catalog, served.clone(), Arc::new(registrar));

        let segments = coordinator.directory().lookup("cam1", SEGMENTS, 0).unwrap();
        assert!(!segments.request_evaluation());

        served.reference("/never/evicted.m4s");
        coordinator.start_all().await.unwrap();

        let mut evaluated = false;
        for _ in 0..30 {
            if segments.stats().evaluations.load(Ordering::Relaxed) > 0 {
                evaluated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(evaluated, "sweep did not evaluate the segments tier");
        assert!(served.is_empty());

        // Thumbnail handlers accept the request but never evaluate on their own
        let thumbnails = coordinator.directory().lookup("cam1", THUMBNAILS, 0).unwrap();
        assert!(thumbnails.request_evaluation());

        coordinator.shutdown_all().await;
        assert!(!segments.request_evaluation());
        assert_eq!(thumbnails.stats().evaluations.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_new_segment_is_catalogued() {
        let root = TempDir::new().unwrap();
        let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
        let served = ServedFiles::new();
        let routes = Arc::new(RouteTable::new(served.clone()));
        let coordinator = TierCoordinator::new(
            &storage_config(&root),
            catalog.clone(),
            served,
            routes.clone(),
        );
        coordinator.start_all().await.unwrap();

        let segments = coordinator.directory().lookup("cam1", SEGMENTS, 0).unwrap();
        let path = segments.path().join("1700000000.m4s");
        tokio::fs::write(&path, b"segment").await.unwrap();
        let key = path.to_string_lossy().to_string();

        let mut catalogued = None;
        for _ in 0..50 {
            if let Some(file) = catalog.get_file(&key).await.unwrap() {
                catalogued = Some(file);
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let file = catalogued.expect("segment was not catalogued");
        assert_eq!(file.subcategory, SEGMENTS);
        assert_eq!(file.tier_id, 0);
        assert_eq!(file.size, 7);

        let request = format!("/files{key}");
        let resolved = routes.resolve(&request).unwrap();
        assert_eq!(resolved.file_path, key);

        coordinator.shutdown_all().await;
    }
}
