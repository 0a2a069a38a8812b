use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Main configuration for the tiered storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Catalog database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Tier chains per camera
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Catalog database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Storage component configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Filenames the platform itself is actively writing. Watchers drop
    /// notifications for these.
    #[serde(default)]
    pub ignored_files: Vec<String>,
    /// Cameras with their tier chains
    #[serde(default)]
    pub cameras: Vec<CameraStorageConfig>,
    /// Seconds between evaluations requested without a filesystem event,
    /// 0 disables them
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Tier chains for a single camera
#[derive(Debug, Clone, Deserialize)]
pub struct CameraStorageConfig {
    /// Camera identifier
    pub identifier: String,
    /// Camera failed to initialize; its files are still managed and served
    #[serde(default)]
    pub failed: bool,
    /// Recorder tiers (segments, thumbnails, event clips)
    #[serde(default)]
    pub recorder: RecorderStorageConfig,
    /// Snapshot tiers
    #[serde(default)]
    pub snapshots: SnapshotStorageConfig,
}

/// Recorder tier chain
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecorderStorageConfig {
    /// Deprecated: days to keep event recordings in the first tier
    #[serde(default)]
    pub retain: Option<u64>,
    /// Ordered segment tiers, hot first
    #[serde(default)]
    pub tiers: Vec<SegmentTierConfig>,
}

/// Snapshot tier chain, shared by all configured snapshot domains
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotStorageConfig {
    /// Snapshot domains to manage
    #[serde(default = "default_snapshot_domains")]
    pub domains: Vec<SnapshotDomain>,
    /// Ordered snapshot tiers, hot first
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

/// Domains producing snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotDomain {
    ObjectDetector,
    FaceRecognition,
    LicensePlateRecognition,
    MotionDetector,
}

impl SnapshotDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotDomain::ObjectDetector => "object_detector",
            SnapshotDomain::FaceRecognition => "face_recognition",
            SnapshotDomain::LicensePlateRecognition => "license_plate_recognition",
            SnapshotDomain::MotionDetector => "motion_detector",
        }
    }
}

/// Age threshold expressed in days, hours and minutes
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgeConfig {
    #[serde(default)]
    pub days: Option<u64>,
    #[serde(default)]
    pub hours: Option<u64>,
    #[serde(default)]
    pub minutes: Option<u64>,
}

impl AgeConfig {
    /// Total age, zero when nothing is set
    pub fn to_duration(&self) -> Duration {
        let minutes = self
            .days
            .unwrap_or(0)
            .saturating_mul(24 * 60)
            .saturating_add(self.hours.unwrap_or(0).saturating_mul(60))
            .saturating_add(self.minutes.unwrap_or(0));
        Duration::from_secs(minutes.saturating_mul(60))
    }
}

/// Size threshold expressed in megabytes and gigabytes
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SizeConfig {
    #[serde(default)]
    pub mb: Option<u64>,
    #[serde(default)]
    pub gb: Option<u64>,
}

impl SizeConfig {
    /// Total size in bytes, zero when nothing is set
    pub fn to_bytes(&self) -> u64 {
        let mb = self.mb.unwrap_or(0).saturating_mul(1024 * 1024);
        let gb = self.gb.unwrap_or(0).saturating_mul(1024 * 1024 * 1024);
        mb.saturating_add(gb)
    }
}

/// Age/size thresholds of one retention axis
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetentionConfig {
    /// Files older than this are always moved
    #[serde(default)]
    pub max_age: AgeConfig,
    /// Files younger than this are never moved
    #[serde(default)]
    pub min_age: AgeConfig,
    /// Tier size above which the oldest files are moved
    #[serde(default)]
    pub max_size: SizeConfig,
    /// Content that is never moved for size reasons
    #[serde(default)]
    pub min_size: SizeConfig,
}

/// Plain tier (snapshots)
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    /// Tier root directory
    pub path: String,
    /// Poll the directory instead of subscribing to native events
    #[serde(default)]
    pub poll: bool,
    /// Move or delete every file in the tier when the service stops
    #[serde(default)]
    pub move_on_shutdown: bool,
    /// Retention thresholds
    #[serde(flatten)]
    pub retention: RetentionConfig,
}

/// Segment tier with separate continuous and event retention
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentTierConfig {
    /// Tier root directory
    pub path: String,
    /// Poll the directory instead of subscribing to native events
    #[serde(default)]
    pub poll: bool,
    /// Move or delete every file in the tier when the service stops
    #[serde(default)]
    pub move_on_shutdown: bool,
    /// Retention applied to all segments
    #[serde(default)]
    pub continuous: RetentionConfig,
    /// Retention applied to segments belonging to recordings
    #[serde(default)]
    pub events: RetentionConfig,
}

// Default value functions
fn default_service_name() -> String {
    "tiered-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database_url() -> String {
    "sqlite:///var/lib/tiered-storage/catalog.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_run_migrations() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_snapshot_domains() -> Vec<SnapshotDomain> {
    vec![
        SnapshotDomain::ObjectDetector,
        SnapshotDomain::FaceRecognition,
        SnapshotDomain::LicensePlateRecognition,
        SnapshotDomain::MotionDetector,
    ]
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ignored_files: Vec::new(),
            cameras: Vec::new(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl DatabaseConfig {
    /// Time to wait for a pooled connection
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl StorageConfig {
    /// Interval of periodic evaluations, None when disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for SnapshotStorageConfig {
    fn default() -> Self {
        Self {
            domains: default_snapshot_domains(),
            tiers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "tiered-storage")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/tiered-storage/storage").required(false))
            // STORAGE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut identifiers = HashSet::new();
        for camera in &self.storage.cameras {
            if camera.identifier.is_empty() {
                return Err(ConfigValidationError::MissingField(
                    "storage.cameras.identifier".to_string(),
                ));
            }
            if !identifiers.insert(camera.identifier.as_str()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "storage.cameras.identifier".to_string(),
                    message: format!("camera {} is configured twice", camera.identifier),
                });
            }

            let recorder_paths = camera.recorder.tiers.iter().map(|t| t.path.as_str());
            validate_tier_paths(&camera.identifier, "recorder", recorder_paths)?;
            let snapshot_paths = camera.snapshots.tiers.iter().map(|t| t.path.as_str());
            validate_tier_paths(&camera.identifier, "snapshots", snapshot_paths)?;
        }
        Ok(())
    }
}

fn validate_tier_paths<'a>(
    camera: &str,
    chain: &str,
    paths: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigValidationError> {
    let mut seen = HashSet::new();
    for path in paths {
        if path.is_empty() {
            return Err(ConfigValidationError::MissingField(format!(
                "storage.cameras.{camera}.{chain}.tiers.path"
            )));
        }
        // Two tiers sharing a root would make every move a no-op
        if !seen.insert(path.trim_end_matches('/')) {
            return Err(ConfigValidationError::InvalidValue {
                field: format!("storage.cameras.{camera}.{chain}.tiers.path"),
                message: format!("tier path {path} is used by more than one tier"),
            });
        }
    }
    Ok(())
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
