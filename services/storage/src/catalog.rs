use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the catalog
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid file metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Artifact category owning a tier chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Segments, thumbnails and event clips
    Recorder,
    /// Still images per snapshot domain
    Snapshots,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Recorder => "recorder",
            Category::Snapshots => "snapshots",
        }
    }
}

/// A file tracked in a tier
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileRecord {
    pub id: i64,
    /// Index of the tier in its chain
    pub tier_id: i64,
    /// Root path of the tier the file was catalogued under
    pub tier_path: String,
    pub camera_identifier: String,
    pub category: String,
    pub subcategory: String,
    /// Absolute file path
    pub path: String,
    /// Parent directory of `path`
    pub directory: String,
    pub filename: String,
    /// Size in bytes
    pub size: i64,
    /// When the row was inserted
    pub created_at: DateTime<Utc>,
}

/// A file about to be catalogued
#[derive(Debug, Clone)]
pub struct NewFile {
    pub tier_id: i64,
    pub tier_path: String,
    pub camera_identifier: String,
    pub category: String,
    pub subcategory: String,
    pub path: String,
    pub directory: String,
    pub filename: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

/// Selects the population of one tier
#[derive(Debug, Clone, PartialEq)]
pub struct FileFilter {
    pub camera_identifier: String,
    pub category: String,
    pub subcategory: String,
    pub tier_id: i64,
}

/// A file in a tier population, joined with its metadata creation time
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TierFile {
    pub id: i64,
    pub path: String,
    pub tier_path: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub orig_ctime: Option<DateTime<Utc>>,
}

impl TierFile {
    /// Creation time used for age checks. Metadata survives moves, the row
    /// timestamp does not.
    pub fn effective_created_at(&self) -> DateTime<Utc> {
        self.orig_ctime.unwrap_or(self.created_at)
    }
}

/// Metadata carried along when a file changes tier
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub path: String,
    /// Opaque metadata blob
    pub meta: serde_json::Value,
    /// Creation time of the original file, never reset by a move
    pub orig_ctime: DateTime<Utc>,
}

#[derive(FromRow)]
struct FileMetaRow {
    path: String,
    meta: String,
    orig_ctime: DateTime<Utc>,
}

impl TryFrom<FileMetaRow> for FileMeta {
    type Error = CatalogError;

    fn try_from(row: FileMetaRow) -> Result<Self, Self::Error> {
        Ok(Self {
            path: row.path,
            meta: serde_json::from_str(&row.meta)?,
            orig_ctime: row.orig_ctime,
        })
    }
}

/// A logical recording whose segments, clip and thumbnail move in lockstep
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Recording {
    pub id: i64,
    pub camera_identifier: String,
    pub start_time: DateTime<Utc>,
    /// None while the recording is in progress
    pub end_time: Option<DateTime<Utc>>,
    pub clip_path: Option<String>,
    pub thumbnail_path: Option<String>,
    /// Seconds of footage kept ahead of `start_time`
    pub lookback: i64,
    pub created_at: DateTime<Utc>,
}

/// A recording about to be catalogued
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub camera_identifier: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub clip_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub lookback: i64,
}

/// Result of an insert keyed by path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row for the path already exists
    Conflict,
}

/// Result of carrying metadata over to a new path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaCopy {
    Copied,
    /// The source path has no metadata
    SourceMissing,
    /// The destination path already has metadata
    Conflict,
}

/// Persisted table of files, file metadata and recordings mirroring disk state.
///
/// Every method runs in its own short transaction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert_file(&self, file: &NewFile) -> Result<InsertOutcome, CatalogError>;

    async fn update_file_size(&self, path: &str, size: i64) -> Result<u64, CatalogError>;

    async fn delete_file(&self, path: &str) -> Result<u64, CatalogError>;

    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>, CatalogError>;

    /// Files of one tier, newest first
    async fn select_files(&self, filter: &FileFilter) -> Result<Vec<TierFile>, CatalogError>;

    async fn insert_file_meta(&self, meta: &FileMeta) -> Result<InsertOutcome, CatalogError>;

    async fn get_file_meta(&self, path: &str) -> Result<Option<FileMeta>, CatalogError>;

    /// Copy the metadata of `src` to `dst`, preserving `orig_ctime`
    async fn copy_metadata(&self, src: &str, dst: &str) -> Result<MetaCopy, CatalogError>;

    async fn insert_recording(&self, recording: &NewRecording) -> Result<i64, CatalogError>;

    async fn get_recording(&self, id: i64) -> Result<Option<Recording>, CatalogError>;

    /// Recordings of a camera, newest first
    async fn select_recordings(&self, camera_identifier: &str)
        -> Result<Vec<Recording>, CatalogError>;

    async fn update_recording_thumbnail_path(
        &self,
        id: i64,
        path: &str,
    ) -> Result<u64, CatalogError>;

    /// Point every recording of the camera whose clip path ends with
    /// `suffix` at `path`
    async fn update_recording_clip_path(
        &self,
        camera_identifier: &str,
        suffix: &str,
        path: &str,
    ) -> Result<u64, CatalogError>;

    async fn delete_recordings(&self, ids: &[i64]) -> Result<u64, CatalogError>;
}

/// Escape `\`, `%` and `_` for a LIKE pattern using `ESCAPE '\'`
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// SQLite-backed catalog
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// Create a new catalog with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await?;

        info!(url = %config.url, "Connected to catalog database");

        Ok(Self { pool })
    }

    /// Migrated catalog living in a single in-memory connection
    pub async fn in_memory() -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // The database dies with its connection, so the pool must never
        // recycle it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let catalog = Self { pool };
        catalog.run_migrations().await?;
        Ok(catalog)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), CatalogError> {
        info!("Running catalog migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Catalog migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    #[instrument(skip(self, file), fields(path = %file.path))]
    async fn insert_file(&self, file: &NewFile) -> Result<InsertOutcome, CatalogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO files (
                tier_id, tier_path, camera_identifier, category, subcategory,
                path, directory, filename, size, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (path) DO NOTHING
            "#,
        )
        .bind(file.tier_id)
        .bind(&file.tier_path)
        .bind(&file.camera_identifier)
        .bind(&file.category)
        .bind(&file.subcategory)
        .bind(&file.path)
        .bind(&file.directory)
        .bind(&file.filename)
        .bind(file.size)
        .bind(file.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(InsertOutcome::Conflict);
        }
        debug!(tier_id = file.tier_id, size = file.size, "File catalogued");
        Ok(InsertOutcome::Inserted)
    }

    async fn update_file_size(&self, path: &str, size: i64) -> Result<u64, CatalogError> {
        let result = sqlx::query("UPDATE files SET size = ? WHERE path = ?")
            .bind(size)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_file(&self, path: &str) -> Result<u64, CatalogError> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>, CatalogError> {
        let file = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, tier_id, tier_path, camera_identifier, category, subcategory,
                   path, directory, filename, size, created_at
            FROM files
            WHERE path = ?
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(file)
    }

    #[instrument(skip(self))]
    async fn select_files(&self, filter: &FileFilter) -> Result<Vec<TierFile>, CatalogError> {
        let mut files = sqlx::query_as::<_, TierFile>(
            r#"
            SELECT f.id, f.path, f.tier_path, f.size, f.created_at, m.orig_ctime
            FROM files f
            LEFT JOIN files_meta m ON m.path = f.path
            WHERE f.camera_identifier = ?
              AND f.category = ?
              AND f.subcategory = ?
              AND f.tier_id = ?
            "#,
        )
        .bind(&filter.camera_identifier)
        .bind(&filter.category)
        .bind(&filter.subcategory)
        .bind(filter.tier_id)
        .fetch_all(&self.pool)
        .await?;

        // Timestamps are stored as text with variable precision, so order here
        files.sort_by(|a, b| {
            b.effective_created_at()
                .cmp(&a.effective_created_at())
                .then(b.id.cmp(&a.id))
        });
        Ok(files)
    }

    async fn insert_file_meta(&self, meta: &FileMeta) -> Result<InsertOutcome, CatalogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO files_meta (path, meta, orig_ctime)
            VALUES (?, ?, ?)
            ON CONFLICT (path) DO NOTHING
            "#,
        )
        .bind(&meta.path)
        .bind(serde_json::to_string(&meta.meta)?)
        .bind(meta.orig_ctime)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Conflict)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn get_file_meta(&self, path: &str) -> Result<Option<FileMeta>, CatalogError> {
        let row = sqlx::query_as::<_, FileMetaRow>(
            "SELECT path, meta, orig_ctime FROM files_meta WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FileMeta::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn copy_metadata(&self, src: &str, dst: &str) -> Result<MetaCopy, CatalogError> {
        let mut tx = self.pool.begin().await?;

        let source = sqlx::query_as::<_, FileMetaRow>(
            "SELECT path, meta, orig_ctime FROM files_meta WHERE path = ?",
        )
        .bind(src)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(source) = source else {
            tx.rollback().await?;
            return Ok(MetaCopy::SourceMissing);
        };

        let result = sqlx::query(
            r#"
            INSERT INTO files_meta (path, meta, orig_ctime)
            VALUES (?, ?, ?)
            ON CONFLICT (path) DO NOTHING
            "#,
        )
        .bind(dst)
        .bind(&source.meta)
        .bind(source.orig_ctime)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            Ok(MetaCopy::Conflict)
        } else {
            Ok(MetaCopy::Copied)
        }
    }

    async fn insert_recording(&self, recording: &NewRecording) -> Result<i64, CatalogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO recordings (
                camera_identifier, start_time, end_time, clip_path,
                thumbnail_path, lookback, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&recording.camera_identifier)
        .bind(recording.start_time)
        .bind(recording.end_time)
        .bind(&recording.clip_path)
        .bind(&recording.thumbnail_path)
        .bind(recording.lookback)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get_recording(&self, id: i64) -> Result<Option<Recording>, CatalogError> {
        let recording = sqlx::query_as::<_, Recording>(
            r#"
            SELECT id, camera_identifier, start_time, end_time, clip_path,
                   thumbnail_path, lookback, created_at
            FROM recordings
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(recording)
    }

    async fn select_recordings(
        &self,
        camera_identifier: &str,
    ) -> Result<Vec<Recording>, CatalogError> {
        let mut recordings = sqlx::query_as::<_, Recording>(
            r#"
            SELECT id, camera_identifier, start_time, end_time, clip_path,
                   thumbnail_path, lookback, created_at
            FROM recordings
            WHERE camera_identifier = ?
            "#,
        )
        .bind(camera_identifier)
        .fetch_all(&self.pool)
        .await?;

        recordings.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        Ok(recordings)
    }

    async fn update_recording_thumbnail_path(
        &self,
        id: i64,
        path: &str,
    ) -> Result<u64, CatalogError> {
        let result = sqlx::query("UPDATE recordings SET thumbnail_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_recording_clip_path(
        &self,
        camera_identifier: &str,
        suffix: &str,
        path: &str,
    ) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            r#"
            UPDATE recordings SET clip_path = ?
            WHERE camera_identifier = ?
              AND clip_path LIKE '%' || ? ESCAPE '\'
            "#,
        )
        .bind(path)
        .bind(camera_identifier)
        .bind(escape_like(suffix))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_recordings(&self, ids: &[i64]) -> Result<u64, CatalogError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM recordings WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        info!(deleted_count = result.rows_affected(), "Deleted recordings");
        Ok(result.rows_affected())
    }
}
