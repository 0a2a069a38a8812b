use crate::catalog::{Catalog, MetaCopy};
use crate::served::ServedFiles;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What happened to one evicted path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Relocated to the next tier
    Moved { destination: String },
    /// Removed from the last tier
    Deleted,
    /// Being served, left for a later cycle
    Skipped,
    /// Destination equals the source, left in place
    Collision,
    /// Already gone from disk, catalog corrected
    Missing,
    /// I/O failure, file left in place
    Failed,
}

impl MoveOutcome {
    /// True when the file no longer lives in the evaluated tier
    pub fn is_evicted(&self) -> bool {
        matches!(
            self,
            MoveOutcome::Moved { .. } | MoveOutcome::Deleted | MoveOutcome::Missing
        )
    }
}

/// Moves files between tiers and deletes them off the last tier, keeping the
/// catalog in step with the disk.
#[derive(Clone)]
pub struct FileMover {
    catalog: Arc<dyn Catalog>,
    served: ServedFiles,
}

impl FileMover {
    pub fn new(catalog: Arc<dyn Catalog>, served: ServedFiles) -> Self {
        Self { catalog, served }
    }

    /// Move `path` to the next tier, or delete it when `next_tier_path` is
    /// None.
    ///
    /// `file_tier_path` is the tier root the file was catalogued under and
    /// `tier_path` the root of the evaluating tier. When they differ the
    /// row belongs to an unwatched directory and is dropped afterwards.
    #[instrument(skip(self, file_tier_path, tier_path, next_tier_path), fields(tier = %tier_path))]
    pub async fn handle_file(
        &self,
        path: &str,
        file_tier_path: &str,
        tier_path: &str,
        next_tier_path: Option<&str>,
    ) -> MoveOutcome {
        if self.served.contains(path) {
            debug!("File is being served, skipping");
            metrics::counter!("storage.files.skipped").increment(1);
            return MoveOutcome::Skipped;
        }

        let outcome = match next_tier_path {
            None => self.delete_file(path).await,
            Some(next_tier_path) => {
                let destination = path.replacen(file_tier_path, next_tier_path, 1);
                if destination == path {
                    warn!(
                        file_tier_path,
                        next_tier_path,
                        "Destination is the same as the source, leaving file in place"
                    );
                    MoveOutcome::Collision
                } else {
                    self.move_file(path, &destination).await
                }
            }
        };

        if file_tier_path != tier_path {
            warn!(
                file_tier_path,
                "Tier path changed since the file was catalogued, dropping its row"
            );
            if let Err(e) = self.catalog.delete_file(path).await {
                error!(error = %e, "Failed to drop stale file row");
            }
        }

        outcome
    }

    /// Copy `src` to `dst`, then remove `src`. Metadata is carried over first.
    #[instrument(skip(self))]
    pub async fn move_file(&self, src: &str, dst: &str) -> MoveOutcome {
        match self.catalog.copy_metadata(src, dst).await {
            Ok(MetaCopy::Copied) => debug!("Metadata copied"),
            Ok(MetaCopy::SourceMissing) => debug!("Source has no metadata"),
            Ok(MetaCopy::Conflict) => warn!("Destination already has metadata"),
            Err(e) => error!(error = %e, "Failed to copy metadata"),
        }

        match relocate(src, dst).await {
            Ok(bytes) => {
                debug!(bytes, "File moved");
                metrics::counter!("storage.files.moved").increment(1);
                metrics::counter!("storage.bytes.moved").increment(bytes);
                MoveOutcome::Moved {
                    destination: dst.to_string(),
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("Source vanished before it could be moved");
                if let Err(e) = self.catalog.delete_file(src).await {
                    error!(error = %e, "Failed to drop row of vanished file");
                }
                MoveOutcome::Missing
            }
            Err(e) => {
                error!(error = %e, "Failed to move file");
                MoveOutcome::Failed
            }
        }
    }

    /// Drop the row of `path`, then the file itself
    #[instrument(skip(self))]
    pub async fn delete_file(&self, path: &str) -> MoveOutcome {
        if let Err(e) = self.catalog.delete_file(path).await {
            error!(error = %e, "Failed to delete file row");
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("File deleted");
                metrics::counter!("storage.files.deleted").increment(1);
                MoveOutcome::Deleted
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("File already gone");
                MoveOutcome::Missing
            }
            Err(e) => {
                error!(error = %e, "Failed to delete file");
                MoveOutcome::Failed
            }
        }
    }
}

async fn relocate(src: &str, dst: &str) -> std::io::Result<u64> {
    if let Some(parent) = Path::new(dst).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = tokio::fs::copy(src, dst).await?;
    match tokio::fs::remove_file(src).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FileMeta, NewFile, SqliteCatalog};
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        tier0: String,
        tier1: String,
        catalog: Arc<SqliteCatalog>,
        served: ServedFiles,
        mover: FileMover,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let tier0 = dir.path().join("tier0").to_string_lossy().to_string();
        let tier1 = dir.path().join("tier1").to_string_lossy().to_string();
        let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
        let served = ServedFiles::new();
        let mover = FileMover::new(catalog.clone(), served.clone());
        Fixture {
            _dir: dir,
            tier0,
            tier1,
            catalog,
            served,
            mover,
        }
    }

    async fn write_file(catalog: &SqliteCatalog, tier_path: &str, name: &str) -> String {
        let directory = format!("{tier_path}/segments/cam1");
        let path = format!("{directory}/{name}");
        tokio::fs::create_dir_all(&directory).await.unwrap();
        tokio::fs::write(&path, b"segment").await.unwrap();
        catalog
            .insert_file(&NewFile {
                tier_id: 0,
                tier_path: tier_path.to_string(),
                camera_identifier: "cam1".to_string(),
                category: "recorder".to_string(),
                subcategory: "segments".to_string(),
                path: path.clone(),
                directory,
                filename: name.to_string(),
                size: 7,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_move_preserves_metadata() {
        let f = fixture().await;
        let src = write_file(&f.catalog, &f.tier0, "1.m4s").await;
        let orig_ctime = Utc::now() - ChronoDuration::days(2);
        f.catalog
            .insert_file_meta(&FileMeta {
                path: src.clone(),
                meta: serde_json::json!({ "m3u8": { "EXTINF": 5.0 } }),
                orig_ctime,
            })
            .await
            .unwrap();

        let outcome = f
            .mover
            .handle_file(&src, &f.tier0, &f.tier0, Some(&f.tier1))
            .await;

        let dst = format!("{}/segments/cam1/1.m4s", f.tier1);
        assert_eq!(outcome, MoveOutcome::Moved { destination: dst.clone() });
        assert!(!Path::new(&src).exists());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"segment");

        let meta = f.catalog.get_file_meta(&dst).await.unwrap().unwrap();
        assert_eq!(meta.orig_ctime, orig_ctime);
    }

    #[tokio::test]
    async fn test_delete_on_last_tier() {
        let f = fixture().await;
        let path = write_file(&f.catalog, &f.tier0, "1.m4s").await;

        let outcome = f.mover.handle_file(&path, &f.tier0, &f.tier0, None).await;

        assert_eq!(outcome, MoveOutcome::Deleted);
        assert!(!Path::new(&path).exists());
        assert!(f.catalog.get_file(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_served_file_is_skipped() {
        let f = fixture().await;
        let path = write_file(&f.catalog, &f.tier0, "1.m4s").await;
        f.served.reference(&path);

        let outcome = f.mover.handle_file(&path, &f.tier0, &f.tier0, None).await;

        assert_eq!(outcome, MoveOutcome::Skipped);
        assert!(Path::new(&path).exists());
        assert!(f.catalog.get_file(&path).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_collision_leaves_file() {
        let f = fixture().await;
        let path = write_file(&f.catalog, &f.tier0, "1.m4s").await;

        let outcome = f
            .mover
            .handle_file(&path, &f.tier0, &f.tier0, Some(&f.tier0))
            .await;

        assert_eq!(outcome, MoveOutcome::Collision);
        assert!(Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_vanished_source_drops_row() {
        let f = fixture().await;
        let path = write_file(&f.catalog, &f.tier0, "1.m4s").await;
        tokio::fs::remove_file(&path).await.unwrap();

        let outcome = f
            .mover
            .handle_file(&path, &f.tier0, &f.tier0, Some(&f.tier1))
            .await;

        assert_eq!(outcome, MoveOutcome::Missing);
        assert!(outcome.is_evicted());
        assert!(f.catalog.get_file(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_tier_row_dropped() {
        let f = fixture().await;
        let path = write_file(&f.catalog, &f.tier0, "1.m4s").await;

        // Evaluated by a handler whose tier root has since changed
        let current = format!("{}-renamed", f.tier0);
        let outcome = f
            .mover
            .handle_file(&path, &f.tier0, &current, Some(&f.tier1))
            .await;

        assert!(matches!(outcome, MoveOutcome::Moved { .. }));
        assert!(f.catalog.get_file(&path).await.unwrap().is_none());
    }
}
