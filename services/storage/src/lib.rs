//! Tiered Storage Service
//!
//! Lifecycle manager for the recordings of a camera platform. Video
//! segments, event clips, thumbnails and snapshots are catalogued as they
//! appear on disk and migrated across an ordered chain of storage tiers
//! according to per-tier age and size retention. Falling off the last tier
//! deletes a file for good.
//!
//! ## Features
//!
//! - **Catalog**: SQLite-backed record of files, file metadata and
//!   recordings, kept in step with the disk by filesystem watchers
//! - **Retention policies**: age and size thresholds per tier, with separate
//!   continuous and event retention for recorder segments
//! - **Lockstep migration**: a recording's thumbnail and clip follow its
//!   segments from tier to tier
//! - **Serving guard**: files being served are never moved from under a
//!   reader
//!
//! ## Architecture
//!
//! ```text
//!  Tier directory        Tier handler                       Catalog
//! ┌──────────────┐      ┌───────────────────────────┐      ┌──────────────┐
//! │ segments/    │      │ Watcher ──▶ queue ──▶     │      │ files        │
//! │ thumbnails/  │─────▶│             Ingestor ─────┼─────▶│ files_meta   │
//! │ recordings/  │      │                │          │      │ recordings   │
//! │ snapshots/   │      │                ▼          │      └──────────────┘
//! └──────────────┘      │   Throttled policy check  │             ▲
//!        ▲              │                │          │             │
//!        │              │                ▼          │             │
//!        │              │           File mover ─────┼─────────────┘
//!        │              └────────────────┼──────────┘
//!        │                               │
//!        └──────── next tier ◀───────────┘
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod handler;
pub mod ingestor;
pub mod mover;
pub mod policy;
pub mod routes;
pub mod schedule;
pub mod served;
pub mod watcher;

pub use catalog::{Catalog, CatalogError, Category, SqliteCatalog};
pub use config::Config;
pub use coordinator::{TierCoordinator, TierDirectory};
pub use handler::{HandlerKind, HandlerState, TierHandler, TierSettings};
pub use mover::{FileMover, MoveOutcome};
pub use policy::{files_to_move, recordings_to_move, RetentionPolicy};
pub use routes::{FileRoute, RouteRegistrar, RouteTable};
pub use served::{IgnoredFiles, ServedFiles};
pub use watcher::{FsEventKind, FsNotification, TierWatcher, WatcherError};
