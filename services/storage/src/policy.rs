use crate::catalog::{Catalog, CatalogError, FileFilter, Recording, TierFile};
use crate::config::RetentionConfig;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, instrument};

/// Length of one recorder segment
pub const SEGMENT_DURATION: Duration = Duration::from_secs(5);

/// Grace period applied to plain tiers when `min_age` is unset
pub const DEFAULT_MIN_AGE: Duration = Duration::from_secs(5);

/// Segments younger than this are kept for live streaming
const SETTLED_SEGMENT_AGE: Duration = Duration::from_secs(SEGMENT_DURATION.as_secs() * 5);

/// Resolved thresholds of one retention axis. Zero disables a threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_bytes: u64,
    pub min_bytes: u64,
    pub max_age: Duration,
    pub min_age: Duration,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            max_bytes: config.max_size.to_bytes(),
            min_bytes: config.min_size.to_bytes(),
            max_age: config.max_age.to_duration(),
            min_age: config.min_age.to_duration(),
        }
    }
}

impl RetentionPolicy {
    /// False when every threshold is unset
    pub fn is_configured(&self) -> bool {
        self.max_bytes > 0
            || self.min_bytes > 0
            || !self.max_age.is_zero()
            || !self.min_age.is_zero()
    }

    /// Decide eligibility of one item given its age and the content newer
    /// than it
    fn is_eligible(&self, age: Duration, newer_bytes: u64, size: u64, min_age: Duration) -> bool {
        if age < min_age {
            return false;
        }
        if !self.max_age.is_zero() && age > self.max_age {
            return true;
        }
        self.max_bytes > 0
            && newer_bytes.saturating_add(size) > self.max_bytes
            && newer_bytes >= self.min_bytes
    }
}

/// One segment row selected by the events policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCandidate {
    /// Recording the segment belongs to, None for segments outside any
    /// recording
    pub recording_id: Option<i64>,
    pub file_id: i64,
    pub path: String,
    pub tier_path: String,
}

fn age_of(created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or(Duration::ZERO)
}

/// Walk `items` newest first and return the indices that are eligible
fn select_indices<T>(
    items: &[T],
    policy: &RetentionPolicy,
    min_age: Duration,
    now: DateTime<Utc>,
    size: impl Fn(&T) -> u64,
    created_at: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<usize> {
    let mut newer_bytes: u64 = 0;
    let mut selected = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let item_size = size(item);
        let age = age_of(created_at(item), now);
        if policy.is_eligible(age, newer_bytes, item_size, min_age) {
            selected.push(index);
        }
        newer_bytes = newer_bytes.saturating_add(item_size);
    }

    selected
}

/// Select the files of a tier that should leave it.
///
/// `files` may be in any order; the result is ordered newest first.
pub fn files_to_move(
    files: &[TierFile],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<TierFile> {
    let mut ordered = files.to_vec();
    ordered.sort_by(|a, b| {
        b.effective_created_at()
            .cmp(&a.effective_created_at())
            .then(b.id.cmp(&a.id))
    });

    let min_age = if policy.min_age.is_zero() {
        DEFAULT_MIN_AGE
    } else {
        policy.min_age
    };

    select_indices(
        &ordered,
        policy,
        min_age,
        now,
        |file| file.size.max(0) as u64,
        |file| file.effective_created_at(),
    )
    .into_iter()
    .map(|index| ordered[index].clone())
    .collect()
}

/// Window of segment creation times belonging to a recording. Open
/// recordings extend to `now`.
fn recording_window(recording: &Recording, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let lead = chrono::Duration::seconds(recording.lookback.max(0))
        + chrono::Duration::seconds(SEGMENT_DURATION.as_secs() as i64);
    (
        recording.start_time - lead,
        recording.end_time.unwrap_or(now),
    )
}

fn linked_files<'a>(
    recording: &Recording,
    files: &'a [TierFile],
    now: DateTime<Utc>,
) -> Vec<&'a TierFile> {
    let (from, to) = recording_window(recording, now);
    files
        .iter()
        .filter(|file| {
            let created = file.effective_created_at();
            created >= from && created <= to
        })
        .collect()
}

/// Select the segment rows the events policy evicts.
///
/// Closed recordings are ordered newest first and judged by their start time
/// and the bytes of their linked segments. Segments of in-progress
/// recordings are never selected. Segments outside every recording are
/// selected once they have settled. Candidates are ordered newest recording
/// first, orphan segments last.
pub fn recordings_to_move(
    recordings: &[Recording],
    files: &[TierFile],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<EventCandidate> {
    let settled = |file: &TierFile| age_of(file.effective_created_at(), now) > SETTLED_SEGMENT_AGE;

    let mut linked_ids: HashSet<i64> = HashSet::new();
    let mut closed: Vec<(&Recording, Vec<&TierFile>)> = Vec::new();
    for recording in recordings {
        let linked = linked_files(recording, files, now);
        linked_ids.extend(linked.iter().map(|file| file.id));
        if recording.end_time.is_some() {
            closed.push((recording, linked));
        }
    }
    closed.sort_by(|(a, _), (b, _)| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));

    let selected = select_indices(
        &closed,
        policy,
        policy.min_age,
        now,
        |(_, linked)| linked.iter().map(|file| file.size.max(0) as u64).sum(),
        |(recording, _)| recording.start_time,
    );

    // Segments shared with a recording that stays (overlapping lookback or
    // still recording) stay as well
    let selected: HashSet<usize> = selected.into_iter().collect();
    let mut retained_ids: HashSet<i64> = recordings
        .iter()
        .filter(|recording| recording.end_time.is_none())
        .flat_map(|recording| linked_files(recording, files, now))
        .map(|file| file.id)
        .collect();
    for (index, (_, linked)) in closed.iter().enumerate() {
        if !selected.contains(&index) {
            retained_ids.extend(linked.iter().map(|file| file.id));
        }
    }

    let mut seen: HashSet<i64> = HashSet::new();
    let mut candidates = Vec::new();
    for (index, (recording, linked)) in closed.iter().enumerate() {
        if !selected.contains(&index) {
            continue;
        }
        for file in linked.iter().filter(|file| settled(file)) {
            if !retained_ids.contains(&file.id) && seen.insert(file.id) {
                candidates.push(EventCandidate {
                    recording_id: Some(recording.id),
                    file_id: file.id,
                    path: file.path.clone(),
                    tier_path: file.tier_path.clone(),
                });
            }
        }
    }

    for file in files {
        if !linked_ids.contains(&file.id) && settled(file) && seen.insert(file.id) {
            candidates.push(EventCandidate {
                recording_id: None,
                file_id: file.id,
                path: file.path.clone(),
                tier_path: file.tier_path.clone(),
            });
        }
    }

    candidates
}

/// Keep the events rows whose file the continuous policy also selected
pub fn files_to_move_overlap(
    events: Vec<EventCandidate>,
    continuous: &[TierFile],
) -> Vec<EventCandidate> {
    let continuous_ids: HashSet<i64> = continuous.iter().map(|file| file.id).collect();
    events
        .into_iter()
        .filter(|candidate| continuous_ids.contains(&candidate.file_id))
        .collect()
}

/// What a segment tier evaluation decided
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentSelection {
    /// Paths to move or delete, each at most once
    pub files: Vec<(String, String)>,
    /// Events rows behind the selection, used for lockstep migration
    pub events: Vec<EventCandidate>,
}

/// Combine the continuous and events axes of a segment tier. None marks an
/// axis that is not configured.
pub fn combine_segment_selection(
    continuous: Option<Vec<TierFile>>,
    events: Option<Vec<EventCandidate>>,
) -> SegmentSelection {
    let mut seen = HashSet::new();
    let from_events = |events: Vec<EventCandidate>, seen: &mut HashSet<String>| {
        let files = events
            .iter()
            .filter(|candidate| seen.insert(candidate.path.clone()))
            .map(|candidate| (candidate.path.clone(), candidate.tier_path.clone()))
            .collect();
        SegmentSelection { files, events }
    };

    match (continuous, events) {
        (Some(continuous), Some(events)) => {
            from_events(files_to_move_overlap(events, &continuous), &mut seen)
        }
        (None, Some(events)) => from_events(events, &mut seen),
        (Some(continuous), None) => SegmentSelection {
            files: continuous
                .into_iter()
                .filter(|file| seen.insert(file.path.clone()))
                .map(|file| (file.path, file.tier_path))
                .collect(),
            events: Vec::new(),
        },
        (None, None) => SegmentSelection::default(),
    }
}

/// Fetch a tier population and apply the plain policy
#[instrument(
    skip(catalog, filter, policy),
    fields(camera = %filter.camera_identifier, tier = filter.tier_id)
)]
pub async fn select_files_to_move(
    catalog: &dyn Catalog,
    filter: &FileFilter,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<TierFile>, CatalogError> {
    let files = catalog.select_files(filter).await?;
    let selected = files_to_move(&files, policy, now);
    debug!(population = files.len(), selected = selected.len(), "Evaluated files policy");
    Ok(selected)
}

/// Fetch a segment tier population with its recordings and apply the events
/// policy
#[instrument(
    skip(catalog, filter, policy),
    fields(camera = %filter.camera_identifier, tier = filter.tier_id)
)]
pub async fn select_recordings_to_move(
    catalog: &dyn Catalog,
    filter: &FileFilter,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<EventCandidate>, CatalogError> {
    let files = catalog.select_files(filter).await?;
    let recordings = catalog.select_recordings(&filter.camera_identifier).await?;
    let selected = recordings_to_move(&recordings, &files, policy, now);
    debug!(
        population = files.len(),
        recordings = recordings.len(),
        selected = selected.len(),
        "Evaluated events policy"
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const MB: u64 = 1024 * 1024;

    fn file(id: i64, age_secs: i64, size: u64, now: DateTime<Utc>) -> TierFile {
        TierFile {
            id,
            path: format!("/tier0/segments/cam1/{id}.m4s"),
            tier_path: "/tier0".to_string(),
            size: size as i64,
            created_at: now - ChronoDuration::seconds(age_secs),
            orig_ctime: None,
        }
    }

    fn recording(id: i64, start_age: i64, end_age: Option<i64>, now: DateTime<Utc>) -> Recording {
        Recording {
            id,
            camera_identifier: "cam1".to_string(),
            start_time: now - ChronoDuration::seconds(start_age),
            end_time: end_age.map(|age| now - ChronoDuration::seconds(age)),
            clip_path: None,
            thumbnail_path: None,
            lookback: 5,
            created_at: now - ChronoDuration::seconds(start_age),
        }
    }

    fn ids(files: &[TierFile]) -> Vec<i64> {
        files.iter().map(|file| file.id).collect()
    }

    #[test]
    fn test_old_files_selected_regardless_of_size() {
        let now = Utc::now();
        let files = vec![file(1, 10, 1, now), file(2, 7200, 1, now)];
        let policy = RetentionPolicy {
            max_bytes: 100 * MB,
            max_age: Duration::from_secs(3600),
            ..Default::default()
        };

        assert_eq!(ids(&files_to_move(&files, &policy, now)), vec![2]);
    }

    #[test]
    fn test_young_files_never_selected() {
        let now = Utc::now();
        let files = vec![file(1, 1, 10 * MB, now), file(2, 3, 10 * MB, now)];
        let policy = RetentionPolicy {
            max_bytes: MB,
            ..Default::default()
        };
        assert!(files_to_move(&files, &policy, now).is_empty());

        let policy = RetentionPolicy {
            max_bytes: MB,
            min_age: Duration::from_secs(60),
            ..Default::default()
        };
        let files = vec![file(1, 30, 10 * MB, now), file(2, 90, 10 * MB, now)];
        assert_eq!(ids(&files_to_move(&files, &policy, now)), vec![2]);
    }

    #[test]
    fn test_size_eviction_oldest_first() {
        let now = Utc::now();
        let files = vec![
            file(1, 10, 4 * MB, now),
            file(2, 20, 4 * MB, now),
            file(3, 30, 4 * MB, now),
            file(4, 40, 4 * MB, now),
        ];
        let policy = RetentionPolicy {
            max_bytes: 10 * MB,
            ..Default::default()
        };

        assert_eq!(ids(&files_to_move(&files, &policy, now)), vec![3, 4]);
    }

    #[test]
    fn test_min_bytes_floor() {
        let now = Utc::now();
        let files = vec![file(1, 10, 8 * MB, now), file(2, 20, 8 * MB, now)];
        let policy = RetentionPolicy {
            max_bytes: 4 * MB,
            min_bytes: 12 * MB,
            ..Default::default()
        };

        // Only 8 MB is newer than file 2, below the 12 MB floor
        assert!(files_to_move(&files, &policy, now).is_empty());
    }

    #[test]
    fn test_metadata_ctime_drives_age() {
        let now = Utc::now();
        let mut moved = file(1, 10, 1, now);
        moved.orig_ctime = Some(now - ChronoDuration::hours(2));
        let policy = RetentionPolicy {
            max_age: Duration::from_secs(3600),
            ..Default::default()
        };

        assert_eq!(ids(&files_to_move(&[moved], &policy, now)), vec![1]);
    }

    #[test]
    fn test_unset_policy_is_not_configured() {
        assert!(!RetentionPolicy::default().is_configured());
        assert!(RetentionPolicy {
            min_bytes: 1,
            ..Default::default()
        }
        .is_configured());
    }

    #[test]
    fn test_recordings_to_move_links_segments() {
        let now = Utc::now();
        // Recording 42 spans 7200s..7100s ago, lookback 5s
        let recordings = vec![recording(42, 7200, Some(7100), now)];
        let files = vec![
            file(1, 7208, MB, now),
            file(2, 7150, MB, now),
            file(3, 7000, MB, now),
            file(4, 10, MB, now),
        ];
        let policy = RetentionPolicy {
            max_age: Duration::from_secs(3600),
            ..Default::default()
        };

        let candidates = recordings_to_move(&recordings, &files, &policy, now);
        let linked: Vec<_> = candidates
            .iter()
            .filter(|c| c.recording_id == Some(42))
            .map(|c| c.file_id)
            .collect();
        assert_eq!(linked, vec![1, 2]);

        // File 3 is an orphan old enough to settle, file 4 is still fresh
        let orphans: Vec<_> = candidates
            .iter()
            .filter(|c| c.recording_id.is_none())
            .map(|c| c.file_id)
            .collect();
        assert_eq!(orphans, vec![3]);
    }

    #[test]
    fn test_open_recordings_are_kept() {
        let now = Utc::now();
        let recordings = vec![recording(7, 7200, None, now)];
        let files = vec![file(1, 7100, MB, now), file(2, 100, MB, now)];
        let policy = RetentionPolicy {
            max_age: Duration::from_secs(60),
            ..Default::default()
        };

        assert!(recordings_to_move(&recordings, &files, &policy, now).is_empty());
    }

    #[test]
    fn test_recording_size_axis() {
        let now = Utc::now();
        let recordings = vec![
            recording(1, 300, Some(290), now),
            recording(2, 200, Some(190), now),
        ];
        let files = vec![file(10, 195, 6 * MB, now), file(11, 295, 6 * MB, now)];
        let policy = RetentionPolicy {
            max_bytes: 8 * MB,
            ..Default::default()
        };

        let candidates = recordings_to_move(&recordings, &files, &policy, now);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].recording_id, Some(1));
        assert_eq!(candidates[0].file_id, 11);
    }

    #[test]
    fn test_combination_modes() {
        let now = Utc::now();
        let continuous = vec![file(1, 100, 1, now), file(2, 100, 1, now)];
        let events = vec![
            EventCandidate {
                recording_id: Some(42),
                file_id: 2,
                path: "/tier0/segments/cam1/2.m4s".to_string(),
                tier_path: "/tier0".to_string(),
            },
            EventCandidate {
                recording_id: Some(43),
                file_id: 3,
                path: "/tier0/segments/cam1/3.m4s".to_string(),
                tier_path: "/tier0".to_string(),
            },
        ];

        let only_continuous = combine_segment_selection(Some(continuous.clone()), None);
        assert_eq!(only_continuous.files.len(), 2);
        assert!(only_continuous.events.is_empty());

        let only_events = combine_segment_selection(None, Some(events.clone()));
        assert_eq!(only_events.files.len(), 2);
        assert_eq!(only_events.events.len(), 2);

        let both = combine_segment_selection(Some(continuous), Some(events));
        assert_eq!(
            both.files,
            vec![(
                "/tier0/segments/cam1/2.m4s".to_string(),
                "/tier0".to_string()
            )]
        );
        assert_eq!(both.events[0].recording_id, Some(42));

        assert_eq!(combine_segment_selection(None, None), SegmentSelection::default());
    }
}
