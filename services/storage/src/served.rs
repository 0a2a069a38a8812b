use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// How long a path stays protected after its latest reference
pub const SERVED_WINDOW: Duration = Duration::from_secs(2);

/// References between two opportunistic purges of expired entries
const PURGE_EVERY: usize = 256;

/// Process-wide registry of files currently being served.
///
/// Cloning is cheap and every clone shares the same entries. The mover skips
/// any path found here.
#[derive(Clone)]
pub struct ServedFiles {
    inner: Arc<ServedInner>,
}

struct ServedInner {
    entries: DashMap<String, ServedEntry>,
    /// Number of live serve guards
    in_flight: AtomicUsize,
    references: AtomicUsize,
    window: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ServedEntry {
    expires: Instant,
    /// Live guards on the path; the entry never expires while non-zero
    guards: usize,
}

impl ServedEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.guards > 0 || self.expires > now
    }
}

impl Default for ServedFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl ServedFiles {
    pub fn new() -> Self {
        Self::with_window(SERVED_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            inner: Arc::new(ServedInner {
                entries: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                references: AtomicUsize::new(0),
                window,
            }),
        }
    }

    /// Mark `path` as served, refreshing its expiry
    pub fn reference(&self, path: &str) {
        self.touch(path, 0);
        trace!(path, "Served file referenced");

        let references = self.inner.references.fetch_add(1, Ordering::Relaxed) + 1;
        if references % PURGE_EVERY == 0 {
            self.purge_expired();
        }
    }

    fn touch(&self, path: &str, guards_delta: isize) {
        let expires = Instant::now() + self.inner.window;
        let mut entry = self
            .inner
            .entries
            .entry(path.to_string())
            .or_insert(ServedEntry { expires, guards: 0 });
        entry.expires = expires;
        entry.guards = entry.guards.saturating_add_signed(guards_delta);
    }

    /// Whether `path` is guarded or was referenced within the window.
    /// Expired entries are dropped on lookup.
    pub fn contains(&self, path: &str) -> bool {
        let now = Instant::now();
        let live = match self.inner.entries.get(path) {
            Some(entry) => entry.is_live(now),
            None => return false,
        };
        if !live {
            self.inner
                .entries
                .remove_if(path, |_, entry| !entry.is_live(now));
        }
        live
    }

    /// Protect `path` for the lifetime of the returned guard and one window
    /// after it is dropped
    pub fn guard(&self, path: &str) -> ServeGuard {
        self.touch(path, 1);
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        ServeGuard {
            served: self.clone(),
            path: path.to_string(),
        }
    }

    /// Number of serve guards alive
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Drop every expired entry that has no live guard
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| entry.is_live(now));
        let purged = before.saturating_sub(self.inner.entries.len());
        if purged > 0 {
            trace!(purged, "Expired served entries purged");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

/// Keeps a served path protected until dropped, then for one more window
pub struct ServeGuard {
    served: ServedFiles,
    path: String,
}

impl ServeGuard {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        self.served.touch(&self.path, -1);
        self.served.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Filenames the system is writing itself and watchers must not report
#[derive(Clone, Default)]
pub struct IgnoredFiles {
    names: Arc<DashSet<String>>,
}

impl IgnoredFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, filename: impl Into<String>) {
        self.names.insert(filename.into());
    }

    pub fn remove(&self, filename: &str) {
        self.names.remove(filename);
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.names.contains(filename)
    }
}

impl<S: Into<String>> FromIterator<S> for IgnoredFiles {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let ignored = Self::new();
        for name in iter {
            ignored.insert(name);
        }
        ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_and_expiry() {
        let served = ServedFiles::with_window(Duration::from_millis(50));
        served.reference("/tier0/a.jpg");
        assert!(served.contains("/tier0/a.jpg"));
        assert!(!served.contains("/tier0/b.jpg"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!served.contains("/tier0/a.jpg"));
        assert!(served.is_empty());
    }

    #[test]
    fn test_reference_refreshes_window() {
        let served = ServedFiles::with_window(Duration::from_millis(100));
        served.reference("/tier0/a.jpg");
        std::thread::sleep(Duration::from_millis(60));
        served.reference("/tier0/a.jpg");
        std::thread::sleep(Duration::from_millis(60));
        assert!(served.contains("/tier0/a.jpg"));
    }

    #[test]
    fn test_guard_counts_in_flight() {
        let served = ServedFiles::new();
        let clone = served.clone();
        {
            let guard = served.guard("/tier0/a.m4s");
            assert_eq!(guard.path(), "/tier0/a.m4s");
            assert_eq!(clone.in_flight(), 1);
        }
        assert_eq!(clone.in_flight(), 0);
        assert!(clone.contains("/tier0/a.m4s"));
    }

    #[test]
    fn test_live_guard_outlasts_window() {
        let served = ServedFiles::with_window(Duration::from_millis(50));
        let guard = served.guard("/tier0/long.m4s");

        std::thread::sleep(Duration::from_millis(120));
        served.purge_expired();
        assert!(served.contains("/tier0/long.m4s"));

        drop(guard);
        assert!(served.contains("/tier0/long.m4s"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!served.contains("/tier0/long.m4s"));
    }

    #[test]
    fn test_nested_guards_on_same_path() {
        let served = ServedFiles::with_window(Duration::from_millis(20));
        let first = served.guard("/tier0/a.m4s");
        let second = served.guard("/tier0/a.m4s");
        drop(first);

        std::thread::sleep(Duration::from_millis(50));
        assert!(served.contains("/tier0/a.m4s"));
        drop(second);
        assert_eq!(served.in_flight(), 0);
    }

    #[test]
    fn test_purge_expired_drops_stale_entries() {
        let served = ServedFiles::with_window(Duration::from_millis(20));
        for i in 0..100 {
            served.reference(&format!("/tier0/{i}.jpg"));
        }
        let _guard = served.guard("/tier0/streaming.m4s");
        assert_eq!(served.len(), 101);

        std::thread::sleep(Duration::from_millis(60));
        served.purge_expired();
        assert_eq!(served.len(), 1);
        assert!(served.contains("/tier0/streaming.m4s"));
    }

    #[test]
    fn test_references_purge_expired_entries() {
        let served = ServedFiles::with_window(Duration::from_millis(20));
        for i in 0..PURGE_EVERY - 1 {
            served.reference(&format!("/tier0/old/{i}.jpg"));
        }
        std::thread::sleep(Duration::from_millis(60));

        served.reference("/tier0/new.jpg");
        assert_eq!(served.len(), 1);
    }

    #[test]
    fn test_ignored_files() {
        let ignored: IgnoredFiles = ["latest.jpg"].into_iter().collect();
        assert!(ignored.contains("latest.jpg"));
        ignored.remove("latest.jpg");
        assert!(!ignored.contains("latest.jpg"));
    }
}
