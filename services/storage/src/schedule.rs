use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::trace;

/// Quiet period before a modified file is re-read
pub const DEBOUNCE_DELAY: Duration = Duration::from_secs(1);

/// Minimum interval between two policy evaluations of a handler
pub const THROTTLE_PERIOD: Duration = Duration::from_secs(5);

/// Lets one caller through per period, measured on the monotonic clock.
/// The first call always passes.
pub struct Throttle {
    period: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_run: Mutex::new(None),
        }
    }

    /// True when the caller may run now; records the run
    pub fn try_acquire(&self) -> bool {
        let mut last_run = self.last_run.lock();
        let now = Instant::now();
        match *last_run {
            Some(previous) if now.duration_since(previous) < self.period => false,
            _ => {
                *last_run = Some(now);
                true
            }
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(THROTTLE_PERIOD)
    }
}

/// Per-key cancel-and-replace timers.
///
/// Arming a key cancels the timer already pending for it. A timer that has
/// started running its task is no longer pending and is never interrupted.
pub struct Debouncer {
    delay: Duration,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<String, (u64, AbortHandle)>>>,
    tracker: TaskTracker,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `task` after the quiet period unless `key` is armed again first
    pub fn arm<F, Fut>(&self, key: &str, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        let pending = Arc::clone(&self.pending);
        let owned_key = key.to_string();

        // Held across spawn so the timer cannot look itself up before it is
        // registered
        let mut timers = self.pending.lock();
        if let Some((_, previous)) = timers.remove(key) {
            previous.abort();
            trace!(key, "Debounce timer replaced");
        }

        let handle = self.tracker.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = pending.lock();
                match timers.get(&owned_key) {
                    Some((current, _)) if *current == id => {
                        timers.remove(&owned_key);
                    }
                    _ => return,
                }
            }
            task().await;
        });
        timers.insert(key.to_string(), (id, handle.abort_handle()));
    }

    /// Number of timers waiting to fire
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait until every armed timer has fired and finished its task
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_DELAY)
    }
}
