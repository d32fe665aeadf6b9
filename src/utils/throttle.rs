//! Log throttling
//!
//! Repeated identical failures (an unreachable snapshot URL, a signaling
//! server that keeps refusing) are logged once per interval, with a count of
//! how many were swallowed in between.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    last_logged: Instant,
    suppressed: u32,
}

/// Rate limiter for log lines keyed by failure kind
///
/// Uses tokio's clock so paused-time tests see the same cadence as the
/// session timers.
///
/// # Example
///
/// ```rust
/// use camview::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.check("snapshot").is_some());
/// assert!(throttler.check("snapshot").is_none());
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when the line for `key` should be logged now,
    /// where `suppressed` is the number of lines dropped since the last one.
    pub fn check(&self, key: &str) -> Option<u32> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget `key` once the failure recovered, so the next one logs at once
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
///
/// ```rust
/// use camview::utils::LogThrottler;
/// use camview::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "fetch", "Snapshot fetch failed: {}", "timeout");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}
