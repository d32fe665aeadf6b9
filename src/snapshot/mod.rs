//! Snapshot backstop
//!
//! One cached still image per session, refreshed on its own cadence and shared
//! read-only by every consumer.

pub mod source;

pub use source::{HttpSnapshotSource, HttpSnapshotSourceFactory, SnapshotSource, SnapshotSourceFactory};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Cached still image
#[derive(Debug)]
pub struct Snapshot {
    data: Bytes,
    timestamp: DateTime<Utc>,
    captured: Instant,
    hash: OnceLock<u64>,
}

impl Snapshot {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            timestamp: Utc::now(),
            captured: Instant::now(),
            hash: OnceLock::new(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Time since capture
    pub fn age(&self) -> Duration {
        self.captured.elapsed()
    }

    /// xxh64 content hash (computed once)
    pub fn hash(&self) -> u64 {
        *self
            .hash
            .get_or_init(|| xxhash_rust::xxh64::xxh64(self.data.as_ref(), 0))
    }
}

/// Resets the in-flight flag when the fetch ends, however it ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fetches snapshots with at most one request in flight
pub struct SnapshotPoller {
    source: Option<Arc<dyn SnapshotSource>>,
    cache: ArcSwapOption<Snapshot>,
    in_flight: AtomicBool,
    fetch_timeout: Duration,
    min_age: Duration,
    throttler: LogThrottler,
}

impl SnapshotPoller {
    pub fn new(
        source: Option<Arc<dyn SnapshotSource>>,
        fetch_timeout: Duration,
        min_age: Duration,
    ) -> Self {
        Self {
            source,
            cache: ArcSwapOption::empty(),
            in_flight: AtomicBool::new(false),
            fetch_timeout,
            min_age,
            throttler: LogThrottler::with_secs(30),
        }
    }

    /// Latest snapshot
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.cache.load_full()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Fetch a new snapshot unless one is in flight or the cached one is
    /// younger than the minimum age
    ///
    /// Returns the new snapshot when the cache was replaced. Failures keep the
    /// cached snapshot and are only logged.
    pub async fn refresh(&self) -> Option<Arc<Snapshot>> {
        let source = self.source.as_ref()?;

        if let Some(cached) = self.cache.load().as_ref() {
            if cached.age() < self.min_age {
                return None;
            }
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            return None;
        }
        let _guard = InFlightGuard(&self.in_flight);

        match tokio::time::timeout(self.fetch_timeout, source.fetch()).await {
            Ok(Ok(data)) => {
                self.throttler.clear("snapshot");
                let snapshot = Arc::new(Snapshot::new(data));
                if let Some(previous) = self.cache.swap(Some(snapshot.clone())) {
                    debug!(
                        "Image updated after {}ms",
                        previous.age().saturating_sub(snapshot.age()).as_millis()
                    );
                }
                Some(snapshot)
            }
            Ok(Err(e)) => {
                warn_throttled!(self.throttler, "snapshot", "Fetch image error: {}", e);
                None
            }
            Err(_) => {
                warn_throttled!(self.throttler, "snapshot", "Fetch image timeout");
                None
            }
        }
    }
}
