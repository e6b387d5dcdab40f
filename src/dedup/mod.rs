//! Replay suppression for the live feed.
//!
//! Two pieces:
//!
//! 1. [`fingerprint`] turns a decoded payload into a stable key.
//! 2. [`DedupCache`] remembers when each key was last admitted and answers
//!    "was this seen within the window?".
//!
//! The cache is meant to outlive any single [`LiveFeed`](crate::feed::LiveFeed).
//! Build one per process, wrap it in an `Arc`, and hand it to every feed so a
//! reconnect that coincides with a feed rebuild still catches the server's
//! replay of recent history.

pub mod fingerprint;

pub use fingerprint::{canonical_json, fingerprint, fingerprint_frame};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Window applied to frames received from the stream.
pub const DEFAULT_STREAM_WINDOW: Duration = Duration::from_millis(5000);

/// Window applied to locally generated status lines.
pub const DEFAULT_SYSTEM_WINDOW: Duration = Duration::from_millis(2000);

/// Entry ceiling before an eviction pass.
pub const DEFAULT_CAPACITY: usize = 700;

/// Share of entries removed by one eviction pass (oldest first).
pub const DEFAULT_EVICT_FRACTION: f64 = 0.4;

#[derive(Debug, Clone, Copy)]
struct Seen {
    last_seen_ms: i64,
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Seen>,
    next_seq: u64,
}

/// Bounded, time-windowed fingerprint cache.
///
/// Best effort: a poisoned lock degrades to admitting everything, and a
/// process restart forgets all history. Times are milliseconds on a
/// monotonic clock that starts when the cache is built.
#[derive(Debug)]
pub struct DedupCache {
    entries: Mutex<Entries>,
    origin: Instant,
    capacity: usize,
    evict_fraction: f64,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DedupCache {
    /// Create a cache holding at most `capacity` fingerprints.
    pub fn new(capacity: usize) -> Self {
        Self::with_eviction(capacity, DEFAULT_EVICT_FRACTION)
    }

    /// Create a cache with a custom eviction share (clamped to `0.0..=1.0`).
    pub fn with_eviction(capacity: usize, evict_fraction: f64) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            origin: Instant::now(),
            capacity: capacity.max(1),
            evict_fraction: evict_fraction.clamp(0.0, 1.0),
        }
    }

    /// Create a process-wide cache ready to be injected into feeds.
    pub fn shared(capacity: usize, evict_fraction: f64) -> Arc<Self> {
        Arc::new(Self::with_eviction(capacity, evict_fraction))
    }

    /// Decide whether `fingerprint` should be suppressed, using the cache clock.
    pub fn should_ignore(&self, fingerprint: &str, window: Duration) -> bool {
        self.should_ignore_at(fingerprint, window, self.now_ms())
    }

    /// Decide whether `fingerprint` should be suppressed at `now_ms`.
    ///
    /// Returns `true` if the fingerprint was admitted less than `window` ago.
    /// A suppressed hit does not extend the window. Otherwise the fingerprint
    /// is recorded at `now_ms` and `false` is returned. A `now_ms` earlier
    /// than the stored admission counts as outside the window.
    pub fn should_ignore_at(&self, fingerprint: &str, window: Duration, now_ms: i64) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };

        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        if let Some(seen) = entries.map.get(fingerprint)
            && (0..window_ms).contains(&now_ms.saturating_sub(seen.last_seen_ms))
        {
            tracing::debug!(fingerprint, "Suppressed duplicate payload");
            return true;
        }

        self.insert(&mut entries, fingerprint, now_ms);
        false
    }

    /// Mark `fingerprint` as seen now without asking for a decision.
    pub fn record(&self, fingerprint: &str) {
        self.record_at(fingerprint, self.now_ms());
    }

    /// Mark `fingerprint` as seen at `now_ms`.
    pub fn record_at(&self, fingerprint: &str, now_ms: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            self.insert(&mut entries, fingerprint, now_ms);
        }
    }

    /// Whether `fingerprint` is currently held (regardless of age).
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.map.contains_key(fingerprint))
            .unwrap_or(false)
    }

    /// Number of fingerprints held.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured ceiling.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget everything.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.map.clear();
        }
    }

    /// Milliseconds since the cache was built.
    pub fn now_ms(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn insert(&self, entries: &mut Entries, fingerprint: &str, now_ms: i64) {
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.map.insert(
            fingerprint.to_string(),
            Seen {
                last_seen_ms: now_ms,
                seq,
            },
        );

        if entries.map.len() > self.capacity {
            self.evict(entries);
        }
    }

    /// Drop the oldest share of entries in one pass so eviction cost is
    /// amortized over many inserts.
    fn evict(&self, entries: &mut Entries) {
        let len = entries.map.len();
        let by_share = (len as f64 * self.evict_fraction).ceil() as usize;
        let remove = by_share.max(len - self.capacity);

        let mut by_age: Vec<(i64, u64, String)> = entries
            .map
            .iter()
            .map(|(key, seen)| (seen.last_seen_ms, seen.seq, key.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, _, key) in by_age.into_iter().take(remove) {
            entries.map.remove(&key);
        }

        tracing::debug!(
            removed = remove,
            remaining = entries.map.len(),
            "Evicted oldest dedup fingerprints"
        );
    }
}
