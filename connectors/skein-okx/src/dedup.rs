//! Time-bounded deduplication of streamed events.
//!
//! Two sets cooperate: `inflight` tracks keys claimed for processing but not
//! yet finished, `processed` tracks keys whose effects have landed. A key is
//! visible in at most one of the two; memory stays bounded by the events
//! that arrive within the TTL windows.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use skein_core::DedupKey;

/// TTL for keys whose processing completed (positions).
pub const PROCESSED_POSITION_TTL: Duration = Duration::from_secs(30 * 60);
/// TTL for keys whose processing completed (orders).
pub const PROCESSED_ORDER_TTL: Duration = Duration::from_secs(60 * 60);
/// TTL for claimed-but-unfinished keys.
pub const INFLIGHT_TTL: Duration = Duration::from_secs(5 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Concurrent registry of seen event keys.
pub struct DedupRegistry {
    inflight: DashMap<DedupKey, Instant>,
    processed: DashMap<DedupKey, Instant>,
    inflight_ttl: Duration,
    processed_ttl: Duration,
    last_sweep: Mutex<Instant>,
}

impl DedupRegistry {
    /// Registry tuned for position events.
    #[must_use]
    pub fn for_positions() -> Self {
        Self::new(INFLIGHT_TTL, PROCESSED_POSITION_TTL)
    }

    /// Registry tuned for order events.
    #[must_use]
    pub fn for_orders() -> Self {
        Self::new(INFLIGHT_TTL, PROCESSED_ORDER_TTL)
    }

    #[must_use]
    pub fn new(inflight_ttl: Duration, processed_ttl: Duration) -> Self {
        Self {
            inflight: DashMap::new(),
            processed: DashMap::new(),
            inflight_ttl,
            processed_ttl,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Atomically claim a key for processing. Returns false when the key is
    /// already claimed or already processed.
    pub fn try_claim(&self, key: DedupKey) -> bool {
        self.maybe_sweep();
        if self.processed.contains_key(&key) {
            return false;
        }
        match self.inflight.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    /// Move a key from the in-flight set to the processed set.
    pub fn mark_processed(&self, key: &DedupKey) {
        self.processed.insert(key.clone(), Instant::now());
        self.inflight.remove(key);
    }

    #[must_use]
    pub fn is_processed(&self, key: &DedupKey) -> bool {
        self.processed.contains_key(key)
    }

    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    /// Expire aged entries; runs at most once per second regardless of how
    /// often producers call in.
    fn maybe_sweep(&self) {
        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() < SWEEP_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        let now = Instant::now();
        let inflight_ttl = self.inflight_ttl;
        let processed_ttl = self.processed_ttl;
        self.inflight
            .retain(|_, inserted| now.duration_since(*inserted) < inflight_ttl);
        self.processed
            .retain(|_, inserted| now.duration_since(*inserted) < processed_ttl);
    }
}
