//! In-memory bucket state owned by one [`PolicyEngine`](crate::policy::PolicyEngine).
//!
//! A bucket moves between `Open`, `Saturated(queued)` and `Saturated(full)`;
//! releases always move it back toward `Open`. The store itself is not
//! synchronized: the engine holds it behind one mutex so every
//! check-then-mutate sequence is atomic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    length: Duration,
    count_in_window: u32,
}

impl RateWindow {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) < self.length
    }
}

#[derive(Debug, Default)]
struct Bucket {
    window: Option<RateWindow>,
    in_flight: u32,
    queued: u32,
    last_used: u64,
}

impl Bucket {
    /// Idle buckets hold no leases and no live rate window, so dropping them
    /// loses nothing a later admission check depends on.
    fn is_evictable(&self, now: Instant) -> bool {
        self.in_flight == 0
            && self.queued == 0
            && !self.window.is_some_and(|window| window.is_live(now))
    }
}

/// Admission state of one bucket as seen by a saturated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Open,
    Queued { queued: u32 },
    Full { queued: u32 },
}

#[derive(Debug)]
pub(crate) struct BucketStore {
    buckets: HashMap<String, Bucket>,
    tick: u64,
    max_buckets: usize,
}

impl BucketStore {
    pub(crate) fn new(max_buckets: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            tick: 0,
            max_buckets: max_buckets.max(1),
        }
    }

    fn touch(&mut self, key: &str, now: Instant) -> &mut Bucket {
        self.tick = self.tick.wrapping_add(1);
        if !self.buckets.contains_key(key) {
            self.evict_if_full(now);
        }
        let tick = self.tick;
        let bucket = self.buckets.entry(key.to_string()).or_default();
        bucket.last_used = tick;
        bucket
    }

    /// Drops the least recently used idle bucket once the store is at capacity.
    /// Buckets with in-flight or queued requests, or a rate window still in
    /// progress, are never evicted; the store grows past capacity instead.
    fn evict_if_full(&mut self, now: Instant) {
        if self.buckets.len() < self.max_buckets {
            return;
        }
        let victim = self
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.is_evictable(now))
            .min_by_key(|(_, bucket)| bucket.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.buckets.remove(&key);
        }
    }

    /// Counts one request against a fixed window, resetting the window lazily.
    pub(crate) fn try_acquire_rate(
        &mut self,
        key: &str,
        max_requests: u32,
        window: Duration,
        now: Instant,
    ) -> bool {
        let bucket = self.touch(key, now);
        let window_state = bucket.window.get_or_insert(RateWindow {
            window_start: now,
            length: window,
            count_in_window: 0,
        });

        window_state.length = window;
        if !window_state.is_live(now) {
            window_state.window_start = now;
            window_state.count_in_window = 0;
        }

        if window_state.count_in_window >= max_requests {
            return false;
        }
        window_state.count_in_window += 1;
        true
    }

    pub(crate) fn try_acquire_slot(
        &mut self,
        key: &str,
        max_concurrent: u32,
        now: Instant,
    ) -> bool {
        let bucket = self.touch(key, now);
        if bucket.in_flight >= max_concurrent {
            return false;
        }
        bucket.in_flight += 1;
        true
    }

    pub(crate) fn try_enqueue(
        &mut self,
        key: &str,
        max_queue_size: u32,
        now: Instant,
    ) -> BucketState {
        let bucket = self.touch(key, now);
        if bucket.queued >= max_queue_size {
            return BucketState::Full {
                queued: bucket.queued,
            };
        }
        bucket.queued += 1;
        BucketState::Queued {
            queued: bucket.queued,
        }
    }

    pub(crate) fn release_slot(&mut self, key: &str) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.in_flight = bucket.in_flight.saturating_sub(1);
        }
    }

    pub(crate) fn release_queued(&mut self, key: &str) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.queued = bucket.queued.saturating_sub(1);
        }
    }

    pub(crate) fn in_flight(&self, key: &str) -> u32 {
        self.buckets.get(key).map_or(0, |bucket| bucket.in_flight)
    }

    pub(crate) fn queued(&self, key: &str) -> u32 {
        self.buckets.get(key).map_or(0, |bucket| bucket.queued)
    }

    pub(crate) fn window_count(&self, key: &str) -> u32 {
        self.buckets
            .get(key)
            .and_then(|bucket| bucket.window)
            .map_or(0, |window| window.count_in_window)
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_window_resets_after_elapsed_window() {
        let mut store = BucketStore::new(16);
        let start = Instant::now();
        let window = Duration::from_millis(100);

        assert!(store.try_acquire_rate("k", 2, window, start));
        assert!(store.try_acquire_rate("k", 2, window, start));
        assert!(!store.try_acquire_rate("k", 2, window, start + Duration::from_millis(99)));
        assert!(store.try_acquire_rate("k", 2, window, start + Duration::from_millis(100)));
        assert_eq!(store.window_count("k"), 1);
    }

    #[test]
    fn zero_capacity_is_always_saturated() {
        let mut store = BucketStore::new(16);
        let now = Instant::now();

        assert!(!store.try_acquire_rate("r", 0, Duration::from_secs(1), now));
        assert!(!store.try_acquire_slot("c", 0, now));
        assert_eq!(store.try_enqueue("q", 0, now), BucketState::Full { queued: 0 });
    }

    #[test]
    fn releases_never_go_negative() {
        let mut store = BucketStore::new(16);
        assert!(store.try_acquire_slot("k", 1, Instant::now()));
        store.release_slot("k");
        store.release_slot("k");
        store.release_queued("k");

        assert_eq!(store.in_flight("k"), 0);
        assert_eq!(store.queued("k"), 0);
    }

    #[test]
    fn queue_fills_then_reports_full() {
        let mut store = BucketStore::new(16);
        let now = Instant::now();

        assert_eq!(store.try_enqueue("k", 2, now), BucketState::Queued { queued: 1 });
        assert_eq!(store.try_enqueue("k", 2, now), BucketState::Queued { queued: 2 });
        assert_eq!(store.try_enqueue("k", 2, now), BucketState::Full { queued: 2 });
        store.release_queued("k");
        assert_eq!(store.try_enqueue("k", 2, now), BucketState::Queued { queued: 2 });
    }

    #[test]
    fn eviction_prefers_least_recently_used_idle_bucket() {
        let mut store = BucketStore::new(2);
        let start = Instant::now();
        let window = Duration::from_millis(100);
        assert!(store.try_acquire_slot("busy", 5, start));
        assert!(store.try_acquire_rate("idle", 5, window, start));

        let later = start + window;
        assert!(store.try_acquire_slot("fresh", 5, later));

        assert_eq!(store.len(), 2);
        assert_eq!(store.in_flight("busy"), 1);
        assert_eq!(store.window_count("idle"), 0);
        assert_eq!(store.in_flight("fresh"), 1);
    }

    #[test]
    fn live_rate_window_survives_capacity_pressure() {
        let mut store = BucketStore::new(2);
        let start = Instant::now();
        let window = Duration::from_secs(60);

        assert!(store.try_acquire_rate("tenant:a", 1, window, start));
        assert!(store.try_acquire_rate("tenant:b", 1, window, start));
        assert!(store.try_acquire_rate("tenant:c", 1, window, start));

        assert_eq!(store.len(), 3);
        assert!(!store.try_acquire_rate("tenant:a", 1, window, start + Duration::from_secs(1)));
        assert_eq!(store.window_count("tenant:a"), 1);
    }

    #[test]
    fn expired_rate_window_makes_bucket_evictable_again() {
        let mut store = BucketStore::new(1);
        let start = Instant::now();
        let window = Duration::from_millis(50);

        assert!(store.try_acquire_rate("old", 1, window, start));
        assert!(store.try_acquire_rate("new", 1, window, start + window));

        assert_eq!(store.len(), 1);
        assert_eq!(store.window_count("old"), 0);
    }

    #[test]
    fn store_grows_past_capacity_when_nothing_is_idle() {
        let mut store = BucketStore::new(1);
        let now = Instant::now();
        assert!(store.try_acquire_slot("a", 1, now));
        assert!(store.try_acquire_slot("b", 1, now));

        assert_eq!(store.len(), 2);
    }
}
