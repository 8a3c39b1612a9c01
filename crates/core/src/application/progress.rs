// Progress Registry
//
// Concurrent map of clip id -> progress value, read by pollers and written by
// workers. Values: -1 queued, 0..=100 percent, -2 failed.

use crate::application::worker::ShutdownToken;
use crate::domain::{
    percent_from_fraction, validate_progress, ClipId, PROGRESS_COMPLETE, PROGRESS_FAILED,
    PROGRESS_QUEUED,
};
use crate::error::Result;
use crate::port::{ProgressFn, TimeProvider};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Retention of failed (-2) entries
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// How long a failed entry survives after its first read
    pub failed_grace_ms: i64,
    /// Upper bound for failed entries nobody ever reads
    pub failed_max_retention_ms: i64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            failed_grace_ms: 5 * 60 * 1000,
            failed_max_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProgressEntry {
    value: i32,
    /// Attempt number that owns the entry; writers from other attempts are fenced out
    attempt: i32,
    updated_at: i64,
    /// First time a failed entry was returned by `get`
    observed_at: Option<i64>,
}

pub struct ProgressRegistry {
    entries: DashMap<ClipId, ProgressEntry>,
    time_provider: Arc<dyn TimeProvider>,
    config: ProgressConfig,
}

impl ProgressRegistry {
    pub fn new(time_provider: Arc<dyn TimeProvider>, config: ProgressConfig) -> Self {
        Self {
            entries: DashMap::new(),
            time_provider,
            config,
        }
    }

    /// Set a clip's progress value.
    ///
    /// `-1` and `-2` always overwrite. Percentages never move an entry
    /// backwards and are ignored once the entry is failed.
    ///
    /// Returns whether the value was applied.
    pub fn set(&self, clip_id: &str, value: i32) -> Result<bool> {
        validate_progress(value)?;
        let now = self.time_provider.now_millis();

        let mut entry = self
            .entries
            .entry(clip_id.to_string())
            .or_insert(ProgressEntry {
                value: PROGRESS_QUEUED,
                attempt: 1,
                updated_at: now,
                observed_at: None,
            });

        if value >= 0 && (entry.value == PROGRESS_FAILED || value < entry.value) {
            return Ok(false);
        }
        entry.value = value;
        entry.updated_at = now;
        entry.observed_at = None;
        Ok(true)
    }

    /// Snapshot the requested ids. Unknown ids are simply absent.
    pub fn get(&self, clip_ids: &[ClipId]) -> HashMap<ClipId, i32> {
        let now = self.time_provider.now_millis();
        let mut snapshot = HashMap::with_capacity(clip_ids.len());

        for clip_id in clip_ids {
            let (value, first_sighting) = match self.entries.get(clip_id) {
                Some(entry) => (
                    entry.value,
                    entry.value == PROGRESS_FAILED && entry.observed_at.is_none(),
                ),
                None => continue,
            };
            if first_sighting {
                self.mark_observed(clip_id, now);
            }
            snapshot.insert(clip_id.clone(), value);
        }

        snapshot
    }

    /// Start the grace period of a failed entry; the read guard must be released
    fn mark_observed(&self, clip_id: &str, now: i64) {
        if let Some(mut entry) = self.entries.get_mut(clip_id) {
            if entry.value == PROGRESS_FAILED && entry.observed_at.is_none() {
                entry.observed_at = Some(now);
            }
        }
    }

    /// Read a single value without marking failed entries as observed
    pub fn peek(&self, clip_id: &str) -> Option<i32> {
        self.entries.get(clip_id).map(|entry| entry.value)
    }

    /// Remove a clip's entry
    pub fn clear(&self, clip_id: &str) -> bool {
        self.entries.remove(clip_id).is_some()
    }

    /// Reset to -1 for the given attempt (enqueue or requeue)
    pub fn mark_queued(&self, clip_id: &str, attempt: i32) {
        self.entries.insert(
            clip_id.to_string(),
            ProgressEntry {
                value: PROGRESS_QUEUED,
                attempt,
                updated_at: self.time_provider.now_millis(),
                observed_at: None,
            },
        );
    }

    /// Seed -1 unless the clip already has an entry. Returns whether it inserted.
    pub fn mark_queued_if_absent(&self, clip_id: &str, attempt: i32) -> bool {
        let now = self.time_provider.now_millis();
        let mut inserted = false;
        self.entries.entry(clip_id.to_string()).or_insert_with(|| {
            inserted = true;
            ProgressEntry {
                value: PROGRESS_QUEUED,
                attempt,
                updated_at: now,
                observed_at: None,
            }
        });
        inserted
    }

    /// Record a permanent failure
    pub fn mark_failed(&self, clip_id: &str) {
        let now = self.time_provider.now_millis();
        self.entries
            .entry(clip_id.to_string())
            .and_modify(|entry| {
                entry.value = PROGRESS_FAILED;
                entry.updated_at = now;
                entry.observed_at = None;
            })
            .or_insert(ProgressEntry {
                value: PROGRESS_FAILED,
                attempt: 0,
                updated_at: now,
                observed_at: None,
            });
    }

    /// Writer handle bound to one attempt of one clip
    pub fn writer(self: &Arc<Self>, clip_id: impl Into<ClipId>, attempt: i32) -> ProgressWriter {
        ProgressWriter {
            registry: Arc::clone(self),
            clip_id: clip_id.into(),
            attempt,
            last_sent: AtomicI32::new(PROGRESS_QUEUED),
        }
    }

    /// Attempt-fenced, monotonic write. Never creates an entry.
    fn publish_fenced(&self, clip_id: &str, attempt: i32, value: i32) -> bool {
        let Some(mut entry) = self.entries.get_mut(clip_id) else {
            return false;
        };
        if entry.attempt != attempt || entry.value == PROGRESS_FAILED || value <= entry.value {
            return false;
        }
        entry.value = value;
        entry.updated_at = self.time_provider.now_millis();
        true
    }

    /// Drop failed entries that were read more than `failed_grace_ms` ago, or
    /// that are older than `failed_max_retention_ms` regardless.
    pub fn sweep(&self) -> usize {
        let now = self.time_provider.now_millis();
        let grace = self.config.failed_grace_ms;
        let max_retention = self.config.failed_max_retention_ms;
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            if entry.value != PROGRESS_FAILED {
                return true;
            }
            let observed_expired = entry
                .observed_at
                .is_some_and(|observed| now - observed >= grace);
            let retention_expired = now - entry.updated_at >= max_retention;
            if observed_expired || retention_expired {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            debug!(removed = removed, "Swept failed progress entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodic sweep loop (background task)
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownToken) {
        info!(interval_ms = interval.as_millis() as u64, "Progress sweeper started");
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep();
                }
                _ = shutdown.wait() => break,
            }
            if shutdown.is_shutdown() {
                break;
            }
        }
        info!("Progress sweeper stopped");
    }
}

/// Progress writer for one encode attempt.
///
/// Publishes only when the whole percent increases, so the registry sees at
/// most one write per percentage point.
pub struct ProgressWriter {
    registry: Arc<ProgressRegistry>,
    clip_id: ClipId,
    attempt: i32,
    last_sent: AtomicI32,
}

impl ProgressWriter {
    /// Announce that encoding started (0%)
    pub fn start(&self) {
        self.send(0);
    }

    /// Report an engine fraction in `0.0..=1.0`
    pub fn report(&self, fraction: f64) {
        self.send(percent_from_fraction(fraction));
    }

    /// Announce that artifacts are published (100%)
    pub fn complete(&self) {
        self.send(PROGRESS_COMPLETE);
    }

    fn send(&self, percent: i32) {
        let previous = self.last_sent.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            self.registry
                .publish_fenced(&self.clip_id, self.attempt, percent);
        }
    }

    pub fn into_callback(self: Arc<Self>) -> ProgressFn {
        Arc::new(move |fraction| self.report(fraction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::time_provider::mocks::ManualTimeProvider;

    fn registry() -> (Arc<ProgressRegistry>, Arc<ManualTimeProvider>) {
        let clock = Arc::new(ManualTimeProvider::new(1_000_000));
        let registry = Arc::new(ProgressRegistry::new(
            clock.clone(),
            ProgressConfig {
                failed_grace_ms: 1_000,
                failed_max_retention_ms: 60_000,
            },
        ));
        (registry, clock)
    }

    fn ids(values: &[&str]) -> Vec<ClipId> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_only_returns_tracked_ids() {
        let (registry, _) = registry();
        registry.mark_queued("a", 1);

        let snapshot = registry.get(&ids(&["a", "never-enqueued"]));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["a"], PROGRESS_QUEUED);
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let (registry, _) = registry();
        assert!(registry.set("a", 101).is_err());
        assert!(registry.set("a", -3).is_err());
        assert!(registry.peek("a").is_none());
    }

    #[test]
    fn test_set_never_moves_percent_backwards() {
        let (registry, _) = registry();
        assert!(registry.set("a", 40).unwrap());
        assert!(!registry.set("a", 30).unwrap());
        assert_eq!(registry.peek("a"), Some(40));

        // Requeue resets
        assert!(registry.set("a", PROGRESS_QUEUED).unwrap());
        assert!(registry.set("a", 5).unwrap());
    }

    #[test]
    fn test_failed_entry_ignores_late_percent() {
        let (registry, _) = registry();
        registry.mark_queued("a", 1);
        registry.mark_failed("a");
        assert!(!registry.set("a", 50).unwrap());
        assert_eq!(registry.peek("a"), Some(PROGRESS_FAILED));
    }

    #[test]
    fn test_writer_is_monotonic_and_throttled() {
        let (registry, _) = registry();
        registry.mark_queued("a", 1);
        let writer = registry.writer("a", 1);

        writer.start();
        writer.report(0.105);
        writer.report(0.109); // same whole percent
        writer.report(0.05); // backwards
        assert_eq!(registry.peek("a"), Some(10));

        writer.report(1.0);
        assert_eq!(registry.peek("a"), Some(99));

        writer.complete();
        assert_eq!(registry.peek("a"), Some(PROGRESS_COMPLETE));
    }

    #[test]
    fn test_stale_attempt_writer_is_fenced() {
        let (registry, _) = registry();
        registry.mark_queued("a", 1);
        let stale = registry.writer("a", 1);
        stale.report(0.5);

        registry.mark_queued("a", 2);
        stale.report(0.9);
        assert_eq!(registry.peek("a"), Some(PROGRESS_QUEUED));

        let current = registry.writer("a", 2);
        current.report(0.2);
        assert_eq!(registry.peek("a"), Some(20));
    }

    #[test]
    fn test_writer_does_not_resurrect_cleared_entry() {
        let (registry, _) = registry();
        registry.mark_queued("a", 1);
        let writer = registry.writer("a", 1);
        registry.clear("a");

        writer.report(0.5);
        assert!(registry.peek("a").is_none());
    }

    #[test]
    fn test_failed_entry_survives_until_observed_plus_grace() {
        let (registry, clock) = registry();
        registry.mark_failed("a");

        clock.advance(5_000);
        assert_eq!(registry.sweep(), 0, "unobserved failure must be kept");

        assert_eq!(registry.get(&ids(&["a"]))["a"], PROGRESS_FAILED);
        clock.advance(500);
        assert_eq!(registry.sweep(), 0);

        clock.advance(600);
        assert_eq!(registry.sweep(), 1);
        assert!(registry.get(&ids(&["a"])).is_empty());
    }

    #[test]
    fn test_grace_counts_from_first_read() {
        let (registry, clock) = registry();
        registry.mark_failed("a");

        registry.get(&ids(&["a"]));
        clock.advance(800);
        // Later polls do not restart the grace period
        assert_eq!(registry.get(&ids(&["a"]))["a"], PROGRESS_FAILED);
        clock.advance(300);
        assert_eq!(registry.sweep(), 1);
    }

    #[test]
    fn test_poll_proceeds_while_entry_is_read() {
        let (registry, _) = registry();
        registry.set("a", 40).unwrap();
        let held = registry.entries.get("a").unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let poller = Arc::clone(&registry);
        std::thread::spawn(move || {
            let _ = tx.send(poller.get(&ids(&["a"])));
        });
        let snapshot = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("poll must not wait for other readers");
        assert_eq!(snapshot["a"], 40);
        drop(held);
    }

    #[test]
    fn test_unobserved_failure_dropped_after_max_retention() {
        let (registry, clock) = registry();
        registry.mark_failed("a");
        registry.mark_queued("b", 1);

        clock.advance(60_000);
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.peek("b"), Some(PROGRESS_QUEUED));
    }

    #[test]
    fn test_mark_queued_if_absent() {
        let (registry, _) = registry();
        registry.set("a", 30).unwrap();
        assert!(!registry.mark_queued_if_absent("a", 1));
        assert_eq!(registry.peek("a"), Some(30));
        assert!(registry.mark_queued_if_absent("b", 1));
        assert_eq!(registry.peek("b"), Some(PROGRESS_QUEUED));
    }

    #[tokio::test]
    async fn test_concurrent_readers_and_writer() {
        let (registry, _) = registry();
        registry.mark_queued("a", 1);
        let writer = Arc::new(registry.writer("a", 1));

        let mut readers = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            readers.push(tokio::spawn(async move {
                let mut last = PROGRESS_QUEUED;
                for _ in 0..200 {
                    if let Some(value) = registry.get(&["a".to_string()]).get("a").copied() {
                        assert!(value >= last, "progress went backwards: {} -> {}", last, value);
                        last = value;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        for step in 0..=100 {
            writer.report(step as f64 / 100.0);
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }
}
