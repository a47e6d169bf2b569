// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - lookups, sessions, handles, slots
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters for everything the engine does to the portal. Lock-free,
// cheap to bump from any worker, and snapshotted to JSON for GET /metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// The metrics snapshot - what gets serialized to JSON
#[derive(Debug, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub lookups_attempted: u64,
    pub lookups_succeeded: u64,
    pub lookups_failed: u64,
    pub lookups_skipped: u64,
    pub sessions_established: u64,
    pub sessions_expired: u64,
    pub challenges_issued: u64,
    pub handles_created: u64,
    pub handles_recycled: u64,
    pub handles_discarded: u64,
    pub slot_saturations: u64,
    pub lock_reclaims: u64,
    pub layout_cache_hits: u64,
    pub layout_downloads: u64,
    pub batches_run: u64,
    pub updates_detected: u64,
    pub redis_publish_failures: u64,
    pub uptime_seconds: u64,
    pub lookups_per_minute: f64,
    pub status: String,
}

/// Thread-safe atomic metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    lookups_attempted: AtomicU64,
    lookups_succeeded: AtomicU64,
    lookups_failed: AtomicU64,
    lookups_skipped: AtomicU64,
    sessions_established: AtomicU64,
    sessions_expired: AtomicU64,
    challenges_issued: AtomicU64,
    handles_created: AtomicU64,
    handles_recycled: AtomicU64,
    handles_discarded: AtomicU64,
    slot_saturations: AtomicU64,
    lock_reclaims: AtomicU64,
    layout_cache_hits: AtomicU64,
    layout_downloads: AtomicU64,
    batches_run: AtomicU64,
    updates_detected: AtomicU64,
    redis_publish_failures: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            lookups_attempted: AtomicU64::new(0),
            lookups_succeeded: AtomicU64::new(0),
            lookups_failed: AtomicU64::new(0),
            lookups_skipped: AtomicU64::new(0),
            sessions_established: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            challenges_issued: AtomicU64::new(0),
            handles_created: AtomicU64::new(0),
            handles_recycled: AtomicU64::new(0),
            handles_discarded: AtomicU64::new(0),
            slot_saturations: AtomicU64::new(0),
            lock_reclaims: AtomicU64::new(0),
            layout_cache_hits: AtomicU64::new(0),
            layout_downloads: AtomicU64::new(0),
            batches_run: AtomicU64::new(0),
            updates_detected: AtomicU64::new(0),
            redis_publish_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn increment_lookups_attempted(&self) {
        self.lookups_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lookups_succeeded(&self) {
        self.lookups_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lookups_failed(&self) {
        self.lookups_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lookups_skipped(&self) {
        self.lookups_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sessions_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sessions_expired(&self) {
        self.sessions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_challenges_issued(&self) {
        self.challenges_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handles_created(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handles_recycled(&self) {
        self.handles_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handles_discarded(&self) {
        self.handles_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_slot_saturations(&self) {
        self.slot_saturations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lock_reclaims(&self, count: u64) {
        self.lock_reclaims.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_layout_cache_hits(&self) {
        self.layout_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_layout_downloads(&self) {
        self.layout_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batches_run(&self) {
        self.batches_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_updates_detected(&self, count: u64) {
        self.updates_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_redis_failures(&self) {
        self.redis_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all metrics (lock-free reads)
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let attempted = self.lookups_attempted.load(Ordering::Relaxed);
        let lookups_per_minute = if uptime > 0 {
            (attempted as f64 / uptime as f64) * 60.0
        } else {
            0.0
        };

        MetricsSnapshot {
            lookups_attempted: attempted,
            lookups_succeeded: self.lookups_succeeded.load(Ordering::Relaxed),
            lookups_failed: self.lookups_failed.load(Ordering::Relaxed),
            lookups_skipped: self.lookups_skipped.load(Ordering::Relaxed),
            sessions_established: self.sessions_established.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            challenges_issued: self.challenges_issued.load(Ordering::Relaxed),
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_recycled: self.handles_recycled.load(Ordering::Relaxed),
            handles_discarded: self.handles_discarded.load(Ordering::Relaxed),
            slot_saturations: self.slot_saturations.load(Ordering::Relaxed),
            lock_reclaims: self.lock_reclaims.load(Ordering::Relaxed),
            layout_cache_hits: self.layout_cache_hits.load(Ordering::Relaxed),
            layout_downloads: self.layout_downloads.load(Ordering::Relaxed),
            batches_run: self.batches_run.load(Ordering::Relaxed),
            updates_detected: self.updates_detected.load(Ordering::Relaxed),
            redis_publish_failures: self.redis_publish_failures.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            lookups_per_minute,
            status: "operational".to_string(),
        }
    }
}
