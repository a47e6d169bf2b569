// =============================================================================
// lock.rs - DISTRIBUTED LOCK & RATE LIMITER
// =============================================================================
//
// The only cross-process shared mutable state in the engine:
//
//   download_locks    one row per external document; `downloading` while a
//                     worker fetches it, `cached` once the payload is stored
//   concurrency_slot  a single counter bounding simultaneous portal calls
//
// Every mutation is ONE SQL statement. The decision ("may I take this?")
// and the write happen inside the same statement, so two workers racing on
// the same row cannot both win. There is no read-check-write anywhere in
// this file. The follow-up SELECT after a lost acquire only classifies the
// loss for the caller; it never writes.
//
// Both primitives self-heal: a `downloading` row or a slot counter that has
// not been touched for `stale_threshold` is treated as abandoned by a
// crashed worker and reclaimed by the next acquirer.
// =============================================================================

use chrono::Utc;
use futures::FutureExt;
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LimiterConfig;
use crate::error::SyncError;
use crate::metrics::MetricsCollector;
use crate::store::{to_millis, Store};

/// Result of trying to claim a document download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSlot {
    /// Caller owns the fetch and must `complete` or `abort`.
    Acquired,
    /// Someone else is fetching. Wait or skip.
    Downloading,
    /// Payload already stored.
    AlreadyCached(String),
}

/// Lock rows that vanish between a lost claim and the follow-up read (an
/// abort racing us) are retried this many times.
const CLAIM_ATTEMPTS: usize = 3;

// =============================================================================
// DOWNLOAD LOCKS
// =============================================================================

#[derive(Debug, Clone)]
pub struct DownloadLocks {
    pool: SqlitePool,
    stale_threshold: Duration,
    metrics: Arc<MetricsCollector>,
}

impl DownloadLocks {
    pub fn new(store: &Store, stale_threshold: Duration, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            pool: store.pool().clone(),
            stale_threshold,
            metrics,
        }
    }

    fn stale_cutoff(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.stale_threshold.as_millis() as i64)
    }

    /// Claim `key` for downloading.
    ///
    /// Inserts a `downloading` row, or takes over an existing `downloading`
    /// row whose `updated_at` is older than the stale threshold. A fresh
    /// `downloading` row or a `cached` row is left untouched.
    pub async fn try_acquire(&self, key: &str) -> Result<DownloadSlot, SyncError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let now = to_millis(Utc::now());
            let claimed = sqlx::query(
                r#"
INSERT INTO download_locks (document_key, state, payload, updated_at)
VALUES (?, 'downloading', NULL, ?)
ON CONFLICT(document_key) DO UPDATE SET
    state = 'downloading',
    payload = NULL,
    updated_at = excluded.updated_at,
    reclaims = download_locks.reclaims + 1
WHERE download_locks.state = 'downloading'
  AND download_locks.updated_at <= ?
RETURNING reclaims
                "#,
            )
            .bind(key)
            .bind(now)
            .bind(self.stale_cutoff(now))
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = claimed {
                let reclaims: i64 = row.try_get("reclaims")?;
                if reclaims > 0 {
                    self.metrics.add_lock_reclaims(1);
                    info!(document_key = %key, reclaims = reclaims, "Reclaimed abandoned download lock");
                } else {
                    debug!(document_key = %key, "Download lock acquired");
                }
                return Ok(DownloadSlot::Acquired);
            }

            let row = sqlx::query(
                "SELECT state, payload FROM download_locks WHERE document_key = ?",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => {
                    let state: String = row.try_get("state")?;
                    if state == "cached" {
                        let payload: Option<String> = row.try_get("payload")?;
                        return Ok(DownloadSlot::AlreadyCached(payload.unwrap_or_default()));
                    }
                    return Ok(DownloadSlot::Downloading);
                }
                // Aborted between our claim and our read. Try again.
                None => continue,
            }
        }
        Ok(DownloadSlot::Downloading)
    }

    /// Store the payload and flip the row to `cached`. Returns false if the
    /// row is no longer ours (reclaimed or aborted).
    pub async fn complete(&self, key: &str, payload: &str) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
UPDATE download_locks
SET state = 'cached', payload = ?, updated_at = ?
WHERE document_key = ? AND state = 'downloading'
            "#,
        )
        .bind(payload)
        .bind(to_millis(Utc::now()))
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release a claim without a payload.
    pub async fn abort(&self, key: &str) -> Result<bool, SyncError> {
        let result = sqlx::query(
            "DELETE FROM download_locks WHERE document_key = ? AND state = 'downloading'",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn read_cached(&self, key: &str) -> Result<Option<String>, SyncError> {
        let row = sqlx::query(
            "SELECT payload FROM download_locks WHERE document_key = ? AND state = 'cached'",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => row.try_get("payload")?,
            None => None,
        })
    }

    /// Delete abandoned `downloading` rows. Returns how many were removed.
    pub async fn cleanup_stale(&self) -> Result<u64, SyncError> {
        let cutoff = self.stale_cutoff(to_millis(Utc::now()));
        let result = sqlx::query(
            "DELETE FROM download_locks WHERE state = 'downloading' AND updated_at <= ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            self.metrics.add_lock_reclaims(removed);
            info!(removed = removed, "Cleaned up stale download locks");
        }
        Ok(removed)
    }
}

// =============================================================================
// CONCURRENCY SLOT
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConcurrencySlot {
    pool: SqlitePool,
    stale_threshold: Duration,
}

impl ConcurrencySlot {
    pub fn new(store: &Store, stale_threshold: Duration) -> Self {
        Self {
            pool: store.pool().clone(),
            stale_threshold,
        }
    }

    /// Take one slot if fewer than `max` are held. A counter untouched for
    /// the stale threshold is presumed abandoned and restarts from zero.
    /// `max` below 1 is treated as 1.
    pub async fn try_acquire(&self, max: i64) -> Result<bool, SyncError> {
        let now = to_millis(Utc::now());
        let cutoff = now.saturating_sub(self.stale_threshold.as_millis() as i64);
        let result = sqlx::query(
            r#"
UPDATE concurrency_slot
SET count = CASE WHEN last_updated <= ? THEN 1 ELSE count + 1 END,
    last_updated = ?
WHERE id = 1
  AND (last_updated <= ? OR count < ?)
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(cutoff)
        .bind(max.max(1))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give one slot back. Never goes below zero.
    pub async fn release(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
UPDATE concurrency_slot
SET count = MAX(count - 1, 0), last_updated = ?
WHERE id = 1
            "#,
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn current(&self) -> Result<i64, SyncError> {
        let row = sqlx::query("SELECT count FROM concurrency_slot WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

// =============================================================================
// LIMITER: BACKOFF AROUND THE SLOT
// =============================================================================

/// Polls the concurrency slot with exponential backoff and guarantees a
/// release for every successful acquire.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    slot: ConcurrencySlot,
    config: LimiterConfig,
    metrics: Arc<MetricsCollector>,
}

impl ConcurrencyLimiter {
    pub fn new(slot: ConcurrencySlot, config: LimiterConfig, metrics: Arc<MetricsCollector>) -> Self {
        if config.max_concurrent < 1 {
            warn!(max = config.max_concurrent, "Concurrency limit below 1, the slot will admit one caller");
        }
        Self { slot, config, metrics }
    }

    /// Wait until a slot is free or the deadline passes.
    pub async fn acquire(&self) -> Result<(), SyncError> {
        let deadline = tokio::time::Instant::now() + self.config.deadline;
        let mut delay = self.config.backoff_initial;
        let mut saturated = false;

        loop {
            if self.slot.try_acquire(self.config.max_concurrent).await? {
                return Ok(());
            }
            if !saturated {
                saturated = true;
                self.metrics.increment_slot_saturations();
                debug!(max = self.config.max_concurrent, "Concurrency slot saturated, backing off");
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(
                    deadline_secs = self.config.deadline.as_secs(),
                    "Gave up waiting for a concurrency slot"
                );
                return Err(SyncError::SlotTimeout(self.config.deadline));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.config.backoff_max);
        }
    }

    /// Run `work` while holding a slot. The slot is released on every exit
    /// path, including a panic inside `work`.
    pub async fn run<F, T>(&self, work: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        self.acquire().await?;
        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        if let Err(e) = self.slot.release().await {
            warn!(error = %e, "Failed to release concurrency slot; stale reset will reclaim it");
        }
        match outcome {
            Ok(result) => result,
            Err(_) => Err(SyncError::WorkerPanicked),
        }
    }
}
