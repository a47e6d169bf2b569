// =============================================================================
// publisher.rs - UPDATE NOTIFICATIONS TO REDIS
// =============================================================================
//
// Detected case updates leave the engine through Redis:
//
//   PUBLISH  on the updates channel, for whoever is listening right now
//   ZADD     into a sorted set scored by detection time, for whoever
//            connects later and wants to catch up
//
// Sync code never talks to Redis. It hands records to an UpdateNotifier,
// which pushes them into a bounded crossbeam channel without blocking. The
// RedisPublisher task drains that channel. If Redis is down or slow and the
// channel fills up, new records are dropped with a warning: the database
// already has them, and notifications are best effort.
// =============================================================================

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::models::CaseUpdateRecord;

const BATCH_SIZE: usize = 50;

/// Non-blocking sending side, cloned into every syncer.
#[derive(Clone)]
pub struct UpdateNotifier {
    sender: Sender<CaseUpdateRecord>,
    metrics: Arc<MetricsCollector>,
}

impl UpdateNotifier {
    /// Channel pair with room for `capacity` pending records.
    pub fn channel(capacity: usize, metrics: Arc<MetricsCollector>) -> (Self, Receiver<CaseUpdateRecord>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        (Self { sender, metrics }, receiver)
    }

    /// Queue records for publishing. Returns how many were accepted.
    pub fn notify(&self, records: &[CaseUpdateRecord]) -> usize {
        let mut accepted = 0;
        for record in records {
            match self.sender.try_send(record.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(dropped)) => {
                    self.metrics.increment_redis_failures();
                    warn!(
                        update_id = %dropped.id,
                        case_id = %dropped.case_id,
                        "Notification channel full, dropping update event"
                    );
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Publisher is gone, update events are not forwarded");
                    break;
                }
            }
        }
        accepted
    }
}

pub struct PublisherStats {
    pub events_published: portable_atomic::AtomicU64,
    pub events_persisted: portable_atomic::AtomicU64,
    pub publish_errors: portable_atomic::AtomicU64,
    pub batches_sent: portable_atomic::AtomicU64,
}

impl PublisherStats {
    pub fn new() -> Self {
        Self {
            events_published: portable_atomic::AtomicU64::new(0),
            events_persisted: portable_atomic::AtomicU64::new(0),
            publish_errors: portable_atomic::AtomicU64::new(0),
            batches_sent: portable_atomic::AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> PublisherSnapshot {
        use portable_atomic::Ordering;
        PublisherSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for PublisherStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PublisherSnapshot {
    pub events_published: u64,
    pub events_persisted: u64,
    pub publish_errors: u64,
    pub batches_sent: u64,
}

/// Score for the history sorted set: detection time in epoch milliseconds.
pub fn history_score(record: &CaseUpdateRecord) -> f64 {
    record.detected_at.timestamp_millis() as f64
}

/// Drains the notification channel into Redis until shutdown.
pub struct RedisPublisher {
    config: Arc<Config>,
    receiver: Receiver<CaseUpdateRecord>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<PublisherStats>,
    metrics: Arc<MetricsCollector>,
}

impl RedisPublisher {
    pub fn new(
        config: Arc<Config>,
        receiver: Receiver<CaseUpdateRecord>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<MetricsCollector>,
    ) -> (Self, Arc<PublisherStats>) {
        let stats = Arc::new(PublisherStats::new());
        (
            Self {
                config,
                receiver,
                shutdown,
                stats: Arc::clone(&stats),
                metrics,
            },
            stats,
        )
    }

    pub async fn run(self) -> Result<()> {
        info!(
            channel = %self.config.redis_channel,
            sorted_set = %self.config.redis_sorted_set,
            "Redis publisher starting"
        );

        let client = redis::Client::open(self.config.redis_url.as_str())?;
        let mut con = loop {
            match client.get_multiplexed_async_connection().await {
                Ok(con) => {
                    info!("Redis connection established");
                    break con;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to Redis, retrying in 5 seconds");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    if *self.shutdown.borrow() {
                        info!("Shutdown received while connecting to Redis");
                        return Ok(());
                    }
                }
            }
        };

        let mut batch: Vec<CaseUpdateRecord> = Vec::with_capacity(BATCH_SIZE);

        loop {
            if *self.shutdown.borrow() {
                batch.clear();
                batch.extend(self.receiver.try_iter());
                if !batch.is_empty() {
                    if let Err(e) = self.publish_batch(&mut con, &batch).await {
                        error!(error = %e, "Failed to publish final batch during shutdown");
                    }
                }
                info!("Redis publisher stopped");
                return Ok(());
            }

            batch.clear();
            while batch.len() < BATCH_SIZE {
                match self.receiver.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(crossbeam_channel::TryRecvError::Empty) => break,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        if !batch.is_empty() {
                            let _ = self.publish_batch(&mut con, &batch).await;
                        }
                        info!("Notification channel closed, publisher exiting");
                        return Ok(());
                    }
                }
            }

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            if let Err(e) = self.publish_batch(&mut con, &batch).await {
                error!(error = %e, batch_size = batch.len(), "Failed to publish update batch to Redis");
                self.stats
                    .publish_errors
                    .fetch_add(batch.len() as u64, portable_atomic::Ordering::Relaxed);
                self.metrics.increment_redis_failures();
            }
        }
    }

    /// One pipeline per batch: a PUBLISH and a ZADD for every record.
    async fn publish_batch(
        &self,
        con: &mut redis::aio::MultiplexedConnection,
        batch: &[CaseUpdateRecord],
    ) -> Result<()> {
        use portable_atomic::Ordering;

        let mut pipe = redis::pipe();
        for record in batch {
            let json = serde_json::to_string(record)?;
            pipe.publish(&self.config.redis_channel, &json)
                .ignore()
                .zadd(&self.config.redis_sorted_set, &json, history_score(record))
                .ignore();
        }
        let _: () = pipe.query_async(con).await?;

        let count = batch.len() as u64;
        self.stats.events_published.fetch_add(count, Ordering::Relaxed);
        self.stats.events_persisted.fetch_add(count, Ordering::Relaxed);
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);

        debug!(
            batch_size = batch.len(),
            total_published = self.stats.events_published.load(Ordering::Relaxed),
            "Update batch published"
        );
        Ok(())
    }
}
