// =============================================================================
// layout_cache.rs - PORTAL LAYOUT DOCUMENTS
// =============================================================================
//
// Each portal screen is described by a static XML layout document. They
// almost never change, every worker needs them, and fetching one is a portal
// request like any other. So they are fetched once, through the download
// lock, and kept:
//
//   memory  a small LRU in this process
//   store   the `cached` payload in download_locks, shared by all workers
//
// Only one worker anywhere fetches a given document at a time. Others either
// find it cached, or poll briefly and then carry on without it.
// =============================================================================

use lru::LruCache;
use parking_lot::RwLock;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser_pool::BrowserPool;
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::PortalRoute;
use crate::error::SyncError;
use crate::lock::{DownloadLocks, DownloadSlot};
use crate::metrics::MetricsCollector;

const LAYOUT_ROOT: &str = "/ssgo/ui/";
const MEMORY_CAPACITY: usize = 64;
const MAX_LAYOUT_BYTES: usize = 2 * 1024 * 1024;

/// How long to wait on another worker's in-flight download.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_millis(500), attempts: 6 }
    }
}

pub struct LayoutCache {
    locks: DownloadLocks,
    pool: BrowserPool,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsCollector>,
    memory: RwLock<LruCache<String, Arc<str>>>,
    poll: PollPolicy,
}

impl LayoutCache {
    pub fn new(
        locks: DownloadLocks,
        pool: BrowserPool,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsCollector>,
        poll: PollPolicy,
    ) -> Self {
        let capacity = NonZeroUsize::new(MEMORY_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            locks,
            pool,
            breaker,
            metrics,
            memory: RwLock::new(LruCache::new(capacity)),
            poll,
        }
    }

    /// Make sure the layout for `route` is cached and return it. `None` means
    /// another worker is still fetching it and we gave up waiting.
    pub async fn ensure(&self, route: PortalRoute) -> Result<Option<Arc<str>>, SyncError> {
        self.ensure_path(&route.layout_path()).await
    }

    pub async fn ensure_path(&self, key: &str) -> Result<Option<Arc<str>>, SyncError> {
        if let Some(hit) = self.memory.write().get(key).cloned() {
            self.metrics.increment_layout_cache_hits();
            return Ok(Some(hit));
        }

        for attempt in 0..=self.poll.attempts {
            match self.locks.try_acquire(key).await? {
                DownloadSlot::AlreadyCached(payload) => {
                    self.metrics.increment_layout_cache_hits();
                    return Ok(Some(self.remember(key, payload)));
                }
                DownloadSlot::Acquired => return self.download(key).await.map(Some),
                DownloadSlot::Downloading => {
                    if attempt == self.poll.attempts {
                        break;
                    }
                    debug!(document_key = %key, attempt = attempt, "Layout being fetched elsewhere, waiting");
                    tokio::time::sleep(self.poll.interval).await;
                }
            }
        }

        info!(document_key = %key, "Layout still downloading elsewhere, skipping");
        Ok(None)
    }

    async fn download(&self, key: &str) -> Result<Arc<str>, SyncError> {
        let path = format!("{LAYOUT_ROOT}{key}");
        let breaker = self.breaker.clone();
        let fetched = self
            .pool
            .with_page(|page| async move {
                breaker
                    .call(async {
                        let response = page.get(&path).await?;
                        if !response.is_success() {
                            return Err(SyncError::Portal(format!(
                                "layout {path} returned HTTP {}",
                                response.status
                            )));
                        }
                        check_well_formed(&response.body)?;
                        Ok(response.body)
                    })
                    .await
            })
            .await;

        match fetched {
            Ok(payload) => {
                if !self.locks.complete(key, &payload).await? {
                    warn!(document_key = %key, "Lost the layout lock before completing");
                }
                self.metrics.increment_layout_downloads();
                info!(document_key = %key, bytes = payload.len(), "Layout cached");
                Ok(self.remember(key, payload))
            }
            Err(e) => {
                if let Err(abort_err) = self.locks.abort(key).await {
                    warn!(document_key = %key, error = %abort_err, "Failed to abort layout lock");
                }
                Err(e)
            }
        }
    }

    fn remember(&self, key: &str, payload: String) -> Arc<str> {
        let payload: Arc<str> = Arc::from(payload);
        self.memory.write().put(key.to_string(), payload.clone());
        payload
    }
}

/// Reject anything that isn't a single well-formed XML document.
pub fn check_well_formed(xml: &str) -> Result<(), SyncError> {
    if xml.len() > MAX_LAYOUT_BYTES {
        return Err(SyncError::Portal("layout document oversized".into()));
    }

    let mut reader = Reader::from_str(xml);
    let mut depth: usize = 0;
    let mut roots = 0;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Empty(_)) if depth == 0 => roots += 1,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(SyncError::Portal(format!(
                    "malformed layout at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    if roots != 1 || depth != 0 {
        return Err(SyncError::Portal("layout is not a single XML document".into()));
    }
    Ok(())
}
