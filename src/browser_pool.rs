// =============================================================================
// browser_pool.rs - AUTOMATION HANDLE POOL
// =============================================================================
//
// A fixed number of automation handles shared by every lookup in the
// process. One handle serves exactly one lookup at a time.
//
//   acquire   idle handle if any, else launch one while under capacity, else
//             wait in line. The line is a fair semaphore, so waiters are
//             served strictly first come, first served.
//   release   back to the idle set, or closed and replaced once the handle
//             has served `usage_ceiling` lookups or was left unhealthy.
//   with_page acquire, open a page, run, always close the page, always
//             release. Panics and timeouts inside the scope discard the
//             handle instead of returning it.
//   shutdown  wakes every waiter with PoolShutdown and closes idle handles.
//             Leased handles are closed as they come back.
//
// The pool is an ordinary value owned by whoever builds it. Clone it to
// share; clones refer to the same handles.
// =============================================================================

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::driver::{AutomationDriver, BrowserHandle, Page};
use crate::error::SyncError;
use crate::metrics::MetricsCollector;

struct PoolEntry {
    handle: Arc<dyn BrowserHandle>,
    uses: u32,
}

struct PoolInner {
    driver: Arc<dyn AutomationDriver>,
    config: PoolConfig,
    metrics: Arc<MetricsCollector>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PoolEntry>>,
    live: AtomicUsize,
    waiting: AtomicUsize,
    shut_down: AtomicBool,
}

impl PoolInner {
    fn return_to_idle(&self, entry: PoolEntry) {
        if self.shut_down.load(Ordering::Acquire) {
            self.live.fetch_sub(1, Ordering::AcqRel);
            spawn_close(entry.handle);
        } else {
            self.idle.lock().push_back(entry);
        }
    }
}

fn spawn_close(handle: Arc<dyn BrowserHandle>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = handle.close().await {
                warn!(handle_id = handle.id(), error = %e, "Handle close failed");
            }
        });
    }
}

/// Counts reported by `BrowserPool::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub waiting: usize,
    pub max_instances: usize,
}

/// A leased handle. Dropping a lease without `release` puts the handle back
/// in the idle set, so no exit path can leak capacity.
pub struct PooledHandle {
    entry: Option<PoolEntry>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl PooledHandle {
    pub fn handle(&self) -> Option<&Arc<dyn BrowserHandle>> {
        self.entry.as_ref().map(|e| &e.handle)
    }

    pub fn uses(&self) -> u32 {
        self.entry.as_ref().map(|e| e.uses).unwrap_or(0)
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.uses += 1;
            debug!(handle_id = entry.handle.id(), "Lease dropped without release, returning handle");
            self.pool.return_to_idle(entry);
        }
    }
}

#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        config: PoolConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let max = config.max_instances.max(1);
        Self {
            inner: Arc::new(PoolInner {
                driver,
                config: PoolConfig { max_instances: max, ..config },
                metrics,
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                live: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The handle counts as live from the moment its launch starts, so a
    /// launch in flight is never double-booked.
    async fn launch(&self) -> Result<PoolEntry, SyncError> {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        let handle = match self.inner.driver.launch().await {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.live.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        self.inner.metrics.increment_handles_created();
        debug!(handle_id = handle.id(), "Automation handle created");
        Ok(PoolEntry { handle, uses: 0 })
    }

    /// Launch handles until `max_instances` are live. Each launch holds a
    /// permit, like any other acquirer. Returns how many were created.
    pub async fn initialize(&self) -> Result<usize, SyncError> {
        let mut created = 0;
        loop {
            if self.inner.shut_down.load(Ordering::Acquire) {
                return Err(SyncError::PoolShutdown);
            }
            let _permit = self
                .inner
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SyncError::PoolShutdown)?;
            if self.inner.live.load(Ordering::Acquire) >= self.inner.config.max_instances {
                break;
            }
            let entry = self.launch().await?;
            self.inner.idle.lock().push_back(entry);
            created += 1;
        }
        info!(created = created, max = self.inner.config.max_instances, "Browser pool warmed");
        Ok(created)
    }

    pub async fn acquire(&self) -> Result<PooledHandle, SyncError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(SyncError::PoolShutdown);
        }

        self.inner.waiting.fetch_add(1, Ordering::AcqRel);
        let permit = self.inner.permits.clone().acquire_owned().await;
        self.inner.waiting.fetch_sub(1, Ordering::AcqRel);
        let permit = permit.map_err(|_| SyncError::PoolShutdown)?;

        let reused = self.inner.idle.lock().pop_front();
        let entry = match reused {
            Some(entry) => entry,
            // On failure the permit drops here and the next waiter gets a turn.
            None => self.launch().await?,
        };

        Ok(PooledHandle {
            entry: Some(entry),
            _permit: permit,
            pool: self.inner.clone(),
        })
    }

    /// Return a lease. `healthy = false` discards the handle regardless of
    /// its usage count.
    pub async fn release(&self, mut lease: PooledHandle, healthy: bool) {
        let Some(mut entry) = lease.entry.take() else { return };
        entry.uses += 1;

        let shut_down = self.inner.shut_down.load(Ordering::Acquire);
        let worn_out = entry.uses >= self.inner.config.usage_ceiling;

        if healthy && !worn_out && !shut_down {
            self.inner.idle.lock().push_back(entry);
            drop(lease);
            return;
        }

        let handle_id = entry.handle.id();
        if let Err(e) = entry.handle.close().await {
            warn!(handle_id = handle_id, error = %e, "Handle close failed; dropping it anyway");
        }
        self.inner.live.fetch_sub(1, Ordering::AcqRel);

        if !healthy {
            self.inner.metrics.increment_handles_discarded();
            warn!(handle_id = handle_id, "Discarded unhealthy automation handle");
        } else if worn_out {
            self.inner.metrics.increment_handles_recycled();
            debug!(handle_id = handle_id, uses = entry.uses, "Recycled automation handle at usage ceiling");
        }

        if !shut_down {
            match self.launch().await {
                Ok(replacement) => self.inner.return_to_idle(replacement),
                Err(e) => warn!(error = %e, "Replacement handle launch failed; will launch on demand"),
            }
        }
        drop(lease);
    }

    /// Scoped page run with the handle-level timeout from config.
    pub async fn with_page<F, Fut, T>(&self, work: F) -> Result<T, SyncError>
    where
        F: FnOnce(Arc<dyn Page>) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.with_page_timeout(self.inner.config.handle_timeout, work).await
    }

    pub async fn with_page_timeout<F, Fut, T>(&self, timeout: Duration, work: F) -> Result<T, SyncError>
    where
        F: FnOnce(Arc<dyn Page>) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let lease = self.acquire().await?;
        let page = match lease.handle() {
            Some(handle) => handle.new_page().await,
            None => Err(SyncError::Driver("lease without handle".into())),
        };
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                self.release(lease, false).await;
                return Err(e);
            }
        };

        let scoped_page = page.clone();
        let scoped = AssertUnwindSafe(async move { work(scoped_page).await }).catch_unwind();
        let outcome = tokio::time::timeout(timeout, scoped).await;

        if let Err(e) = page.close().await {
            warn!(error = %e, "Page close failed");
        }

        let (result, healthy) = match outcome {
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Page scope timed out");
                (Err(SyncError::Timeout(timeout)), false)
            }
            Ok(Err(_)) => {
                warn!("Worker panicked inside page scope");
                (Err(SyncError::WorkerPanicked), false)
            }
            Ok(Ok(result)) => {
                let healthy = !matches!(&result, Err(e) if e.poisons_handle());
                (result, healthy)
            }
        };

        self.release(lease, healthy).await;
        result
    }

    pub fn status(&self) -> PoolStatus {
        let max = self.inner.config.max_instances;
        let available = self.inner.idle.lock().len();
        let total = self.inner.live.load(Ordering::Acquire);
        PoolStatus {
            total,
            in_use: max.saturating_sub(self.inner.permits.available_permits()),
            available,
            waiting: self.inner.waiting.load(Ordering::Acquire),
            max_instances: max,
        }
    }

    /// Fail every waiter, refuse new acquires and close idle handles.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<PoolEntry> = self.inner.idle.lock().drain(..).collect();
        let closing = idle.len();
        for entry in idle {
            if let Err(e) = entry.handle.close().await {
                warn!(handle_id = entry.handle.id(), error = %e, "Handle close failed during shutdown");
            }
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
        }
        info!(closed = closing, "Browser pool shut down");
    }
}
