// =============================================================================
//   C O U R T   S Y N C   E N G I N E
// =============================================================================
//
// Keeps a local copy of court case records in step with a challenge-gated
// lookup portal. One solved challenge buys a session; the session is reused
// for as many lookups as the portal allows; every lookup runs on a pooled
// automation handle inside a global concurrency budget shared by all
// workers through the store.
//
// Nothing here is a global. main builds every service, hands them to the
// tasks that need them, and tears them down on Ctrl+C.
// =============================================================================

mod browser_pool;
mod case_number;
mod case_sync;
mod change_detector;
mod circuit_breaker;
mod classifier;
mod config;
mod driver;
mod error;
mod layout_cache;
mod lock;
mod metrics;
mod models;
mod orchestrator;
mod publisher;
mod server;
mod session;
mod store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::browser_pool::BrowserPool;
use crate::case_sync::{CaseSyncer, PortalCaseSyncer};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::driver::HttpDriver;
use crate::layout_cache::{LayoutCache, PollPolicy};
use crate::lock::{ConcurrencyLimiter, ConcurrencySlot, DownloadLocks};
use crate::metrics::MetricsCollector;
use crate::orchestrator::SyncOrchestrator;
use crate::publisher::{RedisPublisher, UpdateNotifier};
use crate::server::AppState;
use crate::session::SessionManager;
use crate::store::Store;

const UPDATE_CHANNEL_CAPACITY: usize = 10_000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn print_banner() {
    let banner = r#"
    ╔══════════════════════════════════════════════════════════╗
    ║                                                          ║
    ║              C O U R T   S Y N C   E N G I N E           ║
    ║                                                          ║
    ║   Pool:      reusable automation handles, FIFO waiters   ║
    ║   Sessions:  one challenge, many lookups                 ║
    ║   Store:     atomic download locks + concurrency slot    ║
    ║   Notify:    Redis pub/sub + update history              ║
    ║                                                          ║
    ╚══════════════════════════════════════════════════════════╝
    "#;
    println!("{}", banner);
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    init_tracing(config.log_json);
    if !config.log_json {
        print_banner();
    }

    info!(
        portal = %config.portal_base_url,
        store = %config.store_path,
        pool_max = config.pool_max_instances,
        slot_max = config.concurrency_slot_max,
        "Court sync engine initializing"
    );
    for setting in config.clamped_settings() {
        warn!(setting = setting, "Configured below 1, running with 1 instead");
    }
    if config.cron_secret.is_empty() {
        warn!("No cron secret configured, the sync trigger will reject every request");
    }

    let metrics = Arc::new(MetricsCollector::new());

    // =========================================================================
    // STORE
    // =========================================================================

    let store = Store::open(Path::new(&config.store_path)).await?;
    let locks = DownloadLocks::new(&store, config.stale_threshold, metrics.clone());
    let reclaimed = locks.cleanup_stale().await?;
    info!(reclaimed = reclaimed, "Store ready");

    // =========================================================================
    // POOL, SESSIONS, SYNC
    // =========================================================================

    let driver = Arc::new(HttpDriver::new(
        &config.portal_base_url,
        &config.portal_user_agent,
        config.page_timeout,
    )?);
    let pool = BrowserPool::new(driver, config.pool(), metrics.clone());
    if config.pool_prewarm {
        match pool.initialize().await {
            Ok(count) => info!(handles = count, "Browser pool pre-warmed"),
            Err(e) => warn!(error = %e, "Pool pre-warm failed, handles will launch on demand"),
        }
    }

    let breaker = Arc::new(CircuitBreaker::new(
        "portal",
        config.circuit_breaker_failure_threshold,
        config.circuit_breaker_reset_timeout,
        config.circuit_breaker_success_threshold,
    ));
    let sessions = Arc::new(SessionManager::new(
        pool.clone(),
        config.session(),
        breaker.clone(),
        metrics.clone(),
    ));
    let limiter = ConcurrencyLimiter::new(
        ConcurrencySlot::new(&store, config.stale_threshold),
        config.limiter(),
        metrics.clone(),
    );
    let layouts = Arc::new(LayoutCache::new(
        locks.clone(),
        pool.clone(),
        breaker.clone(),
        metrics.clone(),
        PollPolicy::default(),
    ));

    let (notifier, update_rx) = UpdateNotifier::channel(UPDATE_CHANNEL_CAPACITY, metrics.clone());
    let syncer: Arc<dyn CaseSyncer> = Arc::new(PortalCaseSyncer::new(
        store.clone(),
        sessions.clone(),
        limiter,
        layouts,
        notifier,
        metrics.clone(),
        config.sync_skip_window,
    ));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        syncer.clone(),
        store.clone(),
        config.orchestrator(),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // =========================================================================
    // TASKS
    // =========================================================================

    let (publisher, publisher_stats) =
        RedisPublisher::new(config.clone(), update_rx, shutdown_rx.clone(), metrics.clone());
    let publisher_handle = tokio::spawn(async move {
        info!("Redis publisher: online");
        if let Err(e) = publisher.run().await {
            error!(error = %e, "Redis publisher failed");
        }
        info!("Redis publisher: offline");
    });

    // Crashed workers leave `downloading` rows behind. Sweep them now and then.
    let sweep_locks = locks.clone();
    let sweep_interval = config.stale_threshold.max(Duration::from_secs(1));
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => match sweep_locks.cleanup_stale().await {
                    Ok(0) => {}
                    Ok(count) => info!(reclaimed = count, "Stale download locks removed"),
                    Err(e) => warn!(error = %e, "Stale lock sweep failed"),
                },
                _ = sweep_shutdown.changed() => break,
            }
        }
    });

    let state = AppState {
        cron_secret: Arc::from(config.cron_secret.as_str()),
        response_result_sample: config.sync_response_result_sample,
        store: store.clone(),
        locks,
        orchestrator: orchestrator.clone(),
        syncer,
        sessions,
        pool: pool.clone(),
        breaker,
        metrics,
        publisher: publisher_stats,
    };
    let bind = config.http_bind.clone();
    let server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(state, &bind, server_shutdown).await {
            error!(error = %e, "HTTP server failed");
        }
        info!("HTTP server: offline");
    });

    let batch = orchestrator.config();
    info!(
        bind = %config.http_bind,
        max_cases = batch.max_cases_per_run,
        chunk = batch.default_concurrency,
        redis = %config.redis_url,
        "Court sync engine online, Ctrl+C to stop"
    );

    match signal::ctrl_c().await {
        Ok(()) => warn!("Shutdown signal received"),
        Err(err) => error!(error = %err, "Signal listener error, shutting down"),
    }
    let _ = shutdown_tx.send(true);

    info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Waiting for tasks to complete");
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(publisher_handle, sweep_handle, server_handle);
    })
    .await;

    pool.shutdown().await;
    store.pool().close().await;

    info!("Court sync engine offline");
    Ok(())
}
