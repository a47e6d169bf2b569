// =============================================================================
// config.rs - THE CONTROL ROOM
// =============================================================================
//
// Every knob the engine has. Pool sizes, timeouts, how long a lock row may
// sit in `downloading` before we call it abandoned, how politely we pace the
// portal between lookups. All of it can be overridden with COURT_SYNC_*
// environment variables, and all of it has a default that works out of the
// box.
//
// The root Config is loaded once in main and then sliced into the small
// per-service configs below. Services never read the environment themselves.
// =============================================================================

use std::env;
use std::time::Duration;

/// The root configuration. Loaded once, owned by the process entry point.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // BROWSER POOL
    // =========================================================================

    /// Maximum number of live automation handles. Default: 4.
    pub pool_max_instances: usize,

    /// Lookups a handle may serve before it is recycled. Long-lived automation
    /// sessions accumulate cruft; twenty lookups is where we stop trusting them.
    pub pool_usage_ceiling: u32,

    /// Per-request timeout inside a page, enforced by the driver. A page that
    /// hits it is reported as a timeout and its handle retired. Default: 30 seconds.
    pub page_timeout: Duration,

    /// Handle-level timeout applied to a whole scoped page run. Default: 60 seconds.
    pub handle_timeout: Duration,

    /// Pre-warm handles at startup instead of lazily on first acquire.
    pub pool_prewarm: bool,

    // =========================================================================
    // PORTAL & SESSION
    // =========================================================================

    /// Base URL of the court lookup portal.
    pub portal_base_url: String,

    /// User agent presented to the portal.
    pub portal_user_agent: String,

    /// How long an established session is trusted without an observed failure.
    /// Default: 30 minutes.
    pub session_validity: Duration,

    /// Size of the portal's saved-results list. Default: 50.
    pub saved_results_cap: usize,

    // =========================================================================
    // SHARED STORE (LOCKS, SLOT, SNAPSHOTS)
    // =========================================================================

    /// SQLite database path. Default: court_sync.sqlite
    pub store_path: String,

    /// Age after which an in-flight lock or slot is presumed abandoned.
    /// Default: 300 seconds.
    pub stale_threshold: Duration,

    /// Global cap on simultaneous external calls across all workers. Default: 4.
    pub concurrency_slot_max: i64,

    /// First retry delay when the concurrency slot is saturated.
    pub slot_backoff_initial: Duration,

    /// Ceiling for the exponential slot backoff.
    pub slot_backoff_max: Duration,

    /// Give up on the slot after this long. Default: 60 seconds.
    pub slot_acquire_deadline: Duration,

    // =========================================================================
    // BATCH SYNC
    // =========================================================================

    /// Maximum cases a single batch run will consider. Default: 50.
    pub sync_max_cases_per_run: usize,

    /// Delay between items in sequential mode. Default: 3000 ms.
    pub sync_item_delay: Duration,

    /// Chunk size in parallel mode. Default: 4.
    pub sync_parallel_chunk: usize,

    /// Delay between chunks in parallel mode. Default: 2000 ms.
    pub sync_chunk_delay: Duration,

    /// Cases synced more recently than this are not eligible for a batch run.
    /// Default: 12 hours.
    pub sync_min_resync_interval: Duration,

    /// Single-case requests without forceRefresh are skipped inside this window.
    /// Default: 5 minutes.
    pub sync_skip_window: Duration,

    /// Individual results kept in the persisted log entry. Default: 10.
    pub sync_log_result_sample: usize,

    /// Individual results returned by the trigger endpoint. Default: 20.
    pub sync_response_result_sample: usize,

    // =========================================================================
    // HTTP SERVER
    // =========================================================================

    /// Shared secret for the trigger endpoint.
    pub cron_secret: String,

    /// Address the HTTP server binds to. Default: 0.0.0.0:8088
    pub http_bind: String,

    // =========================================================================
    // REDIS NOTIFICATIONS
    // =========================================================================

    pub redis_url: String,

    /// Pub/sub channel for case update events.
    pub redis_channel: String,

    /// Sorted set holding the update history, scored by detection time.
    pub redis_sorted_set: String,

    // =========================================================================
    // CIRCUIT BREAKER (PORTAL)
    // =========================================================================

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_timeout: Duration,
    pub circuit_breaker_success_threshold: u32,

    // =========================================================================
    // LOGGING
    // =========================================================================

    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

impl Config {
    /// Load configuration from the environment (and a `.env` file if one
    /// exists), falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Config {
            // Pool
            pool_max_instances: env_or_default("COURT_SYNC_POOL_MAX", "4")
                .parse().unwrap_or(4),
            pool_usage_ceiling: env_or_default("COURT_SYNC_POOL_USAGE_CEILING", "20")
                .parse().unwrap_or(20),
            page_timeout: Duration::from_millis(
                env_or_default("COURT_SYNC_PAGE_TIMEOUT_MS", "30000").parse().unwrap_or(30_000)
            ),
            handle_timeout: Duration::from_millis(
                env_or_default("COURT_SYNC_HANDLE_TIMEOUT_MS", "60000").parse().unwrap_or(60_000)
            ),
            pool_prewarm: env_or_default("COURT_SYNC_POOL_PREWARM", "true")
                .parse().unwrap_or(true),

            // Portal
            portal_base_url: env_or_default(
                "COURT_SYNC_PORTAL_BASE_URL",
                "https://ssgo.scourt.go.kr"
            ),
            portal_user_agent: env_or_default(
                "COURT_SYNC_PORTAL_USER_AGENT",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            ),
            session_validity: Duration::from_secs(
                env_or_default("COURT_SYNC_SESSION_VALIDITY_SECS", "1800").parse().unwrap_or(1800)
            ),
            saved_results_cap: env_or_default("COURT_SYNC_SAVED_RESULTS_CAP", "50")
                .parse().unwrap_or(50),

            // Store
            store_path: env_or_default("COURT_SYNC_STORE_PATH", "court_sync.sqlite"),
            stale_threshold: Duration::from_secs(
                env_or_default("COURT_SYNC_STALE_THRESHOLD_SECS", "300").parse().unwrap_or(300)
            ),
            concurrency_slot_max: env_or_default("COURT_SYNC_SLOT_MAX", "4")
                .parse().unwrap_or(4),
            slot_backoff_initial: Duration::from_millis(
                env_or_default("COURT_SYNC_SLOT_BACKOFF_MS", "250").parse().unwrap_or(250)
            ),
            slot_backoff_max: Duration::from_millis(
                env_or_default("COURT_SYNC_SLOT_BACKOFF_MAX_MS", "4000").parse().unwrap_or(4000)
            ),
            slot_acquire_deadline: Duration::from_secs(
                env_or_default("COURT_SYNC_SLOT_DEADLINE_SECS", "60").parse().unwrap_or(60)
            ),

            // Batch sync
            sync_max_cases_per_run: env_or_default("COURT_SYNC_MAX_CASES_PER_RUN", "50")
                .parse().unwrap_or(50),
            sync_item_delay: Duration::from_millis(
                env_or_default("COURT_SYNC_ITEM_DELAY_MS", "3000").parse().unwrap_or(3000)
            ),
            sync_parallel_chunk: env_or_default("COURT_SYNC_PARALLEL_CHUNK", "4")
                .parse().unwrap_or(4),
            sync_chunk_delay: Duration::from_millis(
                env_or_default("COURT_SYNC_CHUNK_DELAY_MS", "2000").parse().unwrap_or(2000)
            ),
            sync_min_resync_interval: Duration::from_secs(
                env_or_default("COURT_SYNC_MIN_RESYNC_HOURS", "12").parse::<u64>().unwrap_or(12) * 3600
            ),
            sync_skip_window: Duration::from_secs(
                env_or_default("COURT_SYNC_SKIP_WINDOW_SECS", "300").parse().unwrap_or(300)
            ),
            sync_log_result_sample: env_or_default("COURT_SYNC_LOG_RESULT_SAMPLE", "10")
                .parse().unwrap_or(10),
            sync_response_result_sample: env_or_default("COURT_SYNC_RESPONSE_RESULT_SAMPLE", "20")
                .parse().unwrap_or(20),

            // HTTP
            cron_secret: env::var("COURT_SYNC_CRON_SECRET")
                .or_else(|_| env::var("CRON_SECRET"))
                .unwrap_or_default(),
            http_bind: env_or_default("COURT_SYNC_HTTP_BIND", "0.0.0.0:8088"),

            // Redis
            redis_url: env_or_default("COURT_SYNC_REDIS_URL", "redis://127.0.0.1:6379"),
            redis_channel: env_or_default("COURT_SYNC_REDIS_CHANNEL", "court_sync:updates"),
            redis_sorted_set: env_or_default(
                "COURT_SYNC_REDIS_SORTED_SET",
                "court_sync:updates:history"
            ),

            // Circuit breaker
            circuit_breaker_failure_threshold: env_or_default(
                "COURT_SYNC_CB_FAILURE_THRESHOLD", "5"
            ).parse().unwrap_or(5),
            circuit_breaker_reset_timeout: Duration::from_secs(
                env_or_default("COURT_SYNC_CB_RESET_TIMEOUT_SECS", "60").parse().unwrap_or(60)
            ),
            circuit_breaker_success_threshold: env_or_default(
                "COURT_SYNC_CB_SUCCESS_THRESHOLD", "2"
            ).parse().unwrap_or(2),

            log_json: env_or_default("COURT_SYNC_LOG_JSON", "false")
                .parse().unwrap_or(false),
        }
    }

    /// Settings configured below 1. The sub-configs raise them to 1; callers
    /// should say so out loud.
    pub fn clamped_settings(&self) -> Vec<&'static str> {
        [
            ("COURT_SYNC_POOL_MAX", self.pool_max_instances < 1),
            ("COURT_SYNC_POOL_USAGE_CEILING", self.pool_usage_ceiling < 1),
            ("COURT_SYNC_SAVED_RESULTS_CAP", self.saved_results_cap < 1),
            ("COURT_SYNC_SLOT_MAX", self.concurrency_slot_max < 1),
            ("COURT_SYNC_PARALLEL_CHUNK", self.sync_parallel_chunk < 1),
        ]
        .into_iter()
        .filter_map(|(name, clamped)| clamped.then_some(name))
        .collect()
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_instances: self.pool_max_instances.max(1),
            usage_ceiling: self.pool_usage_ceiling.max(1),
            handle_timeout: self.handle_timeout,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            portal_base_url: self.portal_base_url.clone(),
            validity: self.session_validity,
            saved_results_cap: self.saved_results_cap.max(1),
        }
    }

    pub fn limiter(&self) -> LimiterConfig {
        LimiterConfig {
            max_concurrent: self.concurrency_slot_max.max(1),
            backoff_initial: self.slot_backoff_initial,
            backoff_max: self.slot_backoff_max,
            deadline: self.slot_acquire_deadline,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_cases_per_run: self.sync_max_cases_per_run,
            item_delay: self.sync_item_delay,
            default_concurrency: self.sync_parallel_chunk.max(1),
            chunk_delay: self.sync_chunk_delay,
            min_resync_interval: self.sync_min_resync_interval,
            log_result_sample: self.sync_log_result_sample,
        }
    }
}

/// Browser pool knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_instances: usize,
    pub usage_ceiling: u32,
    pub handle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            usage_ceiling: 20,
            handle_timeout: Duration::from_secs(60),
        }
    }
}

/// Session manager knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub portal_base_url: String,
    pub validity: Duration,
    pub saved_results_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            portal_base_url: "https://ssgo.scourt.go.kr".to_string(),
            validity: Duration::from_secs(30 * 60),
            saved_results_cap: 50,
        }
    }
}

/// Concurrency slot limiter knobs.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub max_concurrent: i64,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub deadline: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(4),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Batch orchestrator knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_cases_per_run: usize,
    pub item_delay: Duration,
    pub default_concurrency: usize,
    pub chunk_delay: Duration,
    pub min_resync_interval: Duration,
    pub log_result_sample: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_cases_per_run: 50,
            item_delay: Duration::from_millis(3000),
            default_concurrency: 4,
            chunk_delay: Duration::from_millis(2000),
            min_resync_interval: Duration::from_secs(12 * 3600),
            log_result_sample: 10,
        }
    }
}

/// Read an environment variable, falling back to a default.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
