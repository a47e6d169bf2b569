// =============================================================================
// error.rs - EVERYTHING THAT CAN GO WRONG, CATEGORIZED
// =============================================================================
//
// The portal is reverse-engineered, the challenge expires when it feels like
// it, and automation sessions occasionally forget how to be automation
// sessions. Every one of those failures gets a name here so the orchestrator
// can decide whether it is an item problem or a whole-run problem.
// =============================================================================

use std::time::Duration;

/// Why a raw case-number string was rejected. Parse errors are reported per
/// item and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("case number is empty")]
    Empty,

    #[error("case number `{0}` does not match <year><type><serial>")]
    Malformed(String),

    #[error("year {0} is outside the supported range")]
    InvalidYear(u32),

    #[error("serial `{0}` is not a positive number of at most 7 digits")]
    InvalidSerial(String),
}

/// The engine-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The portal no longer honors the session cookies. Needs a human with a
    /// fresh challenge answer.
    #[error("portal session expired")]
    SessionExpired,

    #[error("challenge answer rejected by portal")]
    ChallengeRejected,

    /// No session exists at all. Nothing in the run can succeed.
    #[error("no portal session available; solve a challenge first")]
    NoSession,

    #[error("case not found on portal")]
    NotFound,

    #[error("portal error: {0}")]
    Portal(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("browser pool is shut down")]
    PoolShutdown,

    #[error("automation driver error: {0}")]
    Driver(String),

    #[error("concurrency slot not obtained within {0:?}")]
    SlotTimeout(Duration),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("worker panicked inside page scope")]
    WorkerPanicked,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Session-level failures poison every remaining lookup in a run.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            SyncError::SessionExpired | SyncError::ChallengeRejected | SyncError::NoSession
        )
    }

    /// Errors after which the automation handle may be left in a bad state.
    pub fn poisons_handle(&self) -> bool {
        matches!(self, SyncError::Timeout(_) | SyncError::WorkerPanicked)
    }
}
