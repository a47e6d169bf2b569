// =============================================================================
// circuit_breaker.rs - PORTAL HEALTH GUARD
// =============================================================================
//
// The portal is abuse-sensitive. When it starts erroring or timing out, the
// worst thing we can do is keep hammering it from four workers at once, so
// every portal call goes through this breaker:
//
//   Closed    calls flow; consecutive health failures are counted
//   Open      calls are refused until the reset timeout elapses
//   HalfOpen  calls are let through as probes; enough successes close it,
//             a single failure re-opens it
//
// Only failures that say something about portal health count. A missing case
// or an expired session is the portal working correctly.
// =============================================================================

use parking_lot::RwLock;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    total_trips: u64,
    rejected_calls: u64,
}

pub struct CircuitBreaker {
    name: String,
    inner: RwLock<BreakerState>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        let name = name.into();
        info!(
            name = %name,
            failure_threshold = failure_threshold,
            reset_timeout_secs = reset_timeout.as_secs(),
            success_threshold = success_threshold,
            "Circuit breaker initialized"
        );

        Self {
            name,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_state_change: Instant::now(),
                total_trips: 0,
                rejected_calls: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Whether a call may go out right now. Moves Open to HalfOpen once the
    /// reset timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    info!(name = %self.name, "Circuit breaker OPEN -> HALF_OPEN, probing portal");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.last_state_change = Instant::now();
                    true
                } else {
                    inner.rejected_calls += 1;
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    info!(
                        name = %self.name,
                        successes = inner.success_count,
                        "Circuit breaker HALF_OPEN -> CLOSED, portal healthy"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.last_state_change = Instant::now();
                }
            }
            // A call admitted before the trip finished late.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        name = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker TRIPPED, CLOSED -> OPEN"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.total_trips += 1;
                    inner.last_state_change = Instant::now();
                } else {
                    warn!(
                        name = %self.name,
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        "Portal failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(name = %self.name, "Probe failed, HALF_OPEN -> OPEN");
                inner.state = CircuitState::Open;
                inner.failure_count = self.failure_threshold;
                inner.opened_at = Some(Instant::now());
                inner.total_trips += 1;
                inner.last_state_change = Instant::now();
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Run one portal call through the breaker.
    pub async fn call<F, T>(&self, work: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        if !self.allow_request() {
            return Err(SyncError::Portal("circuit open".to_string()));
        }
        let result = work.await;
        match &result {
            Err(e) if counts_against_portal(e) => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.read();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_trips: inner.total_trips,
            rejected_calls: inner.rejected_calls,
            time_in_current_state_secs: inner.last_state_change.elapsed().as_secs(),
        }
    }
}

/// Errors that indicate the portal itself is unhealthy.
fn counts_against_portal(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Portal(_)
    )
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_trips: u64,
    pub rejected_calls: u64,
    pub time_in_current_state_secs: u64,
}
