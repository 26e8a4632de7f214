//! Circuit breaker shared by the policy client and the transport pools.
//!
//! ```text
//! ┌────────┐  failure_threshold  ┌──────┐  recovery_timeout  ┌──────────┐
//! │ Closed │ ──────reached─────→ │ Open │ ────elapsed─────→  │ HalfOpen │
//! └────────┘                     └──────┘ ←──trial fails──── └──────────┘
//!      ↑                                                          │
//!      └──────────────────────── trial succeeds ──────────────────┘
//! ```
//!
//! Callers obtain a [`BreakerPermit`] before touching the dependency and
//! settle it with [`BreakerPermit::success`] or [`BreakerPermit::failure`].
//! In half-open exactly one permit (the trial) is handed out; everybody else
//! fails fast until that trial settles. A trial permit dropped without a
//! report frees the trial slot without changing state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default number of consecutive failures before opening the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default duration the circuit stays open before allowing a trial call.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls are rejected without touching the dependency.
    Open,
    /// The recovery timeout elapsed; one trial call decides the next state.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    pub recovery_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
        }
    }
}

/// Returned by [`CircuitBreaker::try_acquire`] when the call must fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is {state}")]
pub struct BreakerOpen {
    /// State observed when the call was rejected.
    pub state: CircuitState,
}

/// A snapshot of breaker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerMetrics {
    /// Current state (an elapsed open circuit reports as half-open).
    pub state: CircuitState,
    /// Current consecutive failure count.
    pub failure_count: u32,
    /// Trial calls handed out since creation.
    pub trial_count: u64,
    /// Calls rejected without touching the dependency.
    pub fast_fail_count: u64,
    /// State transitions since creation.
    pub transitions: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trial_count: u64,
    fast_fail_count: u64,
    transitions: u64,
}

/// Linearizable circuit breaker for one dependency.
///
/// All transitions happen under a single `parking_lot::Mutex` with no I/O in
/// the critical section, so concurrent reports never lose updates.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker. `name` only appears in logs.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
                trial_count: 0,
                fast_fail_count: 0,
                transitions: 0,
            }),
        }
    }

    /// Ask permission to call the dependency.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerOpen`] while the circuit is open, or while a
    /// half-open trial is already in flight. The rejection is counted.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerOpen> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.settings.recovery_timeout);
                if !elapsed {
                    inner.fast_fail_count = inner.fast_fail_count.saturating_add(1);
                    return Err(BreakerOpen {
                        state: CircuitState::Open,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.transitions = inner.transitions.saturating_add(1);
                tracing::info!(
                    breaker = %self.name,
                    previous_state = "open",
                    new_state = "half_open",
                    "circuit breaker allowing trial call",
                );
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.fast_fail_count = inner.fast_fail_count.saturating_add(1);
                    return Err(BreakerOpen {
                        state: CircuitState::HalfOpen,
                    });
                }
                true
            }
        };

        if trial {
            inner.trial_in_flight = true;
            inner.trial_count = inner.trial_count.saturating_add(1);
        }

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    /// Current state. An open circuit whose recovery timeout elapsed reports
    /// as half-open; the actual transition happens on the next acquire.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        self.peek(&inner)
    }

    /// Snapshot of the breaker counters.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        BreakerMetrics {
            state: self.peek(&inner),
            failure_count: inner.failure_count,
            trial_count: inner.trial_count,
            fast_fail_count: inner.fast_fail_count,
            transitions: inner.transitions,
        }
    }

    fn peek(&self, inner: &Inner) -> CircuitState {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.settings.recovery_timeout => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                inner.transitions = inner.transitions.saturating_add(1);
                tracing::info!(
                    breaker = %self.name,
                    previous_state = "half_open",
                    new_state = "closed",
                    "circuit breaker closed after successful trial",
                );
            }
            // Late report from a call admitted before the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.transitions = inner.transitions.saturating_add(1);
                    tracing::warn!(
                        breaker = %self.name,
                        failure_count = inner.failure_count,
                        recovery_timeout_ms = u64::try_from(self.settings.recovery_timeout.as_millis()).unwrap_or(u64::MAX),
                        "circuit breaker opened after consecutive failures",
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                inner.transitions = inner.transitions.saturating_add(1);
                tracing::warn!(
                    breaker = %self.name,
                    previous_state = "half_open",
                    new_state = "open",
                    "circuit breaker re-opened after failed trial",
                );
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
#[derive(Debug)]
#[must_use = "an unsettled permit does not update the breaker"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report that the call succeeded.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Report that the call failed in a way that reflects dependency health.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}
