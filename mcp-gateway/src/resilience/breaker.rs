//! Per-upstream circuit breaker
//!
//! Tracks failures per tool and gates calls through the
//! closed / open / half-open state machine. The registry remains the
//! source of truth for tool *status*; the breaker protects individual
//! call sites and may trip even while the registry says healthy.
//!
//! Transitions are serialized per tool by a short critical section;
//! breakers for different tools are independent.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::time::Duration;
use std::time::Instant;

use crate::config::CircuitConfig;
use crate::error::{Error, Result};

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateKind {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub fn gauge_value(self) -> i64 {
        match self {
            CircuitStateKind::Closed => 0,
            CircuitStateKind::HalfOpen => 1,
            CircuitStateKind::Open => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitStateKind::Closed => "closed",
            CircuitStateKind::Open => "open",
            CircuitStateKind::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct CircuitState {
    kind: CircuitStateKind,
    failure_count: u32,
    window_start: Instant,
    last_transition_at: Instant,
    open_until: Instant,
    trial_in_flight: bool,
}

impl CircuitState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            kind: CircuitStateKind::Closed,
            failure_count: 0,
            window_start: now,
            last_transition_at: now,
            open_until: now,
            trial_in_flight: false,
        }
    }

    fn transition(&mut self, to: CircuitStateKind) {
        tracing::debug!(from = self.kind.as_str(), to = to.as_str(), "Circuit transition");
        self.kind = to;
        self.last_transition_at = Instant::now();
    }
}

type Circuit = Arc<Mutex<CircuitState>>;

fn lock(circuit: &Circuit) -> std::sync::MutexGuard<'_, CircuitState> {
    match circuit.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Point-in-time view of one circuit, for the metrics gauge
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub tool_id: String,
    pub kind: CircuitStateKind,
    pub failure_count: u32,
}

/// Circuit breaker keyed by tool id
pub struct CircuitBreaker {
    circuits: DashMap<String, Circuit>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self { circuits: DashMap::new(), config }
    }

    fn circuit(&self, tool_id: &str) -> Circuit {
        self.circuits
            .entry(tool_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::new())))
            .clone()
    }

    /// Try to acquire a call permit for a tool.
    ///
    /// Open circuits fail fast with `ToolUnavailable` carrying the
    /// remaining cooldown. In half-open, exactly one trial is admitted at
    /// a time; losers fail fast with the half-open hint set so the retry
    /// layer may try again shortly.
    pub fn try_acquire(&self, tool_id: &str) -> Result<CallPermit> {
        let circuit = self.circuit(tool_id);
        let mut state = lock(&circuit);
        let now = Instant::now();

        if state.kind == CircuitStateKind::Open {
            if now >= state.open_until {
                state.transition(CircuitStateKind::HalfOpen);
                state.trial_in_flight = false;
            } else {
                let remaining = state.open_until - now;
                return Err(Error::ToolUnavailable {
                    tool_id: tool_id.to_string(),
                    retry_after: Some(remaining),
                    half_open: false,
                });
            }
        }

        let trial = if state.kind == CircuitStateKind::HalfOpen {
            if state.trial_in_flight {
                return Err(Error::ToolUnavailable {
                    tool_id: tool_id.to_string(),
                    retry_after: None,
                    half_open: true,
                });
            }
            state.trial_in_flight = true;
            true
        } else {
            false
        };

        drop(state);
        Ok(CallPermit {
            circuit,
            config: self.config.clone(),
            tool_id: tool_id.to_string(),
            trial,
            resolved: false,
        })
    }

    /// Current state of one tool's circuit; `Closed` when never used
    pub fn state_of(&self, tool_id: &str) -> CircuitStateKind {
        match self.circuits.get(tool_id) {
            Some(circuit) => {
                let state = lock(&circuit);
                // An expired open circuit is observably half-open
                if state.kind == CircuitStateKind::Open && Instant::now() >= state.open_until {
                    CircuitStateKind::HalfOpen
                } else {
                    state.kind
                }
            }
            None => CircuitStateKind::Closed,
        }
    }

    /// Snapshot all circuits, for the metrics gauge
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.circuits
            .iter()
            .map(|entry| {
                let state = lock(entry.value());
                BreakerSnapshot {
                    tool_id: entry.key().clone(),
                    kind: state.kind,
                    failure_count: state.failure_count,
                }
            })
            .collect()
    }

    /// Forget a tool's circuit, e.g. on deregistration
    pub fn remove(&self, tool_id: &str) {
        self.circuits.remove(tool_id);
    }
}

/// Scoped permission to call a tool.
///
/// Exactly one of `success` or `failure` should be called; dropping the
/// permit without an outcome (cancelled call) releases a half-open trial
/// slot without recording anything.
#[derive(Debug)]
pub struct CallPermit {
    circuit: Circuit,
    config: CircuitConfig,
    tool_id: String,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    pub fn success(mut self) {
        self.resolved = true;
        let mut state = lock(&self.circuit);
        if self.trial {
            state.trial_in_flight = false;
        }
        match state.kind {
            CircuitStateKind::HalfOpen => {
                state.transition(CircuitStateKind::Closed);
                state.failure_count = 0;
                state.window_start = Instant::now();
                tracing::info!(tool = %self.tool_id, "Circuit closed after successful trial");
            }
            CircuitStateKind::Closed => {
                state.failure_count = 0;
                state.window_start = Instant::now();
            }
            CircuitStateKind::Open => {}
        }
    }

    pub fn failure(mut self) {
        self.resolved = true;
        let now = Instant::now();
        let mut state = lock(&self.circuit);
        if self.trial {
            state.trial_in_flight = false;
        }
        match state.kind {
            CircuitStateKind::HalfOpen => {
                state.transition(CircuitStateKind::Open);
                state.open_until = now + self.config.cooldown();
                tracing::warn!(tool = %self.tool_id, "Circuit re-opened after failed trial");
            }
            CircuitStateKind::Closed => {
                // Failures outside the window start a fresh count
                if now.duration_since(state.window_start) > self.config.window() {
                    state.failure_count = 0;
                    state.window_start = now;
                }
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.transition(CircuitStateKind::Open);
                    state.open_until = now + self.config.cooldown();
                    tracing::warn!(
                        tool = %self.tool_id,
                        failures = state.failure_count,
                        "Circuit opened"
                    );
                }
            }
            CircuitStateKind::Open => {}
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            // A trial abandoned without an outcome (cancellation) frees
            // the slot without counting for or against the tool
            let mut state = lock(&self.circuit);
            if state.kind == CircuitStateKind::HalfOpen {
                state.trial_in_flight = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: threshold,
            window_secs: 60,
            cooldown_ms: cooldown.as_millis() as u64,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, Duration::from_millis(500));
        for _ in 0..3 {
            breaker.try_acquire("spec_b").unwrap().failure();
        }
        assert_eq!(breaker.state_of("spec_b"), CircuitStateKind::Open);

        let err = breaker.try_acquire("spec_b").unwrap_err();
        match err {
            Error::ToolUnavailable { retry_after, half_open, .. } => {
                assert!(!half_open);
                assert!(retry_after.unwrap() <= Duration::from_millis(500));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.try_acquire("spec_b").unwrap().failure();

        // Cooldown of zero: the next acquire is the half-open trial
        let trial = breaker.try_acquire("spec_b").unwrap();

        // A second concurrent acquire is rejected with the half-open hint
        match breaker.try_acquire("spec_b").unwrap_err() {
            Error::ToolUnavailable { half_open, .. } => assert!(half_open),
            other => panic!("unexpected error: {other}"),
        }

        trial.success();
        assert_eq!(breaker.state_of("spec_b"), CircuitStateKind::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.try_acquire("spec_b").unwrap().failure();

        let trial = breaker.try_acquire("spec_b").unwrap();
        trial.failure();

        // With zero cooldown the re-opened circuit is observably half-open
        // again; the point is that it did not close
        assert_ne!(breaker.state_of("spec_b"), CircuitStateKind::Closed);
    }

    #[test]
    fn test_dropped_trial_releases_slot() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.try_acquire("spec_b").unwrap().failure();

        {
            let _trial = breaker.try_acquire("spec_b").unwrap();
            // Cancelled before an outcome
        }

        // Slot is free again for the next trial
        let trial = breaker.try_acquire("spec_b").unwrap();
        trial.success();
        assert_eq!(breaker.state_of("spec_b"), CircuitStateKind::Closed);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_millis(500));
        breaker.try_acquire("spec_b").unwrap().failure();
        breaker.try_acquire("spec_b").unwrap().failure();
        breaker.try_acquire("spec_b").unwrap().success();
        breaker.try_acquire("spec_b").unwrap().failure();
        breaker.try_acquire("spec_b").unwrap().failure();
        assert_eq!(breaker.state_of("spec_b"), CircuitStateKind::Closed);
    }

    #[test]
    fn test_tools_are_independent() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.try_acquire("spec_a").unwrap().failure();
        assert_eq!(breaker.state_of("spec_a"), CircuitStateKind::Open);
        assert!(breaker.try_acquire("spec_b").is_ok());
    }

    #[test]
    fn test_never_open_to_closed_directly() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.try_acquire("spec_b").unwrap().failure();
        assert_eq!(breaker.state_of("spec_b"), CircuitStateKind::Open);

        // During cooldown every acquire fails fast
        assert!(breaker.try_acquire("spec_b").is_err());
        std::thread::sleep(Duration::from_millis(30));

        // After cooldown the circuit must pass through half-open
        assert_eq!(breaker.state_of("spec_b"), CircuitStateKind::HalfOpen);
        let trial = breaker.try_acquire("spec_b").unwrap();
        trial.success();
        assert_eq!(breaker.state_of("spec_b"), CircuitStateKind::Closed);
    }
}
