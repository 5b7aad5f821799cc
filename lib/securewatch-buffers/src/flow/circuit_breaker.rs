//! Three-state circuit breaker around the downstream sink.

use std::future::Future;

use parking_lot::Mutex;
use snafu::Snafu;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::internal_events::CircuitBreakerStateChange;
use securewatch_common::emit;

/// Breaker state. `gauge_value` is the wire encoding for the state gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 1.0,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum CircuitBreakerError<E>
where
    E: std::error::Error + 'static,
{
    /// The breaker is open; the call was rejected without running.
    #[snafu(display("circuit breaker is open"))]
    Open,

    /// The breaker is half-open and the probe budget is spent.
    #[snafu(display("circuit breaker probe budget exceeded"))]
    ProbeExceeded,

    /// The operation itself failed; the failure was recorded.
    #[snafu(display("operation failed: {source}"))]
    Operation { source: E },
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    requests: u64,
    failures: u64,
    last_failure_at: Option<Instant>,
    probes_issued: usize,
    probe_successes: usize,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            last_failure_at: None,
            probes_issued: 0,
            probe_successes: 0,
        }
    }

    fn reset_counts(&mut self) {
        self.requests = 0;
        self.failures = 0;
        self.probes_issued = 0;
        self.probe_successes = 0;
    }
}

/// Guard around downstream handoff: fails fast while the sink is known bad,
/// probes it after a cool-down, closes again once probes succeed.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    state_tx: watch::Sender<CircuitState>,
    state_rx: watch::Receiver<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(CircuitState::Closed);
        Self {
            config,
            state: Mutex::new(BreakerState::new()),
            state_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Subscribe to state changes. Late subscribers see the current state.
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Run `op` through the breaker, recording its outcome.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.admit()?;

        metrics::counter!("circuit_breaker.requests_total").increment(1);
        match op().await {
            Ok(value) => {
                self.record_success();
                metrics::counter!("circuit_breaker.requests_success").increment(1);
                Ok(value)
            }
            Err(source) => {
                self.record_failure();
                metrics::counter!("circuit_breaker.requests_failure").increment(1);
                Err(CircuitBreakerError::Operation { source })
            }
        }
    }

    /// Force-close the breaker and clear all counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let previous = state.state;
        state.reset_counts();
        state.last_failure_at = None;
        if previous != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>>
    where
        E: std::error::Error + 'static,
    {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.requests += 1;
                Ok(())
            }
            CircuitState::Open => {
                let cooled_down = state
                    .last_failure_at
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if cooled_down {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    state.probes_issued = 1;
                    state.probe_successes = 0;
                    Ok(())
                } else {
                    metrics::counter!("circuit_breaker.requests_rejected").increment(1);
                    Err(CircuitBreakerError::Open)
                }
            }
            CircuitState::HalfOpen => {
                if state.probes_issued < self.config.half_open_requests {
                    state.probes_issued += 1;
                    Ok(())
                } else {
                    metrics::counter!("circuit_breaker.requests_rejected").increment(1);
                    Err(CircuitBreakerError::ProbeExceeded)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::HalfOpen => {
                state.probe_successes += 1;
                if state.probe_successes >= self.config.half_open_requests {
                    state.reset_counts();
                    state.last_failure_at = None;
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.last_failure_at = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.failures += 1;
                let failure_rate = state.failures as f64 / state.requests.max(1) as f64;
                if state.requests >= self.config.min_requests as u64
                    && failure_rate >= self.config.failure_threshold
                {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            // Any probe failure re-opens immediately.
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        self.state_tx.send_replace(to);
        emit(CircuitBreakerStateChange { from, to });
    }
}
