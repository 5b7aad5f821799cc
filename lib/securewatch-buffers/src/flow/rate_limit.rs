//! The admission gate: a token bucket chained with a sliding-window rate
//! cap, plus a priority-aware emergency throttle driven by the backpressure
//! monitor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use crate::config::FlowControlConfig;
use crate::internal_events::EventsThrottled;
use securewatch_common::emit;
use securewatch_event::Priority;

/// Per-priority admission counters.
#[derive(Debug, Default)]
pub struct PriorityCounters {
    pub allowed: AtomicU64,
    pub throttled: AtomicU64,
}

#[derive(Debug)]
struct GateState {
    /// Fractional tokens are carried between refills.
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: f64,
    window: VecDeque<(Instant, u64)>,
    window_total: u64,
}

impl GateState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn prune_window(&mut self, now: Instant, span: Duration) {
        while self
            .window
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > span)
        {
            let (_, count) = self.window.pop_front().expect("front checked");
            self.window_total -= count;
        }
    }
}

/// Gate through which every enqueue must pass.
#[derive(Debug)]
pub struct FlowControlGate {
    config: FlowControlConfig,
    state: Mutex<GateState>,
    emergency: AtomicBool,
    counters: [PriorityCounters; 5],
}

impl FlowControlGate {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            state: Mutex::new(GateState {
                tokens: config.burst_size,
                last_refill: Instant::now(),
                rate: config.max_events_per_second,
                burst: config.burst_size,
                window: VecDeque::new(),
                window_total: 0,
            }),
            emergency: AtomicBool::new(false),
            counters: std::array::from_fn(|_| PriorityCounters::default()),
            config,
        }
    }

    /// Ask to admit `count` events at the given priority.
    ///
    /// Denial is a value, not an error; the caller surfaces it as
    /// `Throttled` and the events stay with the caller.
    pub fn request_permission(&self, count: usize, priority: Priority) -> bool {
        if !self.config.throttle_enabled {
            self.record(priority, count, true);
            return true;
        }

        if self.emergency.load(Ordering::Relaxed) && self.emergency_rejects(priority) {
            self.record(priority, count, false);
            return false;
        }

        let now = Instant::now();
        let needed = count as f64;
        let mut state = self.state.lock();
        state.refill(now);
        state.prune_window(now, self.config.sliding_window_size);

        if state.tokens < needed {
            drop(state);
            self.record(priority, count, false);
            return false;
        }

        // Second gate: the windowed rate must stay under the cap even when
        // the bucket still has burst capacity.
        let window_secs = self.config.sliding_window_size.as_secs_f64().max(1e-3);
        let projected = (state.window_total + count as u64) as f64 / window_secs;
        if projected > state.rate {
            drop(state);
            self.record(priority, count, false);
            return false;
        }

        state.tokens -= needed;
        state.window.push_back((now, count as u64));
        state.window_total += count as u64;
        drop(state);

        self.record(priority, count, true);
        true
    }

    /// Flip emergency mode. Driven by the backpressure monitor; cannot be
    /// entered when the feature is disabled.
    pub fn set_emergency(&self, active: bool) {
        if !self.config.emergency_mode.enabled {
            return;
        }
        let was = self.emergency.swap(active, Ordering::Relaxed);
        if was != active {
            if active {
                warn!(message = "Emergency throttling engaged.");
            } else {
                info!(message = "Emergency throttling cleared.");
            }
            metrics::gauge!("flow_control.emergency_active")
                .set(if active { 1.0 } else { 0.0 });
        }
    }

    pub fn is_emergency_active(&self) -> bool {
        self.emergency.load(Ordering::Relaxed)
    }

    pub fn adjust_rate_limit(&self, events_per_second: f64) {
        let mut state = self.state.lock();
        state.rate = events_per_second.max(0.0);
        debug!(message = "Rate limit adjusted.", rate = state.rate);
    }

    pub fn adjust_burst_size(&self, burst: f64) {
        let mut state = self.state.lock();
        state.burst = burst.max(0.0);
        state.tokens = state.tokens.min(state.burst);
        debug!(message = "Burst size adjusted.", burst = state.burst);
    }

    /// Admitted events per second over the sliding window.
    pub fn current_rate(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune_window(now, self.config.sliding_window_size);
        let rate = state.window_total as f64 / self.config.sliding_window_size.as_secs_f64();
        metrics::gauge!("flow_control.current_rate").set(rate);
        rate
    }

    /// Tokens currently in the bucket, after refill.
    pub fn available_tokens(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.refill(now);
        metrics::gauge!("flow_control.token_bucket_tokens").set(state.tokens);
        state.tokens
    }

    pub fn counters(&self, priority: Priority) -> &PriorityCounters {
        &self.counters[usize::from(priority.get()) - 1]
    }

    pub fn total_throttled(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.throttled.load(Ordering::Relaxed))
            .sum()
    }

    /// Restore the gate to its configured starting point.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.config.burst_size;
        state.rate = self.config.max_events_per_second;
        state.burst = self.config.burst_size;
        state.last_refill = Instant::now();
        state.window.clear();
        state.window_total = 0;
        drop(state);
        self.emergency.store(false, Ordering::Relaxed);
        for counters in &self.counters {
            counters.allowed.store(0, Ordering::Relaxed);
            counters.throttled.store(0, Ordering::Relaxed);
        }
    }

    /// Probability-based rejection under emergency mode: priority 1-2 at
    /// half the base throttle rate, 3 at the base rate, 4-5 at 1.5x.
    fn emergency_rejects(&self, priority: Priority) -> bool {
        let multiplier = match priority.get() {
            0..=2 => 0.5,
            3 => 1.0,
            _ => 1.5,
        };
        let reject_probability =
            (self.config.emergency_mode.throttle_rate * multiplier).clamp(0.0, 1.0);
        rand::rng().random::<f64>() < reject_probability
    }

    fn record(&self, priority: Priority, count: usize, allowed: bool) {
        let counters = self.counters(priority);
        if allowed {
            counters
                .allowed
                .fetch_add(count as u64, Ordering::Relaxed);
            metrics::counter!("flow_control.events_allowed", "priority" => priority.to_string())
                .increment(count as u64);
        } else {
            counters
                .throttled
                .fetch_add(count as u64, Ordering::Relaxed);
            emit(EventsThrottled { count, priority });
        }
    }
}
