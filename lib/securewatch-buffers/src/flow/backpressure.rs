//! Backpressure monitor: watches queue depth, dispatch latency and error
//! rate, and publishes an active/inactive signal with hysteresis.
//!
//! Publication uses a `watch` channel, so the signal is edge-triggered with
//! last-value semantics: a late subscriber sees the current state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BackpressureConfig;
use crate::internal_events::BackpressureChanged;
use securewatch_common::emit;

/// Dispatches remembered for the moving averages.
const WINDOW_LIMIT: usize = 256;

#[derive(Debug)]
struct Dispatch {
    at: Instant,
    latency: Duration,
    error: bool,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    queue_depth: f64,
    latency: Duration,
    error_rate: f64,
}

/// A point-in-time view of the signals the monitor evaluates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureSnapshot {
    pub queue_depth: usize,
    pub average_latency: Duration,
    pub error_rate: f64,
    pub active: bool,
}

#[derive(Debug)]
struct Shared {
    queue_depth: AtomicUsize,
    window: Mutex<VecDeque<Dispatch>>,
    thresholds: Mutex<Thresholds>,
    active_tx: watch::Sender<bool>,
    active_rx: watch::Receiver<bool>,
}

/// Observes the pipeline and raises the backpressure signal when any of
/// queue depth, latency or error rate crosses its threshold; clears it only
/// once all three fall below the recovery band.
#[derive(Debug, Clone)]
pub struct BackpressureMonitor {
    config: BackpressureConfig,
    shared: Arc<Shared>,
}

impl BackpressureMonitor {
    pub fn new(config: BackpressureConfig) -> Self {
        let (active_tx, active_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue_depth: AtomicUsize::new(0),
            window: Mutex::new(VecDeque::with_capacity(WINDOW_LIMIT)),
            thresholds: Mutex::new(Thresholds {
                queue_depth: config.queue_depth_threshold as f64,
                latency: config.latency_threshold,
                error_rate: config.error_rate_threshold,
            }),
            active_tx,
            active_rx,
        });
        Self { config, shared }
    }

    /// Report the current total queue depth (memory plus disk).
    pub fn set_queue_depth(&self, depth: usize) {
        self.shared.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Record one completed dispatch.
    pub fn record_dispatch(&self, latency: Duration, error: bool) {
        let mut window = self.shared.window.lock();
        if window.len() == WINDOW_LIMIT {
            window.pop_front();
        }
        window.push_back(Dispatch {
            at: Instant::now(),
            latency,
            error,
        });
    }

    pub fn is_active(&self) -> bool {
        *self.shared.active_rx.borrow()
    }

    /// Subscribe to the active/inactive signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.active_rx.clone()
    }

    /// Moving error rate over the dispatch window.
    pub fn error_rate(&self) -> f64 {
        let window = self.shared.window.lock();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().filter(|d| d.error).count() as f64 / window.len() as f64
    }

    pub fn snapshot(&self) -> BackpressureSnapshot {
        let (average_latency, error_rate) = self.window_stats();
        BackpressureSnapshot {
            queue_depth: self.shared.queue_depth.load(Ordering::Relaxed),
            average_latency,
            error_rate,
            active: self.is_active(),
        }
    }

    /// One sampling step: evaluate the signals and flip the flag on edges.
    pub fn evaluate(&self) {
        self.prune_window();
        let depth = self.shared.queue_depth.load(Ordering::Relaxed) as f64;
        let (latency, error_rate) = self.window_stats();
        let thresholds = *self.shared.thresholds.lock();

        let active = *self.shared.active_rx.borrow();
        let next = if active {
            // Hysteresis: all three signals must drop into the recovery band.
            let factor = self.config.recovery_factor;
            !(depth < thresholds.queue_depth * factor
                && latency.as_secs_f64() < thresholds.latency.as_secs_f64() * factor
                && error_rate < thresholds.error_rate * factor)
        } else {
            depth >= thresholds.queue_depth
                || latency >= thresholds.latency
                || error_rate >= thresholds.error_rate
        };

        if next != active {
            self.shared.active_tx.send_replace(next);
            emit(BackpressureChanged {
                active: next,
                queue_depth: depth as usize,
                latency,
                error_rate,
            });
        }

        if self.config.adaptive_thresholds && !next {
            self.adapt_thresholds(depth, latency, error_rate);
        }

        metrics::gauge!("backpressure.active").set(if next { 1.0 } else { 0.0 });
    }

    /// Run the periodic sampling loop until the token cancels.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.monitoring_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => self.evaluate(),
            }
        }
    }

    /// Drift thresholds toward observed stable baselines, bounded to stay
    /// within a factor of two of their configured values.
    fn adapt_thresholds(&self, depth: f64, latency: Duration, error_rate: f64) {
        const ALPHA: f64 = 0.05;
        const HEADROOM: f64 = 1.5;

        let mut thresholds = self.shared.thresholds.lock();

        let drift = |current: f64, observed: f64, floor: f64, ceil: f64| {
            (current + ALPHA * (observed * HEADROOM - current)).clamp(floor, ceil)
        };

        let base_depth = self.config.queue_depth_threshold as f64;
        thresholds.queue_depth = drift(
            thresholds.queue_depth,
            depth,
            base_depth * 0.5,
            base_depth * 2.0,
        );

        let base_latency = self.config.latency_threshold.as_secs_f64();
        thresholds.latency = Duration::from_secs_f64(drift(
            thresholds.latency.as_secs_f64(),
            latency.as_secs_f64(),
            base_latency * 0.5,
            base_latency * 2.0,
        ));

        let base_error = self.config.error_rate_threshold;
        thresholds.error_rate = drift(
            thresholds.error_rate,
            error_rate,
            base_error * 0.5,
            (base_error * 2.0).min(1.0),
        );
    }

    fn window_stats(&self) -> (Duration, f64) {
        let window = self.shared.window.lock();
        if window.is_empty() {
            return (Duration::ZERO, 0.0);
        }
        let total: Duration = window.iter().map(|d| d.latency).sum();
        let errors = window.iter().filter(|d| d.error).count();
        (
            total / u32::try_from(window.len()).unwrap_or(u32::MAX),
            errors as f64 / window.len() as f64,
        )
    }

    fn prune_window(&self) {
        // Dispatches older than ten monitoring intervals no longer describe
        // the present; drop them so an idle pipeline recovers.
        let horizon = self.config.monitoring_interval * 10;
        let now = Instant::now();
        let mut window = self.shared.window.lock();
        while window
            .front()
            .is_some_and(|d| now.duration_since(d.at) > horizon)
        {
            window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            queue_depth_threshold: 800,
            latency_threshold: Duration::from_millis(1_000),
            error_rate_threshold: 0.1,
            monitoring_interval: Duration::from_millis(100),
            adaptive_thresholds: false,
            recovery_factor: 0.8,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn activates_on_queue_depth_edge() {
        let monitor = BackpressureMonitor::new(config());
        let mut rx = monitor.subscribe();

        monitor.set_queue_depth(900);
        monitor.evaluate();
        assert!(monitor.is_active());
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn clears_only_below_recovery_band() {
        let monitor = BackpressureMonitor::new(config());
        monitor.set_queue_depth(900);
        monitor.evaluate();
        assert!(monitor.is_active());

        // Below threshold but above threshold * recovery_factor: stays on.
        monitor.set_queue_depth(700);
        monitor.evaluate();
        assert!(monitor.is_active());

        monitor.set_queue_depth(500);
        monitor.evaluate();
        assert!(!monitor.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn error_rate_triggers() {
        let monitor = BackpressureMonitor::new(config());
        for i in 0..20 {
            monitor.record_dispatch(Duration::from_millis(10), i % 5 == 0);
        }
        monitor.evaluate();
        // 4 errors in 20 dispatches = 0.2 >= 0.1.
        assert!(monitor.is_active());
        assert!((monitor.error_rate() - 0.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_triggers() {
        let monitor = BackpressureMonitor::new(config());
        for _ in 0..10 {
            monitor.record_dispatch(Duration::from_millis(1_500), false);
        }
        monitor.evaluate();
        assert!(monitor.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_sees_current_state() {
        let monitor = BackpressureMonitor::new(config());
        monitor.set_queue_depth(10_000);
        monitor.evaluate();

        let rx = monitor.subscribe();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_thresholds_stay_bounded() {
        let monitor = BackpressureMonitor::new(BackpressureConfig {
            adaptive_thresholds: true,
            ..config()
        });
        // A long quiet stretch drifts the depth threshold down toward the
        // observed baseline, but never below half the configured value.
        for _ in 0..1_000 {
            monitor.set_queue_depth(0);
            monitor.evaluate();
        }
        let thresholds = monitor.shared.thresholds.lock();
        assert!(thresholds.queue_depth >= 400.0);
    }
}
