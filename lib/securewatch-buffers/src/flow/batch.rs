//! Adaptive batch sizer: a target-latency adjuster that grows or shrinks
//! the dequeue batch within configured bounds.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::AdaptiveBatchConfig;

#[derive(Debug, Clone, Copy)]
struct BatchSample {
    at: Instant,
    latency: Duration,
    count: usize,
}

#[derive(Debug)]
struct SizerState {
    current: usize,
    samples: VecDeque<BatchSample>,
    last_evaluation: Instant,
}

/// Produces the size of the next dequeue batch.
///
/// Latency above target shrinks the batch by `adjustment_factor`; latency
/// under target with throughput below `throughput_target` grows it by the
/// same factor. Disabled mode always returns the initial size.
#[derive(Debug)]
pub struct AdaptiveBatchSizer {
    config: AdaptiveBatchConfig,
    state: Mutex<SizerState>,
}

impl AdaptiveBatchSizer {
    pub fn new(config: AdaptiveBatchConfig) -> Self {
        let initial = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        Self {
            state: Mutex::new(SizerState {
                current: initial,
                samples: VecDeque::new(),
                last_evaluation: Instant::now(),
            }),
            config,
        }
    }

    /// The size the next batch should use.
    pub fn current_size(&self) -> usize {
        if !self.config.adaptive_enabled {
            return self.config.initial_batch_size;
        }
        self.state.lock().current
    }

    /// Record a completed batch; evaluates when the interval has elapsed.
    pub fn record_batch(&self, latency: Duration, count: usize) {
        if !self.config.adaptive_enabled {
            return;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        state.samples.push_back(BatchSample {
            at: now,
            latency,
            count,
        });
        // Keep only samples young enough to matter for the next evaluation.
        let horizon = self.config.evaluation_interval * 4;
        while state
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.at) > horizon)
        {
            state.samples.pop_front();
        }

        if now.duration_since(state.last_evaluation) >= self.config.evaluation_interval {
            self.evaluate(&mut state, now);
        }
    }

    /// Latency and throughput normalized against their targets, in [0, 1].
    pub fn performance_score(&self) -> f64 {
        let state = self.state.lock();
        let Some((latency, throughput)) = observed(&state.samples) else {
            return 1.0;
        };
        let latency_score = if latency.is_zero() {
            1.0
        } else {
            (self.config.target_latency.as_secs_f64() / latency.as_secs_f64()).clamp(0.0, 1.0)
        };
        let throughput_score = if self.config.throughput_target <= 0.0 {
            1.0
        } else {
            (throughput / self.config.throughput_target).clamp(0.0, 1.0)
        };
        let score = (latency_score + throughput_score) / 2.0;
        metrics::gauge!("adaptive_batch.performance_score").set(score);
        score
    }

    fn evaluate(&self, state: &mut SizerState, now: Instant) {
        state.last_evaluation = now;
        let Some((latency, throughput)) = observed(&state.samples) else {
            return;
        };

        let factor = self.config.adjustment_factor;
        let current = state.current as f64;
        let next = if latency > self.config.target_latency {
            current * (1.0 - factor)
        } else if throughput < self.config.throughput_target {
            current * (1.0 + factor)
        } else {
            current
        };

        let next = (next.round() as usize)
            .clamp(self.config.min_batch_size, self.config.max_batch_size);
        if next != state.current {
            debug!(
                message = "Adaptive batch size adjusted.",
                from = state.current,
                to = next,
                mean_latency_ms = latency.as_millis() as u64,
                throughput = throughput as u64,
            );
            state.current = next;
        }
        metrics::gauge!("adaptive_batch.current_size").set(state.current as f64);
    }
}

/// Mean latency and events-per-second over the sample window.
fn observed(samples: &VecDeque<BatchSample>) -> Option<(Duration, f64)> {
    let (first, last) = (samples.front()?, samples.back()?);
    let total_latency: Duration = samples.iter().map(|s| s.latency).sum();
    let mean_latency = total_latency / u32::try_from(samples.len()).unwrap_or(u32::MAX);

    let events: usize = samples.iter().map(|s| s.count).sum();
    let span = last
        .at
        .duration_since(first.at)
        .max(Duration::from_millis(1));
    let throughput = events as f64 / span.as_secs_f64();
    Some((mean_latency, throughput))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdaptiveBatchConfig {
        AdaptiveBatchConfig {
            initial_batch_size: 100,
            min_batch_size: 10,
            max_batch_size: 500,
            target_latency: Duration::from_millis(100),
            adjustment_factor: 0.2,
            evaluation_interval: Duration::from_millis(1_000),
            throughput_target: 1_000.0,
            adaptive_enabled: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shrinks_when_latency_exceeds_target() {
        let sizer = AdaptiveBatchSizer::new(config());
        for _ in 0..5 {
            sizer.record_batch(Duration::from_millis(300), 100);
            tokio::time::advance(Duration::from_millis(300)).await;
        }
        assert_eq!(sizer.current_size(), 80);
    }

    #[tokio::test(start_paused = true)]
    async fn grows_when_under_target_and_throughput_low() {
        let sizer = AdaptiveBatchSizer::new(config());
        for _ in 0..5 {
            sizer.record_batch(Duration::from_millis(10), 50);
            tokio::time::advance(Duration::from_millis(300)).await;
        }
        assert_eq!(sizer.current_size(), 120);
    }

    #[tokio::test(start_paused = true)]
    async fn size_stays_within_bounds() {
        let sizer = AdaptiveBatchSizer::new(config());
        // Persistent overload cannot push below min_batch_size.
        for _ in 0..200 {
            sizer.record_batch(Duration::from_millis(5_000), 10);
            tokio::time::advance(Duration::from_millis(1_100)).await;
        }
        assert_eq!(sizer.current_size(), 10);

        // Persistent underload cannot push above max_batch_size.
        let sizer = AdaptiveBatchSizer::new(config());
        for _ in 0..200 {
            sizer.record_batch(Duration::from_millis(1), 1);
            tokio::time::advance(Duration::from_millis(1_100)).await;
        }
        assert_eq!(sizer.current_size(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_mode_returns_initial_size() {
        let sizer = AdaptiveBatchSizer::new(AdaptiveBatchConfig {
            adaptive_enabled: false,
            ..config()
        });
        for _ in 0..10 {
            sizer.record_batch(Duration::from_millis(5_000), 10);
            tokio::time::advance(Duration::from_millis(1_100)).await;
        }
        assert_eq!(sizer.current_size(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn performance_score_reflects_health() {
        let sizer = AdaptiveBatchSizer::new(config());
        assert!((sizer.performance_score() - 1.0).abs() < f64::EPSILON);

        // On-target latency and throughput score near 1.0.
        for _ in 0..10 {
            sizer.record_batch(Duration::from_millis(50), 200);
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert!(sizer.performance_score() > 0.9);
    }
}
