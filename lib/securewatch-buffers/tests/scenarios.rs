//! End-to-end scenarios for the ingestion buffer: burst admission, breaker
//! behavior around a failing sink, emergency throttling under backpressure,
//! and disk recovery across a crash.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::tempdir;

use securewatch_buffers::{
    BackpressureMonitor, BufferConfig, BufferManager, CircuitBreaker, CircuitBreakerError,
    CircuitState, EnqueueError, FlowControlGate,
};
use securewatch_common::OpContext;
use securewatch_event::Priority;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    seq: u64,
    body: String,
}

fn record(seq: u64) -> Record {
    Record {
        seq,
        body: format!("event-{seq}"),
    }
}

fn base_config(dir: &std::path::Path) -> BufferConfig {
    let mut config = BufferConfig {
        memory_buffer_size: 2_000,
        disk_buffer_size: 10_000,
        disk_buffer_path: Some(dir.join("buffer.log")),
        ..BufferConfig::default()
    };
    config.adaptive_batch.adaptive_enabled = false;
    config.adaptive_batch.initial_batch_size = 100;
    config
}

// Scenario: 1,000 records at priority 3 against a 500/s limit with a burst
// of 200. The burst is admitted immediately, throttling starts only after
// bucket exhaustion, and nothing admitted is lost.
#[tokio::test]
async fn burst_admission_then_throttling_without_loss() {
    let dir = tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.flow_control.max_events_per_second = 500.0;
    config.flow_control.burst_size = 200.0;

    let manager: Arc<BufferManager<Record>> = BufferManager::initialize(config).await.unwrap();
    let ctx = OpContext::unbounded();

    let mut admitted = 0u64;
    let mut first_throttle_at = None;
    for seq in 0..1_000u64 {
        match manager.enqueue(vec![record(seq)], Priority::default(), &ctx).await {
            Ok(_) => admitted += 1,
            Err(EnqueueError::Throttled { .. }) => {
                first_throttle_at.get_or_insert(seq);
            }
            Err(other) => panic!("unexpected enqueue error: {other}"),
        }
    }

    // The burst admits the first 200 immediately; the tight loop outruns
    // the 500/s refill, so throttling starts only after bucket exhaustion.
    assert!(matches!(first_throttle_at, Some(n) if n >= 200));
    assert!(admitted >= 200);
    assert!(manager.flow_control().total_throttled() > 0);

    // No admitted event was lost across the two tiers.
    assert_eq!(manager.total_len() as u64, admitted);

    let mut drained = 0u64;
    while drained < admitted {
        let batch = manager.dequeue_batch(&ctx).await.unwrap();
        drained += batch.len() as u64;
        manager.acknowledge(batch, true).await;
    }
    assert_eq!(manager.total_len(), 0);
}

// Scenario: ten consecutive sink failures trip the breaker; the next
// dispatch fails fast; after the reset timeout a probe is admitted and
// enough successes close it again.
#[tokio::test]
async fn breaker_opens_probes_and_recovers() {
    let dir = tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.circuit_breaker.min_requests = 10;
    config.circuit_breaker.failure_threshold = 0.5;
    config.circuit_breaker.reset_timeout = Duration::from_millis(50);
    config.circuit_breaker.half_open_requests = 2;

    let manager: Arc<BufferManager<Record>> = BufferManager::initialize(config).await.unwrap();
    let breaker: &CircuitBreaker = manager.circuit_breaker();

    #[derive(Debug, snafu::Snafu)]
    #[snafu(display("sink unavailable"))]
    struct SinkDown;

    for _ in 0..10 {
        let _ = breaker.execute(|| async { Err::<(), _>(SinkDown) }).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(manager.is_circuit_breaker_open());

    let rejected = breaker.execute(|| async { Ok::<_, SinkDown>(()) }).await;
    assert!(matches!(rejected, Err(CircuitBreakerError::Open)));

    tokio::time::sleep(Duration::from_millis(60)).await;

    breaker
        .execute(|| async { Ok::<_, SinkDown>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker
        .execute(|| async { Ok::<_, SinkDown>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// Scenario: queue depth driven past its threshold activates backpressure;
// a high error rate escalates to emergency throttling where priority-1
// events keep flowing and priority-5 events are rejected at 1.5x the base
// rate.
#[tokio::test]
async fn backpressure_escalates_to_priority_aware_emergency() {
    let mut backpressure = securewatch_buffers::BackpressureConfig::default();
    backpressure.queue_depth_threshold = 800;
    backpressure.error_rate_threshold = 0.1;

    let monitor = BackpressureMonitor::new(backpressure);
    let mut flow = securewatch_buffers::FlowControlConfig::default();
    flow.max_events_per_second = 1_000_000.0;
    flow.burst_size = 1_000_000.0;
    flow.emergency_mode.trigger_threshold = 0.2;
    flow.emergency_mode.throttle_rate = 0.5;
    let gate = FlowControlGate::new(flow);

    // Emergency mode cannot engage while backpressure is inactive: the
    // coupling below only sets it on an active signal.
    monitor.set_queue_depth(900);
    for _ in 0..20 {
        monitor.record_dispatch(Duration::from_millis(5), true);
    }
    monitor.evaluate();
    assert!(monitor.is_active());

    // The manager's coupling: active signal plus error rate beyond the
    // trigger engages emergency throttling.
    if monitor.is_active() && monitor.error_rate() > 0.2 {
        gate.set_emergency(true);
    }
    assert!(gate.is_emergency_active());

    let trials = 4_000u32;
    let mut p1_admitted = 0u32;
    let mut p5_admitted = 0u32;
    for _ in 0..trials {
        if gate.request_permission(1, Priority::new(1)) {
            p1_admitted += 1;
        }
        if gate.request_permission(1, Priority::new(5)) {
            p5_admitted += 1;
        }
    }
    // Reject probabilities: 0.25 for priority 1, 0.75 for priority 5.
    let p1_rate = f64::from(p1_admitted) / f64::from(trials);
    let p5_rate = f64::from(p5_admitted) / f64::from(trials);
    assert!(p1_rate > 0.6, "priority 1 starved: {p1_rate}");
    assert!(p5_rate < 0.4, "priority 5 under-throttled: {p5_rate}");
    let p1_reject = 1.0 - p1_rate;
    let p5_reject = 1.0 - p5_rate;
    assert!(
        p5_reject > p1_reject * 1.5,
        "priority bias too weak: {p1_reject} vs {p5_reject}"
    );

    // Backpressure clearing clears emergency mode. Enough clean dispatches
    // push the errors out of the moving window entirely.
    monitor.set_queue_depth(0);
    for _ in 0..300 {
        monitor.record_dispatch(Duration::from_millis(1), false);
    }
    monitor.evaluate();
    if !monitor.is_active() {
        gate.set_emergency(false);
    }
    assert!(!gate.is_emergency_active());
}

// Scenario: 50 durable items written, process "crashes", restart recovers
// all 50 byte-identical through decompression, and the buffer is empty
// afterwards.
#[tokio::test]
async fn disk_tier_recovers_after_crash() {
    let dir = tempdir().unwrap();
    let mut config = base_config(dir.path());
    // Payloads above the compression threshold exercise the zstd path.
    config.compression.min_size = 64;

    let originals: Vec<Record> = (0..50)
        .map(|seq| Record {
            seq,
            body: "auth failure for user admin from 203.0.113.5 ".repeat(8),
        })
        .collect();

    {
        let manager: Arc<BufferManager<Record>> =
            BufferManager::initialize(config.clone()).await.unwrap();
        let ctx = OpContext::unbounded();
        manager
            .enqueue(originals.clone(), Priority::new(1), &ctx)
            .await
            .unwrap();
        assert_eq!(manager.total_len(), 50);
        // Dropped without close: the crash boundary.
    }

    let manager: Arc<BufferManager<Record>> = BufferManager::initialize(config).await.unwrap();
    assert_eq!(manager.total_len(), 50);

    let ctx = OpContext::unbounded();
    let mut recovered = Vec::new();
    while recovered.len() < 50 {
        let batch = manager.dequeue_batch(&ctx).await.unwrap();
        recovered.extend(batch.payloads().cloned());
        manager.acknowledge(batch, true).await;
    }
    assert_eq!(recovered, originals);
    assert_eq!(manager.total_len(), 0);
}
