//! The composite configuration object handed to the buffer manager.
//!
//! Every knob has a serde default so a partial document deserializes into a
//! runnable configuration; `validate` catches the combinations that cannot
//! work before anything is built.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

#[derive(Debug, Snafu)]
pub enum BufferBuildError {
    #[snafu(display("`disk_buffer_path` is required when a disk tier is configured"))]
    RequiresDataPath,

    #[snafu(display("failed to open disk buffer: {source}"))]
    DiskOpen { source: crate::disk::DiskBufferError },

    #[snafu(display("`memory_buffer_size` must be greater than zero"))]
    InvalidMemorySize,

    #[snafu(display("`{name}` must be within {min}..={max}, got {value}"))]
    OutOfRange {
        name: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[snafu(display("`min_batch_size` must not exceed `max_batch_size`"))]
    InvalidBatchBounds,
}

fn out_of_range(name: &'static str, min: f64, max: f64, value: f64) -> BufferBuildError {
    BufferBuildError::OutOfRange {
        name,
        min,
        max,
        value,
    }
}

fn check_range(
    name: &'static str,
    min: f64,
    max: f64,
    value: f64,
) -> Result<(), BufferBuildError> {
    ensure!(
        value >= min && value <= max,
        OutOfRangeSnafu {
            name,
            min,
            max,
            value
        }
    );
    Ok(())
}

/// Circuit-breaker knobs (§ downstream handoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failure rate in [0, 1] at which the breaker opens.
    pub failure_threshold: f64,
    /// How long the breaker stays open before probing.
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Successful probes required to close again.
    pub half_open_requests: usize,
    /// Interval for the state gauge refresh.
    #[serde(with = "duration_ms")]
    pub monitoring_interval: Duration,
    /// Evaluation floor: no opening below this many observed requests.
    pub min_requests: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            reset_timeout: Duration::from_millis(30_000),
            half_open_requests: 3,
            monitoring_interval: Duration::from_millis(5_000),
            min_requests: 10,
        }
    }
}

/// Backpressure monitor knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackpressureConfig {
    pub queue_depth_threshold: usize,
    #[serde(with = "duration_ms")]
    pub latency_threshold: Duration,
    /// Error rate in [0, 1].
    pub error_rate_threshold: f64,
    #[serde(with = "duration_ms")]
    pub monitoring_interval: Duration,
    /// Slowly re-center thresholds on observed stable baselines.
    pub adaptive_thresholds: bool,
    /// Hysteresis band: all signals must fall below `threshold *
    /// recovery_factor` before the backpressure flag clears.
    pub recovery_factor: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            queue_depth_threshold: 5_000,
            latency_threshold: Duration::from_millis(1_000),
            error_rate_threshold: 0.1,
            monitoring_interval: Duration::from_millis(1_000),
            adaptive_thresholds: false,
            recovery_factor: 0.8,
        }
    }
}

/// Adaptive batch sizer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveBatchConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub target_latency: Duration,
    /// Multiplicative step, e.g. 0.2 grows or shrinks by 20%.
    pub adjustment_factor: f64,
    #[serde(with = "duration_ms")]
    pub evaluation_interval: Duration,
    /// Events per second the sizer tries to sustain.
    pub throughput_target: f64,
    pub adaptive_enabled: bool,
}

impl Default for AdaptiveBatchConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 100,
            min_batch_size: 10,
            max_batch_size: 1_000,
            target_latency: Duration::from_millis(500),
            adjustment_factor: 0.2,
            evaluation_interval: Duration::from_millis(5_000),
            throughput_target: 10_000.0,
            adaptive_enabled: true,
        }
    }
}

/// Emergency-mode knobs within flow control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmergencyModeConfig {
    pub enabled: bool,
    /// Error rate beyond which active backpressure escalates to emergency
    /// throttling.
    pub trigger_threshold: f64,
    /// Base probability of rejecting an event while in emergency mode.
    pub throttle_rate: f64,
}

impl Default for EmergencyModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_threshold: 0.2,
            throttle_rate: 0.5,
        }
    }
}

/// Flow-control gate knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowControlConfig {
    pub max_events_per_second: f64,
    pub burst_size: f64,
    #[serde(with = "duration_ms")]
    pub sliding_window_size: Duration,
    pub throttle_enabled: bool,
    pub priority_levels: u8,
    pub emergency_mode: EmergencyModeConfig,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_events_per_second: 100_000.0,
            burst_size: 10_000.0,
            sliding_window_size: Duration::from_millis(1_000),
            throttle_enabled: true,
            priority_levels: 5,
            emergency_mode: EmergencyModeConfig::default(),
        }
    }
}

/// Compression codec knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// zstd level, 1..=22.
    pub level: i32,
    /// Payloads below this many bytes are stored raw.
    pub min_size: usize,
    pub dictionary_enabled: bool,
    /// Samples collected before training the dictionary.
    pub dictionary_sample_count: usize,
    pub dictionary_max_size: usize,
    /// Sidecar path for the trained dictionary, so frames written with it
    /// stay decodable across restarts.
    pub dictionary_path: Option<PathBuf>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 3,
            min_size: 1024,
            dictionary_enabled: false,
            dictionary_sample_count: 1_000,
            dictionary_max_size: 16 * 1024,
            dictionary_path: None,
        }
    }
}

/// The composite configuration for the ingestion buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Capacity of the memory ring, in items.
    pub memory_buffer_size: usize,
    /// Capacity of the disk tier, in items.
    pub disk_buffer_size: usize,
    pub disk_buffer_path: Option<PathBuf>,
    pub compression: CompressionConfig,
    /// Memory usage ratio beyond which new enqueues spill straight to disk.
    pub high_water_mark: f64,
    /// Memory usage ratio below which spilling stops.
    pub low_water_mark: f64,
    /// Deliveries attempted before a negatively acknowledged item is
    /// dropped (with a metric), bounding retry loops.
    pub max_delivery_attempts: u32,
    pub circuit_breaker: CircuitBreakerConfig,
    pub backpressure: BackpressureConfig,
    pub adaptive_batch: AdaptiveBatchConfig,
    pub flow_control: FlowControlConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_buffer_size: 10_000,
            disk_buffer_size: 100_000,
            disk_buffer_path: None,
            compression: CompressionConfig::default(),
            high_water_mark: 0.8,
            low_water_mark: 0.5,
            max_delivery_attempts: 3,
            circuit_breaker: CircuitBreakerConfig::default(),
            backpressure: BackpressureConfig::default(),
            adaptive_batch: AdaptiveBatchConfig::default(),
            flow_control: FlowControlConfig::default(),
        }
    }
}

impl BufferConfig {
    /// Check cross-field constraints before building anything.
    pub fn validate(&self) -> Result<(), BufferBuildError> {
        ensure!(self.memory_buffer_size > 0, InvalidMemorySizeSnafu);
        ensure!(
            self.disk_buffer_size == 0 || self.disk_buffer_path.is_some(),
            RequiresDataPathSnafu
        );
        check_range(
            "circuit_breaker.failure_threshold",
            0.0,
            1.0,
            self.circuit_breaker.failure_threshold,
        )?;
        check_range(
            "backpressure.error_rate_threshold",
            0.0,
            1.0,
            self.backpressure.error_rate_threshold,
        )?;
        check_range(
            "backpressure.recovery_factor",
            0.0,
            1.0,
            self.backpressure.recovery_factor,
        )?;
        check_range("high_water_mark", 0.0, 1.0, self.high_water_mark)?;
        check_range("low_water_mark", 0.0, self.high_water_mark, self.low_water_mark)?;
        check_range(
            "flow_control.emergency_mode.trigger_threshold",
            0.0,
            1.0,
            self.flow_control.emergency_mode.trigger_threshold,
        )?;
        check_range(
            "flow_control.emergency_mode.throttle_rate",
            0.0,
            1.0,
            self.flow_control.emergency_mode.throttle_rate,
        )?;
        if self.compression.level < 1 || self.compression.level > 22 {
            return Err(out_of_range(
                "compression.level",
                1.0,
                22.0,
                f64::from(self.compression.level),
            ));
        }
        ensure!(
            self.adaptive_batch.min_batch_size <= self.adaptive_batch.max_batch_size,
            InvalidBatchBoundsSnafu
        );
        Ok(())
    }
}

/// Millisecond (de)serialization for durations, matching the configuration
/// surface (`reset_timeout`, `monitoring_interval`, ... are all in ms).
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_runnable_defaults() {
        let config: BufferConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.memory_buffer_size, 10_000);
        assert!(config.flow_control.throttle_enabled);
        // No disk path in the default document, so a disk tier cannot be
        // validated without one.
        assert!(matches!(
            config.validate(),
            Err(BufferBuildError::RequiresDataPath)
        ));
    }

    #[test]
    fn partial_documents_overlay_defaults() {
        let config: BufferConfig = serde_json::from_str(
            r#"{
                "memory_buffer_size": 64,
                "disk_buffer_size": 0,
                "flow_control": { "max_events_per_second": 500.0, "burst_size": 200.0 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.memory_buffer_size, 64);
        assert_eq!(config.flow_control.max_events_per_second, 500.0);
        assert_eq!(config.flow_control.priority_levels, 5);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<BufferConfig, _> =
            serde_json::from_str(r#"{ "memory_buffre_size": 64 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_thresholds_fail_validation() {
        let mut config = BufferConfig {
            disk_buffer_size: 0,
            ..BufferConfig::default()
        };
        config.circuit_breaker.failure_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(BufferBuildError::OutOfRange { .. })
        ));
    }
}
