//! The SecureWatch ingestion buffer.
//!
//! A two-tier memory-plus-disk queue with optional compression, fronted by a
//! flow-control gate and backed by a circuit breaker on the downstream side,
//! guaranteeing at-least-once handoff under bursts and sink outages.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

#[macro_use]
extern crate tracing;

pub mod compression;
pub mod config;
pub mod disk;
pub mod flow;
mod internal_events;
pub mod manager;
pub mod ring;

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use compression::{CompressionStats, Compressor, PayloadEncoding};
pub use config::{
    AdaptiveBatchConfig, BackpressureConfig, BufferBuildError, BufferConfig, CircuitBreakerConfig,
    CompressionConfig, EmergencyModeConfig, FlowControlConfig,
};
pub use disk::{DiskBuffer, DiskBufferError};
pub use flow::{
    AdaptiveBatchSizer, BackpressureMonitor, CircuitBreaker, CircuitBreakerError, CircuitState,
    FlowControlGate,
};
pub use manager::{Batch, BufferManager, DequeueError, EnqueueError};
pub use ring::CircularBuffer;

use securewatch_event::Priority;

/// An item that can be buffered: serializable for the disk tier, and safe to
/// move across the worker tasks that drain the queue.
pub trait Bufferable:
    Serialize + DeserializeOwned + Debug + Clone + Send + Sync + Unpin + 'static
{
}

impl<T> Bufferable for T where
    T: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + Unpin + 'static
{
}

/// A payload wrapped with the bookkeeping the queue needs: priority band,
/// enqueue time, and how many delivery attempts it has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedItem<T> {
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub payload: T,
    pub attempts: u32,
}

impl<T> BufferedItem<T> {
    pub fn new(payload: T, priority: Priority) -> Self {
        Self {
            priority,
            enqueued_at: Utc::now(),
            payload,
            attempts: 0,
        }
    }
}
