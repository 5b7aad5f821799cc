//! The buffer manager: composes the memory ring, disk overflow, compression
//! codec, flow-control gate, adaptive batch sizer, circuit breaker and
//! backpressure monitor into the ingestion queue surface.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::compression::Compressor;
use crate::config::{BufferBuildError, BufferConfig};
use crate::disk::{DiskBuffer, DiskBufferError};
use crate::flow::{AdaptiveBatchSizer, BackpressureMonitor, CircuitBreaker, FlowControlGate};
use crate::internal_events::{
    BufferEventsDropped, BufferEventsReceived, BufferEventsSent,
};
use crate::ring::CircularBuffer;
use crate::{Bufferable, BufferedItem};
use securewatch_common::{emit, Interrupted, OpContext};
use securewatch_event::Priority;

const STATE_CREATED: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Snafu)]
pub enum EnqueueError {
    /// Flow control refused admission. The events stay with the caller.
    #[snafu(display("flow control throttled {count} events"))]
    Throttled { count: usize },

    /// The disk tier is full; the enqueue was aborted.
    #[snafu(display("disk buffer rejected the write: {source}"))]
    Disk { source: DiskBufferError },

    #[snafu(display("buffer manager is not ready"))]
    NotReady,

    #[snafu(display("enqueue interrupted: {source}"))]
    EnqueueInterrupted { source: Interrupted },

    #[snafu(display("failed to encode item for the disk tier: {source}"))]
    Encode { source: serde_json::Error },
}

#[derive(Debug, Snafu)]
pub enum DequeueError {
    #[snafu(display("buffer manager is closed and drained"))]
    Closed,

    #[snafu(display("dequeue interrupted: {source}"))]
    DequeueInterrupted { source: Interrupted },
}

/// A batch handed to the consumer. Acknowledging it closes the latency
/// window started at dequeue and feeds the monitor and the batch sizer.
#[derive(Debug)]
pub struct Batch<T> {
    items: Vec<BufferedItem<T>>,
    started: Instant,
}

impl<T> Batch<T> {
    pub fn items(&self) -> &[BufferedItem<T>] {
        &self.items
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(|item| &item.payload)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The ingestion queue.
///
/// At-least-once contract: items written to the disk tier survive a crash
/// and are re-delivered on restart; items only in the memory ring at crash
/// are lost. Callers that need durability mark priority 1-2, which writes
/// through to disk at enqueue (bypassing the ring).
pub struct BufferManager<T: Bufferable> {
    config: BufferConfig,
    memory: Mutex<CircularBuffer<BufferedItem<T>>>,
    disk: tokio::sync::Mutex<Option<DiskBuffer>>,
    disk_len: AtomicUsize,
    compressor: Compressor,
    gate: FlowControlGate,
    sizer: AdaptiveBatchSizer,
    breaker: CircuitBreaker,
    monitor: BackpressureMonitor,
    notify: Notify,
    spilling: std::sync::atomic::AtomicBool,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl<T: Bufferable> BufferManager<T> {
    /// Validate the configuration, open the disk tier, start the monitor
    /// tasks, and return the ready manager.
    pub async fn initialize(config: BufferConfig) -> Result<Arc<Self>, BufferBuildError> {
        config.validate()?;

        let disk = match (&config.disk_buffer_path, config.disk_buffer_size) {
            (Some(path), size) if size > 0 => Some(
                DiskBuffer::open(path, size)
                    .await
                    .map_err(|source| BufferBuildError::DiskOpen { source })?,
            ),
            _ => None,
        };
        let disk_len = disk.as_ref().map_or(0, DiskBuffer::len);

        let manager = Arc::new(Self {
            memory: Mutex::new(CircularBuffer::new(config.memory_buffer_size)),
            disk: tokio::sync::Mutex::new(disk),
            disk_len: AtomicUsize::new(disk_len),
            compressor: Compressor::new(config.compression.clone()),
            gate: FlowControlGate::new(config.flow_control.clone()),
            sizer: AdaptiveBatchSizer::new(config.adaptive_batch.clone()),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            monitor: BackpressureMonitor::new(config.backpressure.clone()),
            notify: Notify::new(),
            spilling: std::sync::atomic::AtomicBool::new(false),
            state: AtomicU8::new(STATE_CREATED),
            shutdown: CancellationToken::new(),
            config,
        });

        manager.spawn_monitor_tasks();
        manager.state.store(STATE_READY, Ordering::SeqCst);
        Ok(manager)
    }

    fn spawn_monitor_tasks(self: &Arc<Self>) {
        let monitor = self.monitor.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(monitor.run(shutdown));

        // Couple the backpressure signal into emergency throttling: engage
        // when backpressure is active and the error rate exceeds the
        // trigger, clear as soon as backpressure clears.
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut active_rx = manager.monitor.subscribe();
            let mut interval =
                tokio::time::interval(manager.config.backpressure.monitoring_interval);
            loop {
                tokio::select! {
                    () = manager.shutdown.cancelled() => break,
                    changed = active_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = interval.tick() => {}
                }
                let active = manager.monitor.is_active();
                if !active {
                    manager.gate.set_emergency(false);
                } else if manager.monitor.error_rate()
                    > manager.config.flow_control.emergency_mode.trigger_threshold
                {
                    manager.gate.set_emergency(true);
                }
            }
        });
    }

    /// Enqueue a batch of payloads at the given priority.
    ///
    /// Returns the number of items accepted. Denied admission surfaces as
    /// `Throttled`; only a full disk tier aborts the call.
    pub async fn enqueue(
        &self,
        payloads: Vec<T>,
        priority: Priority,
        ctx: &OpContext,
    ) -> Result<usize, EnqueueError> {
        snafu::ensure!(
            self.state.load(Ordering::SeqCst) == STATE_READY,
            NotReadySnafu
        );
        ctx.check().context(EnqueueInterruptedSnafu)?;

        let count = payloads.len();
        if count == 0 {
            return Ok(0);
        }

        if !self.gate.request_permission(count, priority) {
            return Err(EnqueueError::Throttled { count });
        }

        let mut spilled = 0usize;
        if priority.is_durable() && self.has_disk() {
            // Durable bands bypass the ring and write through to disk.
            for payload in payloads {
                let item = BufferedItem::new(payload, priority);
                self.write_to_disk(&item).await.context(DiskSnafu)?;
                spilled += 1;
            }
        } else {
            let spill_ahead = self.update_spill_state();
            let mut evicted = Vec::new();
            if spill_ahead && self.has_disk() {
                for payload in payloads {
                    evicted.push(BufferedItem::new(payload, priority));
                }
            } else {
                let mut memory = self.memory.lock();
                for payload in payloads {
                    if let Some(oldest) = memory.add(BufferedItem::new(payload, priority)) {
                        evicted.push(oldest);
                    }
                }
            }
            spilled = evicted.len();
            self.spill(evicted).await;
        }

        emit(BufferEventsReceived { count, spilled });
        self.publish_depth();
        self.notify.notify_waiters();
        Ok(count)
    }

    /// Dequeue the next batch, sized by the adaptive sizer. Blocks while
    /// both tiers are empty, until cancelled or the manager closes.
    pub async fn dequeue_batch(&self, ctx: &OpContext) -> Result<Batch<T>, DequeueError> {
        loop {
            ctx.check().context(DequeueInterruptedSnafu)?;

            // Register for wakeups before checking emptiness, so an enqueue
            // landing in between cannot be missed.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let target = self.sizer.current_size().max(1);
            let mut items = {
                let mut memory = self.memory.lock();
                memory.drain(target)
            };

            if items.len() < target {
                let more = self.read_from_disk(target - items.len()).await;
                items.extend(more);
            }

            if !items.is_empty() {
                self.publish_depth();
                return Ok(Batch {
                    items,
                    started: Instant::now(),
                });
            }

            if self.state.load(Ordering::SeqCst) == STATE_CLOSED {
                return Err(DequeueError::Closed);
            }

            ctx.run(notified).await.context(DequeueInterruptedSnafu)?;
        }
    }

    /// Acknowledge a delivered batch.
    ///
    /// A negative acknowledgement requeues the items at the front for
    /// retry; items that have exhausted `max_delivery_attempts` are dropped
    /// with a metric, never silently.
    pub async fn acknowledge(&self, batch: Batch<T>, success: bool) {
        let latency = batch.started.elapsed();
        let count = batch.items.len();
        self.monitor.record_dispatch(latency, !success);
        self.sizer.record_batch(latency, count);

        if success {
            emit(BufferEventsSent { count });
            return;
        }

        let mut exhausted = 0usize;
        let mut evicted = Vec::new();
        {
            let mut memory = self.memory.lock();
            // Reverse so the first item of the batch ends up frontmost.
            for mut item in batch.items.into_iter().rev() {
                item.attempts += 1;
                if item.attempts >= self.config.max_delivery_attempts {
                    exhausted += 1;
                    continue;
                }
                if let Some(newest) = memory.requeue(item) {
                    evicted.push(newest);
                }
            }
        }
        self.spill(evicted).await;

        if exhausted > 0 {
            emit(BufferEventsDropped {
                count: exhausted,
                reason: "max_delivery_attempts",
            });
        }
        self.publish_depth();
        self.notify.notify_waiters();
    }

    /// Items currently in the memory ring.
    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Items across both tiers.
    pub fn total_len(&self) -> usize {
        self.len() + self.disk_len.load(Ordering::Relaxed)
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.monitor.is_active()
    }

    pub fn is_circuit_breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// The breaker guarding downstream handoff; dispatchers run their sink
    /// calls through it.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn flow_control(&self) -> &FlowControlGate {
        &self.gate
    }

    pub fn backpressure(&self) -> &BackpressureMonitor {
        &self.monitor
    }

    pub fn batch_sizer(&self) -> &AdaptiveBatchSizer {
        &self.sizer
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// Stop the monitor tasks, spill the memory ring to disk for a graceful
    /// handover, and close the disk tier.
    pub async fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.shutdown.cancel();
        self.notify.notify_waiters();

        let remaining = {
            let mut memory = self.memory.lock();
            let len = memory.len();
            memory.drain(len)
        };
        self.spill(remaining).await;

        let mut disk = self.disk.lock().await;
        if let Some(disk) = disk.take() {
            if let Err(error) = disk.close().await {
                warn!(message = "Failed to close disk buffer cleanly.", %error);
            }
        }
    }

    fn has_disk(&self) -> bool {
        // The option is only taken at close; len is tracked separately so
        // the check stays synchronous.
        self.config.disk_buffer_path.is_some() && self.config.disk_buffer_size > 0
    }

    /// Spill-ahead hysteresis: engage at the high-water mark, release at
    /// the low-water mark.
    fn update_spill_state(&self) -> bool {
        let usage = self.memory.lock().usage();
        if usage >= self.config.high_water_mark {
            self.spilling.store(true, Ordering::Relaxed);
        } else if usage <= self.config.low_water_mark {
            self.spilling.store(false, Ordering::Relaxed);
        }
        self.spilling.load(Ordering::Relaxed)
    }

    /// Best-effort spill of evicted items. A full or absent disk tier drops
    /// the items with a metric; eviction must never block the hot path.
    async fn spill(&self, items: Vec<BufferedItem<T>>) {
        if items.is_empty() {
            return;
        }
        if !self.has_disk() {
            emit(BufferEventsDropped {
                count: items.len(),
                reason: "no_disk_tier",
            });
            return;
        }
        let mut dropped = 0usize;
        for item in &items {
            if let Err(error) = self.write_to_disk(item).await {
                match error {
                    DiskBufferError::DiskFull { .. } => dropped += 1,
                    other => {
                        warn!(message = "Spill to disk failed.", error = %other);
                        dropped += 1;
                    }
                }
            }
        }
        if dropped > 0 {
            emit(BufferEventsDropped {
                count: dropped,
                reason: "disk_full",
            });
        }
    }

    async fn write_to_disk(&self, item: &BufferedItem<T>) -> Result<(), DiskBufferError> {
        let encoded = serde_json::to_vec(item).map_err(|error| {
            error!(message = "Failed to encode buffered item.", %error);
            DiskBufferError::Io {
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, error),
            }
        })?;
        let frame = self
            .compressor
            .encode(&encoded)
            .map_err(|error| DiskBufferError::Io {
                source: std::io::Error::other(error),
            })?;

        let mut disk = self.disk.lock().await;
        let Some(disk) = disk.as_mut() else {
            return Ok(());
        };
        disk.write(&frame).await?;
        self.disk_len.store(disk.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn read_from_disk(&self, count: usize) -> Vec<BufferedItem<T>> {
        if count == 0 || self.disk_len.load(Ordering::Relaxed) == 0 {
            return Vec::new();
        }
        let mut disk = self.disk.lock().await;
        let Some(disk) = disk.as_mut() else {
            return Vec::new();
        };
        let frames = match disk.read(count).await {
            Ok(frames) => frames,
            Err(error) => {
                warn!(message = "Disk buffer read failed.", %error);
                Vec::new()
            }
        };
        self.disk_len.store(disk.len(), Ordering::Relaxed);
        drop(disk);

        let mut items = Vec::with_capacity(frames.len());
        let mut undecodable = 0usize;
        for frame in frames {
            let decoded = self
                .compressor
                .decode(&frame)
                .ok()
                .and_then(|payload| serde_json::from_slice::<BufferedItem<T>>(&payload).ok());
            match decoded {
                Some(item) => items.push(item),
                None => undecodable += 1,
            }
        }
        if undecodable > 0 {
            emit(BufferEventsDropped {
                count: undecodable,
                reason: "undecodable",
            });
        }
        items
    }

    fn publish_depth(&self) {
        let memory_len = self.len();
        let disk_len = self.disk_len.load(Ordering::Relaxed);
        self.monitor.set_queue_depth(memory_len + disk_len);
        metrics::gauge!("buffer.memory_size").set(memory_len as f64);
        metrics::gauge!("buffer.disk_size").set(disk_len as f64);
    }
}
