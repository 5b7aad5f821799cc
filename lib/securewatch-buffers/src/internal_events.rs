use std::path::Path;
use std::time::Duration;

use metrics::{counter, gauge};
use securewatch_common::{internal_event::error_type, InternalEvent};
use securewatch_event::Priority;

use crate::flow::CircuitState;

pub struct BufferEventsReceived {
    pub count: usize,
    pub spilled: usize,
}

impl InternalEvent for BufferEventsReceived {
    fn emit(self) {
        counter!("buffer_received_events_total").increment(self.count as u64);
        if self.spilled > 0 {
            counter!("buffer_spilled_events_total").increment(self.spilled as u64);
        }
    }
}

pub struct BufferEventsSent {
    pub count: usize,
}

impl InternalEvent for BufferEventsSent {
    fn emit(self) {
        counter!("buffer_sent_events_total").increment(self.count as u64);
    }
}

pub struct BufferEventsDropped {
    pub count: usize,
    pub reason: &'static str,
}

impl InternalEvent for BufferEventsDropped {
    fn emit(self) {
        error!(
            message = "Events dropped.",
            count = %self.count,
            reason = %self.reason,
        );
        counter!("buffer_discarded_events_total", "reason" => self.reason)
            .increment(self.count as u64);
    }

    fn name(&self) -> Option<&'static str> {
        Some("BufferEventsDropped")
    }
}

pub struct EventsThrottled {
    pub count: usize,
    pub priority: Priority,
}

impl InternalEvent for EventsThrottled {
    fn emit(self) {
        trace!(
            message = "Events throttled by flow control.",
            count = %self.count,
            priority = %self.priority,
        );
        counter!("flow_control.events_throttled", "priority" => self.priority.to_string())
            .increment(self.count as u64);
    }
}

pub struct CircuitBreakerStateChange {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl InternalEvent for CircuitBreakerStateChange {
    fn emit(self) {
        warn!(
            message = "Circuit breaker state changed.",
            from = self.from.as_str(),
            to = self.to.as_str(),
        );
        counter!(
            "circuit_breaker.state_transitions",
            "from" => self.from.as_str(),
            "to" => self.to.as_str(),
        )
        .increment(1);
        gauge!("circuit_breaker.state").set(self.to.gauge_value());
    }
}

pub struct BackpressureChanged {
    pub active: bool,
    pub queue_depth: usize,
    pub latency: Duration,
    pub error_rate: f64,
}

impl InternalEvent for BackpressureChanged {
    fn emit(self) {
        if self.active {
            warn!(
                message = "Backpressure activated.",
                queue_depth = %self.queue_depth,
                latency_ms = %self.latency.as_millis(),
                error_rate = %self.error_rate,
            );
        } else {
            info!(message = "Backpressure deactivated.");
        }
        counter!("backpressure.transitions").increment(1);
    }
}

pub struct DiskBufferCorruption<'a> {
    pub path: &'a Path,
    pub offset: u64,
    pub bytes_quarantined: u64,
}

impl InternalEvent for DiskBufferCorruption<'_> {
    fn emit(self) {
        error!(
            message = "Disk buffer corruption detected; tail quarantined.",
            path = %self.path.display(),
            offset = %self.offset,
            bytes_quarantined = %self.bytes_quarantined,
            error_type = error_type::READER_FAILED,
        );
        counter!("buffer_corruption_total").increment(1);
        counter!("buffer_quarantined_bytes_total").increment(self.bytes_quarantined);
    }
}
