//! Per-parser metrics: counters, parse-time aggregation, and rankings.
//! Counters are plain atomics behind a concurrent map so the dispatch hot
//! path never takes a lock; everything is mirrored to the metrics facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

/// Outcome of one parse attempt, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Produced a normalized event.
    Success,
    /// The parser declined the record (`parse` returned `None`).
    NoMatch,
    /// The parser failed on a record it claimed.
    Error,
}

#[derive(Debug)]
struct ParserStats {
    invocations: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    validation_rejects: AtomicU64,
    parse_time_ns_total: AtomicU64,
    parse_time_ns_max: AtomicU64,
}

impl ParserStats {
    fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            validation_rejects: AtomicU64::new(0),
            parse_time_ns_total: AtomicU64::new(0),
            parse_time_ns_max: AtomicU64::new(0),
        }
    }
}

/// A point-in-time copy of one parser's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserMetricsSnapshot {
    pub parser_id: String,
    pub invocations: u64,
    pub successes: u64,
    pub errors: u64,
    pub validation_rejects: u64,
    pub average_parse_time: Duration,
    pub max_parse_time: Duration,
    pub success_rate: f64,
    pub error_rate: f64,
}

impl ParserMetricsSnapshot {
    /// Ranking score: successes weighted by reliability.
    pub fn performance_score(&self) -> f64 {
        self.successes as f64 * (1.0 - self.error_rate)
    }
}

/// The process-wide parser metrics collector.
#[derive(Debug, Default)]
pub struct ParserMetrics {
    parsers: DashMap<String, Arc<ParserStats>>,
}

impl ParserMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn stats(&self, parser_id: &str) -> Arc<ParserStats> {
        self.parsers
            .entry(parser_id.to_string())
            .or_insert_with(|| Arc::new(ParserStats::new()))
            .clone()
    }

    /// Record one parse attempt and its duration.
    pub fn record_parse(&self, parser_id: &str, elapsed: Duration, outcome: ParseOutcome) {
        let stats = self.stats(parser_id);
        stats.invocations.fetch_add(1, Ordering::Relaxed);

        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        stats.parse_time_ns_total.fetch_add(nanos, Ordering::Relaxed);
        stats
            .parse_time_ns_max
            .fetch_max(nanos, Ordering::Relaxed);

        match outcome {
            ParseOutcome::Success => {
                stats.successes.fetch_add(1, Ordering::Relaxed);
            }
            ParseOutcome::NoMatch => {}
            ParseOutcome::Error => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        metrics::histogram!("parser.parse_time_seconds", "parser" => parser_id.to_string())
            .record(elapsed.as_secs_f64());
        if outcome == ParseOutcome::Error {
            metrics::counter!("parser.errors_total", "parser" => parser_id.to_string())
                .increment(1);
        }
    }

    /// Record a record rejected by the cheap `validate` sniff.
    pub fn record_validation_reject(&self, parser_id: &str) {
        self.stats(parser_id)
            .validation_rejects
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, parser_id: &str) -> Option<ParserMetricsSnapshot> {
        self.parsers
            .get(parser_id)
            .map(|entry| snapshot_of(parser_id, entry.value()))
    }

    pub fn snapshots(&self) -> Vec<ParserMetricsSnapshot> {
        self.parsers
            .iter()
            .map(|entry| snapshot_of(entry.key(), entry.value()))
            .collect()
    }

    /// Success rate across all parsers.
    pub fn global_success_rate(&self) -> f64 {
        let (mut invocations, mut successes) = (0u64, 0u64);
        for entry in self.parsers.iter() {
            invocations += entry.value().invocations.load(Ordering::Relaxed);
            successes += entry.value().successes.load(Ordering::Relaxed);
        }
        if invocations == 0 {
            0.0
        } else {
            successes as f64 / invocations as f64
        }
    }

    /// Mean parse time across all parsers.
    pub fn average_parse_time(&self) -> Duration {
        let (mut invocations, mut total_ns) = (0u64, 0u64);
        for entry in self.parsers.iter() {
            invocations += entry.value().invocations.load(Ordering::Relaxed);
            total_ns += entry.value().parse_time_ns_total.load(Ordering::Relaxed);
        }
        if invocations == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total_ns / invocations)
        }
    }

    /// The `n` best parsers by successes x (1 - error rate).
    pub fn top_performers(&self, n: usize) -> Vec<ParserMetricsSnapshot> {
        let mut snapshots = self.snapshots();
        snapshots.sort_by(|a, b| {
            b.performance_score()
                .partial_cmp(&a.performance_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        snapshots.truncate(n);
        snapshots
    }

    /// Clear counters globally or for one parser.
    pub fn reset(&self, parser_id: Option<&str>) {
        match parser_id {
            Some(id) => {
                self.parsers.remove(id);
            }
            None => self.parsers.clear(),
        }
    }
}

fn snapshot_of(parser_id: &str, stats: &ParserStats) -> ParserMetricsSnapshot {
    let invocations = stats.invocations.load(Ordering::Relaxed);
    let successes = stats.successes.load(Ordering::Relaxed);
    let errors = stats.errors.load(Ordering::Relaxed);
    let total_ns = stats.parse_time_ns_total.load(Ordering::Relaxed);

    let (success_rate, error_rate, average) = if invocations == 0 {
        (0.0, 0.0, Duration::ZERO)
    } else {
        (
            successes as f64 / invocations as f64,
            errors as f64 / invocations as f64,
            Duration::from_nanos(total_ns / invocations),
        )
    };

    metrics::gauge!("parser.success_rate", "parser" => parser_id.to_string()).set(success_rate);

    ParserMetricsSnapshot {
        parser_id: parser_id.to_string(),
        invocations,
        successes,
        errors,
        validation_rejects: stats.validation_rejects.load(Ordering::Relaxed),
        average_parse_time: average,
        max_parse_time: Duration::from_nanos(stats.parse_time_ns_max.load(Ordering::Relaxed)),
        success_rate,
        error_rate,
    }
}
