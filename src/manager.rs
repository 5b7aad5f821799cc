//! The parser manager: the end-to-end parse, normalize, enrich pipeline and
//! its batch variant.
//!
//! The manager is a process-wide service with an explicit lifecycle
//! (init, ready, draining, shutdown) passed by reference, not an ambient
//! global.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use snafu::Snafu;

use crate::internal_events::{ParserAttemptFailed, RecordUnmatched};
use crate::metrics::{ParseOutcome, ParserMetrics};
use crate::parser::ParserDescriptor;
use crate::registry::ParserRegistry;
use securewatch_common::{emit, Interrupted, OpContext};
use securewatch_enrichment::EnrichmentEngine;
use securewatch_event::{NormalizedEvent, ParsedEvent, RawRecord};

/// Lifecycle of the dispatch service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Init,
    Ready,
    Draining,
    Shutdown,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Ready,
            2 => Lifecycle::Draining,
            3 => Lifecycle::Shutdown,
            _ => Lifecycle::Init,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Init => 0,
            Lifecycle::Ready => 1,
            Lifecycle::Draining => 2,
            Lifecycle::Shutdown => 3,
        }
    }
}

/// Why a record produced no normalized event. These are result values, not
/// pipeline failures; a batch never aborts for any of them.
#[derive(Debug, Snafu)]
pub enum DispatchFailure {
    /// No registered, enabled parser accepted the record.
    #[snafu(display("no parser matched the record"))]
    NoMatch,

    #[snafu(display("dispatch service is not accepting records"))]
    NotReady,

    #[snafu(display("dispatch interrupted: {source}"))]
    DispatchInterrupted { source: Interrupted },

    /// Unexpected failure with a stable identifier for correlation.
    #[snafu(display("system error [{id}]: {reason}"))]
    System { id: &'static str, reason: String },
}

pub type DispatchResult = Result<NormalizedEvent, DispatchFailure>;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Batch work is processed in chunks of this many records.
    pub chunk_size: usize,
    /// In-flight records per chunk.
    pub max_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_concurrency: 8,
        }
    }
}

/// The dispatch pipeline over a registry, a metrics collector, and an
/// optional enrichment engine.
pub struct ParserManager {
    registry: Arc<ParserRegistry>,
    metrics: Arc<ParserMetrics>,
    enrichment: Option<Arc<EnrichmentEngine>>,
    config: DispatchConfig,
    state: AtomicU8,
}

impl ParserManager {
    pub fn new(
        registry: Arc<ParserRegistry>,
        metrics: Arc<ParserMetrics>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            enrichment: None,
            config,
            state: AtomicU8::new(Lifecycle::Init.as_u8()),
        }
    }

    #[must_use]
    pub fn with_enrichment(mut self, engine: Arc<EnrichmentEngine>) -> Self {
        self.enrichment = Some(engine);
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move from init to ready. Idempotent.
    pub fn initialize(&self) {
        self.state.store(Lifecycle::Ready.as_u8(), Ordering::SeqCst);
        info!(message = "Parser manager ready.", parsers = self.registry.len());
    }

    /// Stop accepting new records; in-flight work completes.
    pub fn begin_draining(&self) {
        self.state
            .store(Lifecycle::Draining.as_u8(), Ordering::SeqCst);
        info!(message = "Parser manager draining.");
    }

    pub fn shutdown(&self) {
        self.state
            .store(Lifecycle::Shutdown.as_u8(), Ordering::SeqCst);
        info!(message = "Parser manager shut down.");
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &ParserMetrics {
        &self.metrics
    }

    /// Parse, normalize and enrich a single record.
    pub async fn dispatch(&self, record: &RawRecord, ctx: &OpContext) -> DispatchResult {
        if self.lifecycle() != Lifecycle::Ready {
            return Err(DispatchFailure::NotReady);
        }
        ctx.check()
            .map_err(|source| DispatchFailure::DispatchInterrupted { source })?;

        let candidates = self.registry.candidates_for(
            record.source_hint.as_deref(),
            record.category_hint.as_deref(),
        );
        let candidate_count = candidates.len();

        for handle in candidates {
            if !handle.is_enabled() {
                continue;
            }
            let parser = handle.parser();
            let parser_id = &parser.descriptor().id;

            if !parser.validate(record) {
                self.metrics.record_validation_reject(parser_id);
                continue;
            }

            let started = Instant::now();
            let parsed = match parser.parse(record) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => {
                    self.metrics
                        .record_parse(parser_id, started.elapsed(), ParseOutcome::NoMatch);
                    continue;
                }
                Err(error) => {
                    self.metrics
                        .record_parse(parser_id, started.elapsed(), ParseOutcome::Error);
                    emit(ParserAttemptFailed {
                        parser_id,
                        stage: "parse",
                        error: error.to_string(),
                    });
                    continue;
                }
            };

            let mut normalized = match parser.normalize(&parsed) {
                Ok(normalized) => normalized,
                Err(error) => {
                    self.metrics
                        .record_parse(parser_id, started.elapsed(), ParseOutcome::Error);
                    emit(ParserAttemptFailed {
                        parser_id,
                        stage: "normalize",
                        error: error.to_string(),
                    });
                    continue;
                }
            };
            self.metrics
                .record_parse(parser_id, started.elapsed(), ParseOutcome::Success);

            self.finish_event(&mut normalized, &parsed, parser.descriptor(), record)
                .await;
            return Ok(normalized);
        }

        emit(RecordUnmatched {
            source_id: &record.source_id,
            candidates: candidate_count,
        });
        Err(DispatchFailure::NoMatch)
    }

    /// Batch dispatch: chunked, with bounded concurrency inside each chunk.
    /// Results come back in input order; per-record failures never abort
    /// the batch.
    pub async fn dispatch_batch(
        &self,
        records: Vec<RawRecord>,
        ctx: &OpContext,
    ) -> Vec<DispatchResult> {
        let total = records.len();
        let mut results: Vec<Option<DispatchResult>> = Vec::with_capacity(total);
        results.resize_with(total, || None);

        let chunk_size = self.config.chunk_size.max(1);
        for (chunk_index, chunk) in records.chunks(chunk_size).enumerate() {
            let base = chunk_index * chunk_size;
            let outcomes: Vec<(usize, DispatchResult)> = stream::iter(
                chunk
                    .iter()
                    .enumerate()
                    .map(|(offset, record)| async move {
                        (base + offset, self.dispatch(record, ctx).await)
                    }),
            )
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

            for (index, outcome) in outcomes {
                results[index] = Some(outcome);
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or(Err(DispatchFailure::System {
                    id: "dispatch-lost-slot",
                    reason: "batch slot never resolved".to_string(),
                }))
            })
            .collect()
    }

    /// Stamps and enrichment applied to every successfully normalized event.
    async fn finish_event(
        &self,
        event: &mut NormalizedEvent,
        parsed: &ParsedEvent,
        descriptor: &ParserDescriptor,
        record: &RawRecord,
    ) {
        event.set_parser(&descriptor.id, &descriptor.name, &descriptor.version);
        event.insert(
            "securewatch.confidence",
            confidence_score(parsed, descriptor),
        );

        // The arrival time is kept distinct from the event's own timestamp;
        // a record with no extractable timestamp falls back to arrival but
        // never silently pretends the fallback was extracted.
        event.insert("ingestion.timestamp", record.ingested_at);
        if event.timestamp().is_none() {
            event.set_timestamp(record.ingested_at);
        }

        if let Some(engine) = &self.enrichment {
            engine.enrich(event).await;
        }
    }
}

/// How confident dispatch is that the normalized event is faithful.
///
/// Base 0.5, raised by extracted essentials and structured sub-records,
/// adjusted by parser class, clamped into [0, 1].
fn confidence_score(parsed: &ParsedEvent, descriptor: &ParserDescriptor) -> f64 {
    let mut score: f64 = 0.5;

    for present in [
        parsed.timestamp.is_some(),
        !parsed.source.is_empty(),
        !parsed.category.is_empty(),
        !parsed.action.is_empty(),
    ] {
        if present {
            score += 0.05;
        }
    }

    if parsed.subrecord_count() > 0 {
        score += 0.1;
    }
    if parsed.has_security_context() {
        score += 0.15;
    }

    if matches!(descriptor.category.as_str(), "endpoint" | "network") {
        score += 0.05;
    }
    if descriptor.id.contains("generic") || descriptor.id.contains("fallback") {
        score -= 0.2;
    }
    if descriptor.priority > 80 {
        score += 0.1;
    } else if descriptor.priority < 20 {
        score -= 0.1;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{
        LogParser, NormalizeError, ParseError, ParserDescriptor, WireFormat,
    };
    use securewatch_event::{Outcome, Severity, Value};

    struct ScriptedParser {
        descriptor: ParserDescriptor,
        behavior: Behavior,
    }

    enum Behavior {
        Match,
        Decline,
        FailParse,
        FailNormalize,
    }

    impl ScriptedParser {
        fn build(id: &str, priority: i32, behavior: Behavior) -> Arc<dyn LogParser> {
            Arc::new(Self {
                descriptor: ParserDescriptor {
                    id: id.to_string(),
                    name: id.to_string(),
                    vendor: "test".to_string(),
                    log_source: "test".to_string(),
                    version: "1.0.0".to_string(),
                    format: WireFormat::Custom,
                    category: "application".to_string(),
                    priority,
                    enabled: true,
                },
                behavior,
            })
        }
    }

    impl LogParser for ScriptedParser {
        fn descriptor(&self) -> &ParserDescriptor {
            &self.descriptor
        }

        fn validate(&self, record: &RawRecord) -> bool {
            // Payloads starting with '!' fail the cheap sniff.
            !record.payload.as_ref().starts_with(b"!")
        }

        fn parse(&self, record: &RawRecord) -> Result<Option<ParsedEvent>, ParseError> {
            match self.behavior {
                Behavior::Decline => Ok(None),
                Behavior::FailParse => Err(ParseError::Malformed {
                    reason: "scripted failure".to_string(),
                }),
                _ => {
                    let mut parsed =
                        ParsedEvent::new("test", "application", record.payload.clone());
                    parsed.timestamp = Some(record.ingested_at);
                    parsed.action = "noop".to_string();
                    parsed.outcome = Outcome::Success;
                    parsed.severity = Severity::Low;
                    Ok(Some(parsed))
                }
            }
        }

        fn normalize(&self, event: &ParsedEvent) -> Result<NormalizedEvent, NormalizeError> {
            if matches!(self.behavior, Behavior::FailNormalize) {
                return Err(NormalizeError::Invalid {
                    reason: "scripted failure".to_string(),
                });
            }
            let mut normalized = NormalizedEvent::new();
            if let Some(ts) = event.timestamp {
                normalized.set_timestamp(ts);
            }
            normalized.insert("event.kind", "event");
            normalized.insert("event.category", Value::Array(vec!["application".into()]));
            normalized.insert("event.type", Value::Array(vec!["info".into()]));
            normalized.insert("event.outcome", event.outcome.as_str());
            normalized.set_severity(event.severity);
            Ok(normalized)
        }
    }

    fn manager_with(parsers: Vec<Arc<dyn LogParser>>) -> ParserManager {
        let registry = Arc::new(ParserRegistry::new());
        for parser in parsers {
            registry.register(parser).unwrap();
        }
        let manager = ParserManager::new(
            registry,
            Arc::new(ParserMetrics::new()),
            DispatchConfig::default(),
        );
        manager.initialize();
        manager
    }

    fn record() -> RawRecord {
        RawRecord::new("payload", "test-source").with_source_hint("test")
    }

    #[tokio::test]
    async fn dispatch_walks_candidates_until_one_matches() {
        let manager = manager_with(vec![
            ScriptedParser::build("decliner", 90, Behavior::Decline),
            ScriptedParser::build("failer", 80, Behavior::FailParse),
            ScriptedParser::build("matcher", 70, Behavior::Match),
        ]);

        let event = manager
            .dispatch(&record(), &OpContext::unbounded())
            .await
            .unwrap();
        assert_eq!(event.get_str("securewatch.parser.id").unwrap(), "matcher");
        assert!(event.has_required_fields());

        // The failing parser was counted as an error, not a pipeline abort.
        let failer = manager.metrics().snapshot("failer").unwrap();
        assert_eq!(failer.errors, 1);
    }

    #[tokio::test]
    async fn normalize_failure_moves_to_next_candidate() {
        let manager = manager_with(vec![
            ScriptedParser::build("bad-normalizer", 90, Behavior::FailNormalize),
            ScriptedParser::build("good", 10, Behavior::Match),
        ]);

        let event = manager
            .dispatch(&record(), &OpContext::unbounded())
            .await
            .unwrap();
        assert_eq!(event.get_str("securewatch.parser.id").unwrap(), "good");
    }

    #[tokio::test]
    async fn no_match_is_a_value_not_a_crash() {
        let manager = manager_with(vec![ScriptedParser::build(
            "decliner",
            50,
            Behavior::Decline,
        )]);
        let result = manager.dispatch(&record(), &OpContext::unbounded()).await;
        assert!(matches!(result, Err(DispatchFailure::NoMatch)));
    }

    #[tokio::test]
    async fn disabled_parsers_are_skipped() {
        let manager = manager_with(vec![
            ScriptedParser::build("disabled", 90, Behavior::Match),
            ScriptedParser::build("enabled", 10, Behavior::Match),
        ]);
        manager.registry().set_enabled("disabled", false);

        let event = manager
            .dispatch(&record(), &OpContext::unbounded())
            .await
            .unwrap();
        assert_eq!(event.get_str("securewatch.parser.id").unwrap(), "enabled");
    }

    #[tokio::test]
    async fn lifecycle_gates_dispatch() {
        let manager = manager_with(vec![ScriptedParser::build("p", 50, Behavior::Match)]);
        manager.begin_draining();
        let result = manager.dispatch(&record(), &OpContext::unbounded()).await;
        assert!(matches!(result, Err(DispatchFailure::NotReady)));
        assert_eq!(manager.lifecycle(), Lifecycle::Draining);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_isolates_failures() {
        let manager = manager_with(vec![ScriptedParser::build("json", 50, Behavior::Match)]);

        let mut records: Vec<RawRecord> = (0..250).map(|_| record()).collect();
        // A record no parser will claim, in the middle of the batch.
        records[100] = RawRecord::new("!unparseable", "odd-source").with_source_hint("test");

        let results = manager
            .dispatch_batch(records, &OpContext::unbounded())
            .await;
        assert_eq!(results.len(), 250);
        for (index, result) in results.iter().enumerate() {
            if index == 100 {
                assert!(matches!(result, Err(DispatchFailure::NoMatch)));
            } else {
                assert!(result.is_ok(), "record {index} failed");
            }
        }

        let snapshot = manager.metrics().snapshot("json").unwrap();
        assert_eq!(snapshot.successes, 249);
        assert_eq!(snapshot.validation_rejects, 1);
    }

    #[tokio::test]
    async fn cancelled_batch_reports_interrupted_items() {
        let manager = manager_with(vec![ScriptedParser::build("p", 50, Behavior::Match)]);
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = OpContext::with_cancellation(token);

        let results = manager.dispatch_batch(vec![record(), record()], &ctx).await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(DispatchFailure::DispatchInterrupted { .. }))));
    }

    #[test]
    fn confidence_formula() {
        let descriptor = ParserDescriptor {
            id: "endpoint-edr".to_string(),
            name: "EDR".to_string(),
            vendor: "test".to_string(),
            log_source: "edr".to_string(),
            version: "1.0.0".to_string(),
            format: WireFormat::Json,
            category: "endpoint".to_string(),
            priority: 90,
            enabled: true,
        };
        let mut parsed = ParsedEvent::new("edr", "endpoint", bytes::Bytes::new());
        parsed.timestamp = Some(chrono::Utc::now());
        parsed.action = "process-start".to_string();
        parsed.process = Some(securewatch_event::ProcessInfo::default());
        parsed.threat = Some(securewatch_event::ThreatInfo::default());

        // 0.5 + 0.2 (all four essentials) + 0.1 (sub-record) + 0.15
        // (security context) + 0.05 (endpoint) + 0.1 (priority > 80) = 1.0+
        let score = confidence_score(&parsed, &descriptor);
        assert!((score - 1.0).abs() < f64::EPSILON);

        let generic = ParserDescriptor {
            id: "generic-fallback".to_string(),
            category: "application".to_string(),
            priority: 10,
            ..descriptor
        };
        let bare = ParsedEvent::new("x", "application", bytes::Bytes::new());
        // 0.5 + 0.05 (source) + 0.05 (category) - 0.2 - 0.1 = 0.3
        let score = confidence_score(&bare, &generic);
        assert!((score - 0.3).abs() < 1e-9);
    }
}
