//! The parser registry: id-unique storage with log-source and category
//! indices kept in descending priority order.
//!
//! Registrations are rare and candidate lookups are the hot path, so the
//! registry sits behind a read-mostly lock and lookups clone cheap handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use snafu::Snafu;

use crate::internal_events::{ParserRegistered, ParserUnregistered};
use crate::parser::{LogParser, ParserDescriptor};
use crate::validator::validate_parser;
use securewatch_common::emit;

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("invalid parser: {}", errors.join("; ")))]
    InvalidParser { errors: Vec<String> },
}

struct RegisteredParser {
    parser: Arc<dyn LogParser>,
    enabled: AtomicBool,
}

/// A cheap handle to a registered parser, carrying its live enabled flag.
#[derive(Clone)]
pub struct ParserHandle(Arc<RegisteredParser>);

impl ParserHandle {
    pub fn parser(&self) -> &dyn LogParser {
        self.0.parser.as_ref()
    }

    pub fn descriptor(&self) -> &ParserDescriptor {
        self.0.parser.descriptor()
    }

    pub fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// The flag flipped by `set_enabled`; the descriptor's own `enabled`
    /// field only provides the initial value.
    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<RegisteredParser>>,
    by_source: HashMap<String, Vec<Arc<RegisteredParser>>>,
    by_category: HashMap<String, Vec<Arc<RegisteredParser>>>,
}

impl Indices {
    fn insert(&mut self, entry: Arc<RegisteredParser>) {
        let descriptor = entry.parser.descriptor();
        self.by_id.insert(descriptor.id.clone(), Arc::clone(&entry));
        Self::index_into(
            &mut self.by_source,
            descriptor.log_source.clone(),
            Arc::clone(&entry),
        );
        Self::index_into(&mut self.by_category, descriptor.category.clone(), entry);
    }

    fn index_into(
        index: &mut HashMap<String, Vec<Arc<RegisteredParser>>>,
        key: String,
        entry: Arc<RegisteredParser>,
    ) {
        let bucket = index.entry(key).or_default();
        bucket.push(entry);
        bucket.sort_by_key(|e| std::cmp::Reverse(e.parser.descriptor().priority));
    }

    fn remove(&mut self, id: &str) -> Option<Arc<RegisteredParser>> {
        let entry = self.by_id.remove(id)?;
        let descriptor = entry.parser.descriptor();
        if let Some(bucket) = self.by_source.get_mut(&descriptor.log_source) {
            bucket.retain(|e| e.parser.descriptor().id != id);
        }
        if let Some(bucket) = self.by_category.get_mut(&descriptor.category) {
            bucket.retain(|e| e.parser.descriptor().id != id);
        }
        Some(entry)
    }
}

/// Registry of all parsers known to the dispatch pipeline.
#[derive(Default)]
pub struct ParserRegistry {
    indices: RwLock<Indices>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parser, replacing (with a warning) any parser already
    /// registered under the same id.
    pub fn register(&self, parser: Arc<dyn LogParser>) -> Result<(), RegistryError> {
        let report = validate_parser(parser.as_ref());
        for warning in &report.warnings {
            warn!(
                message = "Parser registered with warnings.",
                parser = %parser.descriptor().id,
                warning = %warning,
            );
        }
        if !report.valid {
            return Err(RegistryError::InvalidParser {
                errors: report.errors,
            });
        }

        let descriptor = parser.descriptor().clone();
        let entry = Arc::new(RegisteredParser {
            enabled: AtomicBool::new(descriptor.enabled),
            parser,
        });

        let replaced = {
            let mut indices = self.indices.write();
            let replaced = indices.remove(&descriptor.id).is_some();
            indices.insert(entry);
            replaced
        };

        if replaced {
            warn!(
                message = "Parser re-registered; previous registration replaced.",
                parser = %descriptor.id,
            );
        }
        emit(ParserRegistered {
            parser_id: &descriptor.id,
            log_source: &descriptor.log_source,
            replaced,
        });
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.indices.write().remove(id).is_some();
        if removed {
            emit(ParserUnregistered { parser_id: id });
        }
        removed
    }

    /// Flip a parser's enabled flag without touching the indices.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let indices = self.indices.read();
        match indices.by_id.get(id) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<ParserHandle> {
        self.indices.read().by_id.get(id).cloned().map(ParserHandle)
    }

    pub fn len(&self) -> usize {
        self.indices.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parser_ids(&self) -> Vec<String> {
        self.indices.read().by_id.keys().cloned().collect()
    }

    /// Candidate parsers for a record, in descending priority order.
    ///
    /// The union of the source-hint and category-hint indices, deduplicated.
    /// When neither hint matches anything, every parser is a candidate.
    pub fn candidates_for(
        &self,
        source_hint: Option<&str>,
        category_hint: Option<&str>,
    ) -> Vec<ParserHandle> {
        let indices = self.indices.read();

        let mut merged: Vec<Arc<RegisteredParser>> = Vec::new();
        if let Some(bucket) = source_hint.and_then(|hint| indices.by_source.get(hint)) {
            merged.extend(bucket.iter().cloned());
        }
        if let Some(bucket) = category_hint.and_then(|hint| indices.by_category.get(hint)) {
            merged.extend(bucket.iter().cloned());
        }

        if merged.is_empty() {
            merged = indices.by_id.values().cloned().collect();
        }

        merged.sort_by_key(|e| std::cmp::Reverse(e.parser.descriptor().priority));
        let mut seen = std::collections::HashSet::new();
        merged.retain(|e| seen.insert(e.parser.descriptor().id.clone()));

        merged.into_iter().map(ParserHandle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{NormalizeError, ParseError, WireFormat};
    use securewatch_event::{NormalizedEvent, ParsedEvent, RawRecord};

    struct StubParser {
        descriptor: ParserDescriptor,
    }

    impl StubParser {
        fn build(id: &str, log_source: &str, category: &str, priority: i32) -> Arc<dyn LogParser> {
            Arc::new(Self {
                descriptor: ParserDescriptor {
                    id: id.to_string(),
                    name: id.to_string(),
                    vendor: "test".to_string(),
                    log_source: log_source.to_string(),
                    version: "1.0.0".to_string(),
                    format: WireFormat::Custom,
                    category: category.to_string(),
                    priority,
                    enabled: true,
                },
            })
        }
    }

    impl LogParser for StubParser {
        fn descriptor(&self) -> &ParserDescriptor {
            &self.descriptor
        }

        fn validate(&self, _record: &RawRecord) -> bool {
            true
        }

        fn parse(&self, _record: &RawRecord) -> Result<Option<ParsedEvent>, ParseError> {
            Ok(None)
        }

        fn normalize(&self, _event: &ParsedEvent) -> Result<NormalizedEvent, NormalizeError> {
            Ok(NormalizedEvent::new())
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ParserRegistry::new();
        registry
            .register(StubParser::build("syslog", "syslog", "system", 75))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("syslog").unwrap().id(), "syslog");
    }

    #[test]
    fn invalid_parser_is_rejected() {
        let registry = ParserRegistry::new();
        let result = registry.register(StubParser::build("", "syslog", "system", 10));
        assert!(matches!(result, Err(RegistryError::InvalidParser { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistration_replaces() {
        let registry = ParserRegistry::new();
        registry
            .register(StubParser::build("dup", "syslog", "system", 10))
            .unwrap();
        registry
            .register(StubParser::build("dup", "aws", "cloud", 90))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("dup").unwrap().descriptor().log_source, "aws");
        // The stale source-index entry is gone; the lookup falls back to
        // the all-parsers path and returns the replacement.
        let candidates = registry.candidates_for(Some("syslog"), None);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].descriptor().log_source, "aws");
    }

    #[test]
    fn candidates_are_priority_ordered_union() {
        let registry = ParserRegistry::new();
        registry
            .register(StubParser::build("low", "syslog", "system", 10))
            .unwrap();
        registry
            .register(StubParser::build("high", "syslog", "authentication", 90))
            .unwrap();
        registry
            .register(StubParser::build("auth", "winlog", "authentication", 50))
            .unwrap();

        let candidates = registry.candidates_for(Some("syslog"), Some("authentication"));
        let ids: Vec<_> = candidates.iter().map(ParserHandle::id).collect();
        // Union of both hints, deduplicated, highest priority first.
        assert_eq!(ids, ["high", "auth", "low"]);
    }

    #[test]
    fn no_matching_hint_returns_all() {
        let registry = ParserRegistry::new();
        registry
            .register(StubParser::build("a", "syslog", "system", 10))
            .unwrap();
        registry
            .register(StubParser::build("b", "aws", "cloud", 20))
            .unwrap();

        let candidates = registry.candidates_for(Some("unknown-source"), None);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id(), "b");
    }

    #[test]
    fn set_enabled_flips_the_live_flag() {
        let registry = ParserRegistry::new();
        registry
            .register(StubParser::build("p", "syslog", "system", 10))
            .unwrap();
        assert!(registry.get("p").unwrap().is_enabled());

        assert!(registry.set_enabled("p", false));
        assert!(!registry.get("p").unwrap().is_enabled());
        // Still registered and still a candidate; dispatch skips it.
        assert_eq!(registry.candidates_for(Some("syslog"), None).len(), 1);

        assert!(!registry.set_enabled("missing", false));
    }

    #[test]
    fn unregister_removes_from_all_indices() {
        let registry = ParserRegistry::new();
        registry
            .register(StubParser::build("p", "syslog", "system", 10))
            .unwrap();
        assert!(registry.unregister("p"));
        assert!(!registry.unregister("p"));
        assert!(registry.candidates_for(Some("syslog"), None).is_empty());
    }
}
