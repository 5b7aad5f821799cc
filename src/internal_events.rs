use metrics::counter;
use securewatch_common::{internal_event::error_type, InternalEvent};

pub struct ParserRegistered<'a> {
    pub parser_id: &'a str,
    pub log_source: &'a str,
    pub replaced: bool,
}

impl InternalEvent for ParserRegistered<'_> {
    fn emit(self) {
        info!(
            message = "Parser registered.",
            parser = %self.parser_id,
            log_source = %self.log_source,
            replaced = %self.replaced,
        );
        counter!("parser_registry.registrations_total").increment(1);
    }
}

pub struct ParserUnregistered<'a> {
    pub parser_id: &'a str,
}

impl InternalEvent for ParserUnregistered<'_> {
    fn emit(self) {
        info!(message = "Parser unregistered.", parser = %self.parser_id);
        counter!("parser_registry.unregistrations_total").increment(1);
    }
}

pub struct ParserAttemptFailed<'a> {
    pub parser_id: &'a str,
    pub stage: &'static str,
    pub error: String,
}

impl InternalEvent for ParserAttemptFailed<'_> {
    fn emit(self) {
        warn!(
            message = "Parser attempt failed; trying next candidate.",
            parser = %self.parser_id,
            stage = %self.stage,
            error = %self.error,
            error_type = error_type::PARSER_FAILED,
        );
        counter!(
            "dispatch.parser_failures_total",
            "parser" => self.parser_id.to_string(),
            "stage" => self.stage,
        )
        .increment(1);
    }
}

pub struct RecordUnmatched<'a> {
    pub source_id: &'a str,
    pub candidates: usize,
}

impl InternalEvent for RecordUnmatched<'_> {
    fn emit(self) {
        debug!(
            message = "No parser matched record.",
            source = %self.source_id,
            candidates = %self.candidates,
        );
        counter!("dispatch.no_match_total").increment(1);
    }
}
