//! The parser contract: every log parser, built-in or community-derived,
//! exposes a descriptor plus `validate`, `parse` and `normalize`.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use securewatch_event::{NormalizedEvent, ParsedEvent, RawRecord};

/// Wire format a parser consumes. Closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    Syslog,
    Json,
    Csv,
    Xml,
    Evtx,
    Custom,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Syslog => "syslog",
            WireFormat::Json => "json",
            WireFormat::Csv => "csv",
            WireFormat::Xml => "xml",
            WireFormat::Evtx => "evtx",
            WireFormat::Custom => "custom",
        }
    }
}

/// The closed vocabulary of parser category tags.
pub const CATEGORIES: [&str; 10] = [
    "authentication",
    "network",
    "endpoint",
    "cloud",
    "iam",
    "application",
    "system",
    "database",
    "web",
    "threat",
];

/// Immutable identity and routing metadata for a parser.
///
/// The `enabled` flag is the only mutable aspect of a registered parser and
/// is managed by the registry, not by flipping this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserDescriptor {
    /// Unique id; registration replaces an existing parser with the same id.
    pub id: String,
    pub name: String,
    pub vendor: String,
    /// Routing tag matched against a record's source hint.
    pub log_source: String,
    pub version: String,
    pub format: WireFormat,
    /// Routing tag matched against a record's category hint.
    pub category: String,
    /// Higher priorities are tried first during dispatch.
    pub priority: i32,
    pub enabled: bool,
}

/// A parser attempt that failed on a record it claimed via `validate`.
///
/// Distinct from a `parse` returning `None`, which just means "not my
/// format" and moves dispatch to the next candidate.
#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("malformed record: {reason}"))]
    Malformed { reason: String },

    #[snafu(display("payload is not valid UTF-8"))]
    NotUtf8,
}

#[derive(Debug, Snafu)]
pub enum NormalizeError {
    #[snafu(display("parsed event is missing `{field}`"))]
    MissingField { field: &'static str },

    #[snafu(display("cannot normalize: {reason}"))]
    Invalid { reason: String },
}

/// The uniform parser contract.
///
/// `validate` must accept a strict subset of what `parse` accepts: it is
/// the cheap sniff dispatch uses to skip parsers without paying for a full
/// parse. `parse` returns `Ok(None)` when the record is not this parser's
/// format; errors are reserved for records that matched the format but are
/// broken.
pub trait LogParser: Send + Sync {
    fn descriptor(&self) -> &ParserDescriptor;

    fn validate(&self, record: &RawRecord) -> bool;

    fn parse(&self, record: &RawRecord) -> Result<Option<ParsedEvent>, ParseError>;

    /// Deterministic mapping of a parsed event into the flat schema.
    fn normalize(&self, event: &ParsedEvent) -> Result<NormalizedEvent, NormalizeError>;
}
