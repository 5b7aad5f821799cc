//! SecureWatch ingestion core: parser registry, dispatch pipeline, and the
//! normalization layer between raw collector bytes and the common event
//! schema.
//!
//! The pipeline is: raw bytes enter the ingestion buffer
//! (`securewatch_buffers`), the dispatch manager pulls batches and selects
//! candidate parsers from the registry, each winning parse is normalized
//! into the flat schema, enriched (`securewatch_enrichment`), and handed to
//! the downstream sink through the circuit breaker.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

#[macro_use]
extern crate tracing;

pub mod extractor;
mod internal_events;
pub mod manager;
pub mod metrics;
pub mod normalize;
pub mod parser;
pub mod parsers;
pub mod registry;
pub mod validator;

pub use manager::{DispatchConfig, DispatchFailure, DispatchResult, Lifecycle, ParserManager};
pub use metrics::{ParseOutcome, ParserMetrics, ParserMetricsSnapshot};
pub use parser::{LogParser, NormalizeError, ParseError, ParserDescriptor, WireFormat};
pub use registry::{ParserHandle, ParserRegistry, RegistryError};
pub use validator::{validate_parser, ValidationReport};

pub use securewatch_buffers as buffers;
pub use securewatch_enrichment as enrichment;
pub use securewatch_event as event;
