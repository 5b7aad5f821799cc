//! Shared plumbing for the SecureWatch ingestion core.
//!
//! Everything in here is deliberately small: the internal-event convention
//! used for telemetry, and the operation context threaded through every
//! externally visible async operation.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod internal_event;
pub mod ops;

pub use internal_event::{emit, InternalEvent};
pub use ops::{Interrupted, OpContext};

/// Result alias for fallible operations whose error type is opaque to the
/// caller.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
