//! Event data model for the SecureWatch ingestion core.
//!
//! Three shapes move through the pipeline: an opaque [`RawRecord`] as it
//! arrives, the parser-produced [`ParsedEvent`], and the flat, ECS-style
//! [`NormalizedEvent`] handed to downstream consumers. Dynamic fields are
//! carried in a tagged-union [`Value`] tree rather than stringly maps.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod normalized;
mod parsed;
mod raw;
mod value;

pub use normalized::{NormalizedEvent, RelatedKind};
pub use parsed::{
    AuthenticationInfo, AuthorizationInfo, DeviceInfo, DnsInfo, FileInfo, NetworkInfo, Outcome,
    ParsedEvent, ProcessInfo, RegistryInfo, Severity, ThreatInfo, UrlInfo, UserInfo,
};
pub use raw::{Priority, RawRecord};
pub use value::{ObjectMap, Value};
