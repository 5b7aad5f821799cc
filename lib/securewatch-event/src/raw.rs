use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority band 1 (highest) through 5 (lowest) attached to a record.
///
/// Lower numbers receive preferential admission under emergency throttling,
/// and bands 1-2 are mirrored to disk at enqueue for durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(5);

    /// Build a priority, clamping out-of-range values into 1..=5.
    pub fn new(value: u8) -> Self {
        Priority(value.clamp(1, 5))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Whether this band is durable (mirrored to disk at enqueue).
    pub fn is_durable(self) -> bool {
        self.0 <= 2
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(3)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque log record as it arrives from a collector, before any parser
/// has looked at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// The raw payload bytes, untouched.
    pub payload: Bytes,
    /// When this record entered the ingestion tier.
    pub ingested_at: DateTime<Utc>,
    /// Identifier of the ingest source (listener, agent, forwarder).
    pub source_id: String,
    /// Optional hint naming the log source family, e.g. `syslog` or `aws`.
    pub source_hint: Option<String>,
    /// Optional hint naming the event category, e.g. `authentication`.
    pub category_hint: Option<String>,
    /// Priority band, defaulting to 3.
    pub priority: Priority,
}

impl RawRecord {
    pub fn new(payload: impl Into<Bytes>, source_id: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ingested_at: Utc::now(),
            source_id: source_id.into(),
            source_hint: None,
            category_hint: None,
            priority: Priority::default(),
        }
    }

    #[must_use]
    pub fn with_source_hint(mut self, hint: impl Into<String>) -> Self {
        self.source_hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_category_hint(mut self, hint: impl Into<String>) -> Self {
        self.category_hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The payload as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
