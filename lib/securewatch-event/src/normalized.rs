use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::parsed::Severity;
use crate::value::{ObjectMap, Value};

/// A normalized event: a flat mapping of dotted field names to values,
/// following the ECS-style common schema.
///
/// The schema is open; required keys are enforced by the constructors and
/// setters rather than by the map itself. `event.severity` and
/// `securewatch.severity` always agree because both are written through
/// [`NormalizedEvent::set_severity`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedEvent {
    fields: ObjectMap,
}

impl NormalizedEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field under a dotted key, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Insert a field only when no value is present yet.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn get_str(&self, key: &str) -> Option<std::borrow::Cow<'_, str>> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_integer)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn fields(&self) -> &ObjectMap {
        &self.fields
    }

    /// Set `@timestamp`, rendered as RFC 3339 with timezone at serialization.
    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.fields
            .insert("@timestamp".into(), Value::Timestamp(timestamp));
    }

    pub fn timestamp(&self) -> Option<&DateTime<Utc>> {
        self.fields.get("@timestamp").and_then(Value::as_timestamp)
    }

    /// Set both `event.severity` (numeric) and `securewatch.severity`
    /// (string) from the common grading, keeping the fixed mapping intact.
    pub fn set_severity(&mut self, severity: Severity) {
        self.fields
            .insert("event.severity".into(), Value::Integer(severity.score()));
        self.fields
            .insert("securewatch.severity".into(), severity.as_str().into());
    }

    pub fn severity(&self) -> Option<Severity> {
        self.get_str("securewatch.severity")
            .and_then(|s| s.parse().ok())
    }

    /// Stamp the identity of the parser that produced this event.
    pub fn set_parser(&mut self, id: &str, name: &str, version: &str) {
        self.fields.insert("securewatch.parser.id".into(), id.into());
        self.fields
            .insert("securewatch.parser.name".into(), name.into());
        self.fields
            .insert("securewatch.parser.version".into(), version.into());
    }

    /// Append a value to one of the `related.*` correlation arrays,
    /// deduplicating on the rendered string.
    pub fn push_related(&mut self, kind: RelatedKind, value: impl Into<Value>) {
        let value = value.into();
        let key = kind.field();
        let entry = self
            .fields
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(items) = entry.as_array_mut() {
            if !items.contains(&value) {
                items.push(value);
            }
        }
    }

    /// Append a tag to the `tags` array, deduplicating.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag: Value = tag.into().into();
        let entry = self
            .fields
            .entry("tags".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(items) = entry.as_array_mut() {
            if !items.contains(&tag) {
                items.push(tag);
            }
        }
    }

    /// Render the event as a flat JSON object string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether all required keys of the common schema are present.
    pub fn has_required_fields(&self) -> bool {
        const REQUIRED: [&str; 9] = [
            "@timestamp",
            "event.kind",
            "event.category",
            "event.type",
            "event.outcome",
            "event.severity",
            "securewatch.parser.id",
            "securewatch.confidence",
            "securewatch.severity",
        ];
        REQUIRED.iter().all(|key| self.fields.contains_key(*key))
    }
}

/// The correlation-key arrays aggregated on every normalized event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelatedKind {
    Ip,
    User,
    Hash,
    Hosts,
}

impl RelatedKind {
    pub fn field(self) -> &'static str {
        match self {
            RelatedKind::Ip => "related.ip",
            RelatedKind::User => "related.user",
            RelatedKind::Hash => "related.hash",
            RelatedKind::Hosts => "related.hosts",
        }
    }
}

impl Serialize for NormalizedEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            // Timestamps are rendered as RFC 3339 strings in the flat
            // mapping, matching the wire contract.
            match value {
                Value::Timestamp(ts) => {
                    map.serialize_entry(key, &ts.to_rfc3339_opts(SecondsFormat::Millis, true))?;
                }
                other => map.serialize_entry(key, other)?,
            }
        }
        map.end()
    }
}

impl FromIterator<(String, Value)> for NormalizedEvent {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_fields_agree() {
        let mut event = NormalizedEvent::new();
        event.set_severity(Severity::High);
        assert_eq!(event.get_integer("event.severity"), Some(75));
        assert_eq!(event.get_str("securewatch.severity").unwrap(), "high");
        assert_eq!(event.severity(), Some(Severity::High));
    }

    #[test]
    fn related_arrays_deduplicate() {
        let mut event = NormalizedEvent::new();
        event.push_related(RelatedKind::Ip, "10.0.0.1");
        event.push_related(RelatedKind::Ip, "10.0.0.1");
        event.push_related(RelatedKind::Ip, "10.0.0.2");
        let ips = event.get("related.ip").unwrap().as_array().unwrap();
        assert_eq!(ips.len(), 2);
    }

    #[test]
    fn required_field_check() {
        let mut event = NormalizedEvent::new();
        assert!(!event.has_required_fields());

        event.set_timestamp(Utc::now());
        event.insert("event.kind", "event");
        event.insert("event.category", Value::Array(vec!["network".into()]));
        event.insert("event.type", Value::Array(vec!["info".into()]));
        event.insert("event.outcome", "success");
        event.set_severity(Severity::Low);
        event.set_parser("p1", "Parser One", "1.0.0");
        event.insert("securewatch.confidence", 0.5);
        assert!(event.has_required_fields());
    }

    #[test]
    fn serializes_flat_with_rfc3339_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut event = NormalizedEvent::new();
        event.set_timestamp(ts);
        event.insert("event.kind", "event");
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["@timestamp"], "2024-06-01T00:00:00.000Z");
        assert_eq!(json["event.kind"], "event");
    }
}
