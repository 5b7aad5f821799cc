//! Generic field extraction shared by parser implementations: JSON first,
//! then key-value strategies, then common-pattern and quoted-string
//! extraction. Pure and stateless.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static QUOTED_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z0-9_.\-]+)\s*=\s*"((?:[^"\\]|\\.)*)""#).expect("valid pattern")
});
static QUOTED_STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)+)""#).expect("valid pattern"));

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b")
        .expect("valid pattern")
});
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b").expect("valid pattern")
});
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bhttps?://[^\s"'<>]+"#).expect("valid pattern"));
static MAC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}\b").expect("valid pattern")
});
static ISO8601: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+\-]\d{2}:?\d{2})?\b")
        .expect("valid pattern")
});

/// Options for `extract_from_message`.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Stop after this many fields; hostile records should not balloon.
    pub max_fields: usize,
    /// Run the common-pattern pass (`detected_*` keys).
    pub include_patterns: bool,
    /// Run the quoted-string pass (`quoted_N` keys).
    pub include_quoted: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_fields: 128,
            include_patterns: true,
            include_quoted: true,
        }
    }
}

/// Inferred type of an extracted field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Ip,
    Email,
    Url,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Ip => "ip",
            FieldType::Email => "email",
            FieldType::Url => "url",
        }
    }
}

/// A field with its inferred type and extraction confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedField {
    pub value: String,
    pub field_type: FieldType,
    /// 0.0 to 1.0, from key quality, value quality and verbatim presence.
    pub confidence: f64,
}

/// Extract a string-keyed field map from an arbitrary log message.
///
/// Strategies, in order: whole-payload JSON; four key-value styles
/// (whitespace, double-quoted, comma-delimited, tolerant escape-aware),
/// stopping at the first that yields at least one pair; common patterns
/// under `detected_*`; quoted strings under `quoted_N`.
pub fn extract_from_message(
    message: &str,
    options: &ExtractOptions,
) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let message = message.trim();
    if message.is_empty() {
        return fields;
    }

    if let Some(json_fields) = try_json(message, options.max_fields) {
        fields = json_fields;
    } else {
        let strategies: [fn(&str, usize) -> BTreeMap<String, String>; 4] =
            [kv_whitespace, kv_quoted, kv_comma, kv_tolerant];
        for strategy in strategies {
            let extracted = strategy(message, options.max_fields);
            if !extracted.is_empty() {
                fields = extracted;
                break;
            }
        }
    }

    if options.include_patterns {
        extract_patterns(message, &mut fields);
    }
    if options.include_quoted && fields.len() < options.max_fields {
        extract_quoted(message, &mut fields, options.max_fields);
    }

    fields
}

/// Extraction with per-field type inference and confidence scoring.
pub fn extract_fields_with_confidence(
    message: &str,
    options: &ExtractOptions,
) -> BTreeMap<String, ExtractedField> {
    extract_from_message(message, options)
        .into_iter()
        .map(|(key, value)| {
            let field_type = infer_type(&value);
            let confidence = score_confidence(&key, &value, field_type, message);
            (
                key,
                ExtractedField {
                    value,
                    field_type,
                    confidence,
                },
            )
        })
        .collect()
}

fn try_json(message: &str, max_fields: usize) -> Option<BTreeMap<String, String>> {
    if !message.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(message).ok()?;
    let object = value.as_object()?;

    let mut fields = BTreeMap::new();
    flatten_json(object, None, &mut fields, max_fields);
    Some(fields)
}

fn flatten_json(
    object: &serde_json::Map<String, serde_json::Value>,
    prefix: Option<&str>,
    fields: &mut BTreeMap<String, String>,
    max_fields: usize,
) {
    for (key, value) in object {
        if fields.len() >= max_fields {
            return;
        }
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            serde_json::Value::Object(nested) => {
                flatten_json(nested, Some(&key), fields, max_fields);
            }
            serde_json::Value::String(s) => {
                fields.insert(key, s.clone());
            }
            serde_json::Value::Null => {}
            other => {
                fields.insert(key, other.to_string());
            }
        }
    }
}

fn kv_whitespace(message: &str, max_fields: usize) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for token in message.split_whitespace() {
        if fields.len() >= max_fields {
            break;
        }
        if let Some((key, value)) = token.split_once('=') {
            // Values containing separators belong to another strategy.
            if is_plausible_key(key)
                && !value.is_empty()
                && !value.starts_with('"')
                && !value.contains(',')
                && !value.contains('=')
            {
                fields.insert(key.to_string(), value.trim_matches('\'').to_string());
            }
        }
    }
    fields
}

fn kv_quoted(message: &str, max_fields: usize) -> BTreeMap<String, String> {
    QUOTED_PAIR
        .captures_iter(message)
        .take(max_fields)
        .map(|caps| (caps[1].to_string(), caps[2].replace("\\\"", "\"")))
        .collect()
}

fn kv_comma(message: &str, max_fields: usize) -> BTreeMap<String, String> {
    if !message.contains(',') {
        return BTreeMap::new();
    }
    let mut fields = BTreeMap::new();
    for segment in message.split(',') {
        if fields.len() >= max_fields {
            break;
        }
        if let Some((key, value)) = segment.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if is_plausible_key(key) && !value.is_empty() {
                fields.insert(key.to_string(), value.to_string());
            }
        }
    }
    fields
}

/// Escape-aware scanner for messages mixing quoted and bare values, where
/// the simpler strategies give up.
fn kv_tolerant(message: &str, max_fields: usize) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let bytes = message.as_bytes();
    let mut i = 0;

    while i < bytes.len() && fields.len() < max_fields {
        // Scan a key up to '='.
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            i += 1;
            continue;
        }
        let key = &message[key_start..i];
        i += 1;

        let value = if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let value_start = i;
            let mut escaped = false;
            while i < bytes.len() {
                match bytes[i] {
                    b'\\' if !escaped => escaped = true,
                    b'"' if !escaped => break,
                    _ => escaped = false,
                }
                i += 1;
            }
            let value = &message[value_start..i.min(bytes.len())];
            i += 1;
            value.replace("\\\"", "\"")
        } else {
            let value_start = i;
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            message[value_start..i].to_string()
        };

        if is_plausible_key(key) && !value.is_empty() {
            fields.insert(key.to_string(), value);
        }
    }
    fields
}

fn extract_patterns(message: &str, fields: &mut BTreeMap<String, String>) {
    let patterns: [(&str, &Regex); 5] = [
        ("detected_ip", &IPV4),
        ("detected_email", &EMAIL),
        ("detected_url", &URL),
        ("detected_mac", &MAC),
        ("detected_timestamp", &ISO8601),
    ];
    for (key, pattern) in patterns {
        if let Some(found) = pattern.find(message) {
            fields
                .entry(key.to_string())
                .or_insert_with(|| found.as_str().to_string());
        }
    }
}

fn extract_quoted(message: &str, fields: &mut BTreeMap<String, String>, max_fields: usize) {
    for (index, caps) in QUOTED_STRING.captures_iter(message).enumerate() {
        if fields.len() >= max_fields {
            break;
        }
        let quoted = caps[1].to_string();
        // Values already captured by a key=value strategy are not repeated.
        if fields.values().any(|v| v == &quoted) {
            continue;
        }
        fields.insert(format!("quoted_{}", index + 1), quoted);
    }
}

fn is_plausible_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        && key.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

fn infer_type(value: &str) -> FieldType {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        return FieldType::Boolean;
    }
    if value.parse::<f64>().is_ok() {
        return FieldType::Number;
    }
    if value.parse::<std::net::IpAddr>().is_ok() {
        return FieldType::Ip;
    }
    if EMAIL.is_match(value) && !value.contains(' ') {
        return FieldType::Email;
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return FieldType::Url;
    }
    if crate::normalize::parse_timestamp(value).is_some() {
        return FieldType::Date;
    }
    FieldType::String
}

fn score_confidence(key: &str, value: &str, field_type: FieldType, source: &str) -> f64 {
    let mut confidence: f64 = 0.3;

    // Key quality: descriptive, conventional names score higher than
    // synthesized ones.
    if key.len() >= 3 && !key.starts_with("quoted_") && !key.starts_with("detected_") {
        confidence += 0.2;
    }
    if key.chars().all(|c| c.is_ascii_lowercase() || c == '_' || c == '.') {
        confidence += 0.1;
    }

    // Value quality: typed values and sane lengths beat free text.
    if field_type != FieldType::String {
        confidence += 0.2;
    }
    if !value.is_empty() && value.len() <= 256 {
        confidence += 0.1;
    }

    // A key that appears verbatim in the source was not invented here.
    if source.contains(key) {
        confidence += 0.1;
    }

    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payloads_flatten_with_dots() {
        let fields = extract_from_message(
            r#"{"eventName":"DeleteBucket","userIdentity":{"userName":"alice"},"requestID":42}"#,
            &ExtractOptions::default(),
        );
        assert_eq!(fields["eventName"], "DeleteBucket");
        assert_eq!(fields["userIdentity.userName"], "alice");
        assert_eq!(fields["requestID"], "42");
    }

    #[test]
    fn whitespace_pairs_win_before_other_strategies() {
        let fields = extract_from_message(
            "action=accept src=10.0.0.1 dst=10.0.0.2 proto=tcp",
            &ExtractOptions::default(),
        );
        assert_eq!(fields["action"], "accept");
        assert_eq!(fields["src"], "10.0.0.1");
    }

    #[test]
    fn quoted_pairs_are_unescaped() {
        let fields = extract_from_message(
            r#"msg="user \"root\" login" outcome="failed login""#,
            &ExtractOptions::default(),
        );
        assert_eq!(fields["msg"], r#"user "root" login"#);
        assert_eq!(fields["outcome"], "failed login");
    }

    #[test]
    fn comma_delimited_pairs() {
        let fields = extract_from_message(
            "sev=high,cat=malware,host=web-01",
            &ExtractOptions::default(),
        );
        assert_eq!(fields["cat"], "malware");
        assert_eq!(fields["host"], "web-01");
    }

    #[test]
    fn patterns_land_under_detected_keys() {
        let fields = extract_from_message(
            "Blocked connection from 203.0.113.9 to https://evil.example.com/payload reported by admin@example.com at 2024-05-01T10:00:00Z",
            &ExtractOptions::default(),
        );
        assert_eq!(fields["detected_ip"], "203.0.113.9");
        assert_eq!(fields["detected_email"], "admin@example.com");
        assert!(fields["detected_url"].starts_with("https://evil.example.com"));
        assert_eq!(fields["detected_timestamp"], "2024-05-01T10:00:00Z");
    }

    #[test]
    fn quoted_strings_are_collected() {
        let fields = extract_from_message(
            r#"su: 'pam_unix' said "authentication failure" for "root""#,
            &ExtractOptions::default(),
        );
        assert_eq!(fields["quoted_1"], "authentication failure");
        assert_eq!(fields["quoted_2"], "root");
    }

    #[test]
    fn tolerant_parser_recovers_unterminated_quotes() {
        // Truncated record: the quoted value lost its closing quote, which
        // defeats the stricter strategies.
        let fields = extract_from_message(
            r#"bar= msg="session opened for root"#,
            &ExtractOptions {
                include_patterns: false,
                include_quoted: false,
                ..ExtractOptions::default()
            },
        );
        assert_eq!(fields["msg"], "session opened for root");
    }

    #[test]
    fn max_fields_is_respected() {
        let message = (0..200)
            .map(|i| format!("key{i}=value{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let fields = extract_from_message(
            &message,
            &ExtractOptions {
                max_fields: 16,
                ..ExtractOptions::default()
            },
        );
        assert!(fields.len() <= 16);
    }

    #[test]
    fn type_inference_and_confidence() {
        let fields = extract_fields_with_confidence(
            "src=192.168.1.5 count=42 active=true when=2024-01-01T00:00:00Z note=ok",
            &ExtractOptions::default(),
        );
        assert_eq!(fields["src"].field_type, FieldType::Ip);
        assert_eq!(fields["count"].field_type, FieldType::Number);
        assert_eq!(fields["active"].field_type, FieldType::Boolean);
        assert_eq!(fields["when"].field_type, FieldType::Date);
        assert_eq!(fields["note"].field_type, FieldType::String);

        // Typed value with a verbatim key outscores a synthesized key.
        assert!(fields["src"].confidence > 0.7);
        let detected = &fields["detected_ip"];
        assert!(detected.confidence < fields["src"].confidence);
    }

    #[test]
    fn empty_message_yields_nothing() {
        assert!(extract_from_message("", &ExtractOptions::default()).is_empty());
        assert!(extract_from_message("   ", &ExtractOptions::default()).is_empty());
    }
}
