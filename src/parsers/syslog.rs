//! RFC 3164 / RFC 5424 syslog parser.

use chrono::{DateTime, Datelike, Utc};
use syslog_loose::{IncompleteDate, ProcId, Protocol, Variant};

use crate::normalize::{classify_syslog_facility, syslog_facility_name, syslog_severity};
use crate::parser::{LogParser, NormalizeError, ParseError, ParserDescriptor, WireFormat};
use securewatch_event::{
    AuthenticationInfo, DeviceInfo, NormalizedEvent, Outcome, ParsedEvent, RawRecord, RelatedKind,
    Severity, Value,
};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

pub struct SyslogParser {
    descriptor: ParserDescriptor,
}

impl SyslogParser {
    pub fn new() -> Self {
        Self {
            descriptor: ParserDescriptor {
                id: "syslog".to_string(),
                name: "Syslog".to_string(),
                vendor: "generic".to_string(),
                log_source: "syslog".to_string(),
                version: "1.0.0".to_string(),
                format: WireFormat::Syslog,
                category: "system".to_string(),
                priority: 75,
                enabled: true,
            },
        }
    }
}

impl Default for SyslogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser for SyslogParser {
    fn descriptor(&self) -> &ParserDescriptor {
        &self.descriptor
    }

    fn validate(&self, record: &RawRecord) -> bool {
        let text = record.text();
        let line = text.trim_start();
        // A PRI header, or a bare RFC 3164 timestamp.
        (line.starts_with('<')
            && line[1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit()))
            || MONTHS.iter().any(|month| line.starts_with(month))
    }

    fn parse(&self, record: &RawRecord) -> Result<Option<ParsedEvent>, ParseError> {
        let text = record.text();
        let line = text.trim();
        let Ok(message) =
            syslog_loose::parse_message_with_year_exact(line, resolve_year, Variant::Either)
        else {
            return Ok(None);
        };

        let facility_code = message.facility.map(|f| f as u8);
        let severity_code = message.severity.map(|s| s as u8);
        let outcome = classify_outcome(message.msg);
        let category = facility_code
            .map(classify_syslog_facility)
            .unwrap_or("system");

        // Failed authentications grade medium independent of the PRI
        // severity the daemon stamped.
        let severity = if category == "authentication" && outcome == Outcome::Failure {
            Severity::Medium
        } else {
            severity_code.map(syslog_severity).unwrap_or(Severity::Low)
        };

        let hostname = message.hostname.map(ToOwned::to_owned);
        let mut parsed = ParsedEvent::new(
            hostname.clone().unwrap_or_else(|| record.source_id.clone()),
            category,
            record.payload.clone(),
        );
        parsed.timestamp = message.timestamp.map(DateTime::<Utc>::from);
        parsed.action = message
            .appname
            .map_or_else(|| "syslog-message".to_string(), ToOwned::to_owned);
        parsed.outcome = outcome;
        parsed.severity = severity;

        if let Some(hostname) = hostname {
            parsed.device = Some(DeviceInfo {
                hostname: Some(hostname),
                ..DeviceInfo::default()
            });
        }
        if category == "authentication" {
            parsed.authentication = Some(AuthenticationInfo {
                failure_reason: (outcome == Outcome::Failure)
                    .then(|| message.msg.trim().to_string()),
                ..AuthenticationInfo::default()
            });
        }

        if let Some(code) = facility_code {
            parsed.custom.insert("facility_code".into(), i64::from(code).into());
            parsed
                .custom
                .insert("facility_name".into(), syslog_facility_name(code).into());
        }
        if let Some(code) = severity_code {
            parsed.custom.insert("severity_code".into(), i64::from(code).into());
        }
        if let Protocol::RFC5424(version) = message.protocol {
            parsed.custom.insert("version".into(), i64::from(version).into());
        }
        if let Some(appname) = message.appname {
            parsed.custom.insert("appname".into(), appname.into());
        }
        if let Some(procid) = message.procid {
            let value: Value = match procid {
                ProcId::PID(pid) => i64::from(pid).into(),
                ProcId::Name(name) => name.into(),
            };
            parsed.custom.insert("procid".into(), value);
        }
        if let Some(msgid) = message.msgid {
            parsed.custom.insert("msgid".into(), msgid.into());
        }
        parsed.custom.insert("message".into(), message.msg.trim().into());

        Ok(Some(parsed))
    }

    fn normalize(&self, event: &ParsedEvent) -> Result<NormalizedEvent, NormalizeError> {
        let mut normalized = NormalizedEvent::new();
        if let Some(timestamp) = event.timestamp {
            normalized.set_timestamp(timestamp);
        }

        normalized.insert("event.kind", "event");
        normalized.insert(
            "event.category",
            Value::Array(vec![event.category.clone().into()]),
        );
        normalized.insert("event.type", Value::Array(vec!["info".into()]));
        normalized.insert("event.outcome", event.outcome.as_str());
        normalized.insert("event.module", "syslog");
        normalized.set_severity(event.severity);

        if let Some(hostname) = event.device.as_ref().and_then(|d| d.hostname.as_deref()) {
            normalized.insert("host.name", hostname);
            normalized.push_related(RelatedKind::Hosts, hostname);
        }

        if let Some(code) = event.custom.get("facility_code").and_then(Value::as_integer) {
            normalized.insert("syslog.facility.code", code);
        }
        if let Some(name) = event.custom.get("facility_name").and_then(|v| v.as_str()) {
            normalized.insert("syslog.facility.name", name.into_owned());
        }
        if let Some(code) = event.custom.get("severity_code").and_then(Value::as_integer) {
            normalized.insert("syslog.severity.code", code);
        }
        if let Some(appname) = event.custom.get("appname").and_then(|v| v.as_str()) {
            normalized.insert("process.name", appname.into_owned());
        }
        if let Some(pid) = event.custom.get("procid").and_then(Value::as_integer) {
            normalized.insert("process.pid", pid);
        }
        if let Some(message) = event.custom.get("message").and_then(|v| v.as_str()) {
            normalized.insert("message", message.into_owned());
        }

        Ok(normalized)
    }
}

/// Resolve the year for syslog messages that do not include one. A December
/// message seen in January belongs to the previous year.
fn resolve_year((month, _date, _hour, _min, _sec): IncompleteDate) -> i32 {
    let now = Utc::now();
    if now.month() == 1 && month == 12 {
        now.year() - 1
    } else {
        now.year()
    }
}

fn classify_outcome(msg: &str) -> Outcome {
    let msg = msg.to_lowercase();
    const FAILURE: [&str; 6] = [
        "failure",
        "failed",
        "denied",
        "invalid",
        "incorrect",
        "unauthorized",
    ];
    const SUCCESS: [&str; 5] = ["success", "accepted", "opened", "granted", "established"];

    if FAILURE.iter().any(|marker| msg.contains(marker)) {
        Outcome::Failure
    } else if SUCCESS.iter().any(|marker| msg.contains(marker)) {
        Outcome::Success
    } else {
        Outcome::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line: &str) -> RawRecord {
        RawRecord::new(line.to_string(), "collector").with_source_hint("syslog")
    }

    #[test]
    fn validate_sniffs_pri_and_bare_timestamps() {
        let parser = SyslogParser::new();
        assert!(parser.validate(&record("<34>Oct 11 22:14:15 mymachine su: hello")));
        assert!(parser.validate(&record("Oct 11 22:14:15 mymachine su: hello")));
        assert!(!parser.validate(&record(r#"{"eventName":"DeleteBucket"}"#)));
        assert!(!parser.validate(&record("plain text line")));
    }

    #[test]
    fn parses_rfc3164_auth_failure() {
        let parser = SyslogParser::new();
        let raw = record(
            "<34>Oct 11 22:14:15 mymachine su: 'pam_unix(su:auth): authentication failure'",
        );
        let parsed = parser.parse(&raw).unwrap().unwrap();

        assert_eq!(parsed.category, "authentication");
        assert_eq!(parsed.outcome, Outcome::Failure);
        assert_eq!(parsed.severity, Severity::Medium);
        assert_eq!(parsed.source, "mymachine");
        assert_eq!(
            parsed.custom.get("facility_code"),
            Some(&Value::Integer(4))
        );
        assert!(parsed.authentication.is_some());

        let normalized = parser.normalize(&parsed).unwrap();
        assert_eq!(
            normalized.get("event.category").unwrap().as_array().unwrap(),
            &[Value::from("authentication")]
        );
        assert_eq!(normalized.get_str("event.outcome").unwrap(), "failure");
        assert_eq!(normalized.get_integer("syslog.facility.code"), Some(4));
        assert_eq!(normalized.get_str("host.name").unwrap(), "mymachine");
        assert_eq!(normalized.get_str("securewatch.severity").unwrap(), "medium");
    }

    #[test]
    fn parses_rfc5424() {
        let parser = SyslogParser::new();
        let raw = record(
            "<165>1 2024-06-01T12:00:00.000Z web-01 nginx 4321 ID47 - request completed",
        );
        let parsed = parser.parse(&raw).unwrap().unwrap();

        assert!(parsed.timestamp.is_some());
        assert_eq!(parsed.action, "nginx");
        assert_eq!(parsed.custom.get("procid"), Some(&Value::Integer(4321)));
        // local4 facility, notice severity.
        assert_eq!(parsed.custom.get("facility_code"), Some(&Value::Integer(20)));
        assert_eq!(parsed.category, "application");

        let normalized = parser.normalize(&parsed).unwrap();
        assert_eq!(normalized.get_str("process.name").unwrap(), "nginx");
        assert_eq!(normalized.get_integer("process.pid"), Some(4321));
    }

    #[test]
    fn session_open_is_a_success() {
        let parser = SyslogParser::new();
        let raw = record("<38>Oct 11 22:14:15 host sshd[1]: session opened for user deploy");
        let parsed = parser.parse(&raw).unwrap().unwrap();
        assert_eq!(parsed.outcome, Outcome::Success);
        // Facility 4 (auth), severity 6 (info): successful auth stays at the
        // PRI-mapped grading.
        assert_eq!(parsed.category, "authentication");
        assert_eq!(parsed.severity, Severity::Low);
    }
}
