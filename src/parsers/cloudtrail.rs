//! AWS CloudTrail JSON parser.

use crate::normalize::parse_timestamp;
use crate::parser::{LogParser, NormalizeError, ParseError, ParserDescriptor, WireFormat};
use securewatch_event::{
    NetworkInfo, NormalizedEvent, Outcome, ParsedEvent, RawRecord, RelatedKind, Severity,
    UserInfo, Value,
};

pub struct CloudTrailParser {
    descriptor: ParserDescriptor,
}

impl CloudTrailParser {
    pub fn new() -> Self {
        Self {
            descriptor: ParserDescriptor {
                id: "aws-cloudtrail".to_string(),
                name: "AWS CloudTrail".to_string(),
                vendor: "aws".to_string(),
                log_source: "aws".to_string(),
                version: "1.0.0".to_string(),
                format: WireFormat::Json,
                category: "cloud".to_string(),
                priority: 70,
                enabled: true,
            },
        }
    }
}

impl Default for CloudTrailParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser for CloudTrailParser {
    fn descriptor(&self) -> &ParserDescriptor {
        &self.descriptor
    }

    fn validate(&self, record: &RawRecord) -> bool {
        let text = record.text();
        let line = text.trim_start();
        line.starts_with('{') && (line.contains("\"eventName\"") || line.contains("\"eventTime\""))
    }

    fn parse(&self, record: &RawRecord) -> Result<Option<ParsedEvent>, ParseError> {
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(&record.payload) else {
            return Ok(None);
        };
        let Some(object) = json.as_object() else {
            return Ok(None);
        };
        let Some(event_name) = object.get("eventName").and_then(|v| v.as_str()) else {
            return Ok(None);
        };

        let event_source = object
            .get("eventSource")
            .and_then(|v| v.as_str())
            .unwrap_or("aws-cloudtrail");
        let error_code = object.get("errorCode").and_then(|v| v.as_str());
        let outcome = if error_code.is_some() {
            Outcome::Failure
        } else {
            Outcome::Success
        };
        let category = classify(event_name, event_source, error_code);
        let severity = grade(event_name, outcome, error_code);

        let mut parsed = ParsedEvent::new(event_source, category, record.payload.clone());
        parsed.timestamp = object
            .get("eventTime")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        parsed.action = event_name.to_string();
        parsed.outcome = outcome;
        parsed.severity = severity;

        if let Some(identity) = object.get("userIdentity").and_then(|v| v.as_object()) {
            let name = identity
                .get("userName")
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned);
            let arn = identity
                .get("arn")
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned);
            if name.is_some() || arn.is_some() {
                parsed.user = Some(UserInfo {
                    name,
                    id: arn.clone(),
                    ..UserInfo::default()
                });
            }
            if let Some(kind) = identity.get("type").and_then(|v| v.as_str()) {
                parsed.custom.insert("user_type".into(), kind.into());
            }
            if let Some(arn) = arn {
                parsed.custom.insert("user_arn".into(), arn.into());
            }
        }

        if let Some(source_ip) = object.get("sourceIPAddress").and_then(|v| v.as_str()) {
            parsed.network = Some(NetworkInfo {
                source_ip: Some(source_ip.to_string()),
                ..NetworkInfo::default()
            });
        }

        if let Some(region) = object.get("awsRegion").and_then(|v| v.as_str()) {
            parsed.custom.insert("region".into(), region.into());
        }
        if let Some(request_id) = object.get("requestID").and_then(|v| v.as_str()) {
            parsed.custom.insert("request_id".into(), request_id.into());
        }
        if let Some(code) = error_code {
            parsed.custom.insert("error_code".into(), code.into());
        }
        if let Some(message) = object.get("errorMessage").and_then(|v| v.as_str()) {
            parsed.custom.insert("error_message".into(), message.into());
        }

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
        normalized.insert(
            "event.type",
            Value::Array(vec![event_type(event).into()]),
        );
        normalized.insert("event.action", event.action.clone());
        normalized.insert("event.outcome", event.outcome.as_str());
        normalized.insert("event.provider", event.source.clone());
        normalized.insert("event.module", "aws-cloudtrail");
        normalized.set_severity(event.severity);

        normalized.insert("cloud.provider", "aws");
        if let Some(region) = event.custom.get("region").and_then(|v| v.as_str()) {
            normalized.insert("cloud.region", region.into_owned());
        }

        if let Some(ip) = event.network.as_ref().and_then(|n| n.source_ip.as_deref()) {
            normalized.insert("source.ip", ip);
            normalized.push_related(RelatedKind::Ip, ip);
        }
        if let Some(name) = event.user.as_ref().and_then(|u| u.name.as_deref()) {
            normalized.insert("user.name", name);
            normalized.push_related(RelatedKind::User, name);
        }
        if let Some(arn) = event.custom.get("user_arn").and_then(|v| v.as_str()) {
            normalized.insert("user.id", arn.into_owned());
        }

        if let Some(code) = event.custom.get("error_code").and_then(|v| v.as_str()) {
            normalized.insert("aws.cloudtrail.error_code", code.into_owned());
        }
        if let Some(message) = event.custom.get("error_message").and_then(|v| v.as_str()) {
            normalized.insert("aws.cloudtrail.error_message", message.into_owned());
        }

        Ok(normalized)
    }
}

fn classify(event_name: &str, event_source: &str, error_code: Option<&str>) -> &'static str {
    if matches!(
        error_code,
        Some("AccessDenied" | "UnauthorizedOperation" | "Client.UnauthorizedOperation")
    ) {
        return "iam";
    }
    if event_name.contains("Login") || event_source.starts_with("signin") {
        return "authentication";
    }
    if event_source.starts_with("iam") || event_source.starts_with("sts") {
        return "iam";
    }
    "cloud"
}

fn grade(event_name: &str, outcome: Outcome, error_code: Option<&str>) -> Severity {
    let destructive = event_name.starts_with("Delete") || event_name.starts_with("Terminate");
    match (outcome, error_code) {
        (Outcome::Failure, Some("AccessDenied" | "UnauthorizedOperation")) => Severity::High,
        (Outcome::Failure, _) => Severity::Medium,
        (Outcome::Success, _) if destructive => Severity::Medium,
        _ => Severity::Low,
    }
}

fn event_type(event: &ParsedEvent) -> &'static str {
    let denied = event
        .custom
        .get("error_code")
        .and_then(|v| v.as_str())
        .is_some_and(|code| code.contains("Denied") || code.contains("Unauthorized"));
    if denied {
        "denied"
    } else if event.action.starts_with("Delete") {
        "deletion"
    } else if event.action.starts_with("Create") {
        "creation"
    } else {
        "info"
    }
}
