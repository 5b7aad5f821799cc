use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::ObjectMap;

/// Whether the activity an event describes succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }
}

/// Common severity grading shared by every parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// The fixed numeric mapping used for `event.severity`.
    pub fn score(self) -> i64 {
        match self {
            Severity::Low => 25,
            Severity::Medium => 50,
            Severity::High => 75,
            Severity::Critical => 100,
        }
    }

    pub fn from_score(score: i64) -> Self {
        match score {
            i64::MIN..=25 => Severity::Low,
            26..=50 => Severity::Medium,
            51..=75 => Severity::High,
            _ => Severity::Critical,
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: Option<String>,
    pub id: Option<String>,
    pub email: Option<String>,
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub source_ip: Option<String>,
    pub source_port: Option<u16>,
    pub destination_ip: Option<String>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Option<i64>,
    pub name: Option<String>,
    pub command_line: Option<String>,
    pub executable: Option<String>,
    pub parent_pid: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: Option<String>,
    pub name: Option<String>,
    pub hash_sha256: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub key: Option<String>,
    pub value_name: Option<String>,
    pub value_data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UrlInfo {
    pub full: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsInfo {
    pub question_name: Option<String>,
    pub question_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationInfo {
    pub method: Option<String>,
    pub target_user: Option<String>,
    pub source_ip: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationInfo {
    pub permission: Option<String>,
    pub resource: Option<String>,
    pub granted: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatInfo {
    pub indicator: Option<String>,
    pub technique: Option<String>,
    pub tactic: Option<String>,
    pub score: Option<f64>,
}

/// The intermediate event a parser produces before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    /// The event's own timestamp, as extracted from the record. `None` when
    /// the record carried no usable timestamp; normalization then falls back
    /// to the arrival time while keeping a distinct `ingestion.timestamp`.
    pub timestamp: Option<DateTime<Utc>>,
    pub source: String,
    pub category: String,
    pub action: String,
    pub outcome: Outcome,
    pub severity: Severity,
    /// The raw bytes this event was parsed from.
    pub raw: Bytes,
    pub user: Option<UserInfo>,
    pub device: Option<DeviceInfo>,
    pub network: Option<NetworkInfo>,
    pub process: Option<ProcessInfo>,
    pub file: Option<FileInfo>,
    pub registry: Option<RegistryInfo>,
    pub url: Option<UrlInfo>,
    pub dns: Option<DnsInfo>,
    pub authentication: Option<AuthenticationInfo>,
    pub authorization: Option<AuthorizationInfo>,
    pub threat: Option<ThreatInfo>,
    /// Parser-private fields, carried as a value tree.
    #[serde(default, skip_serializing_if = "ObjectMap::is_empty")]
    pub custom: ObjectMap,
}

impl ParsedEvent {
    pub fn new(source: impl Into<String>, category: impl Into<String>, raw: Bytes) -> Self {
        Self {
            timestamp: None,
            source: source.into(),
            category: category.into(),
            action: String::new(),
            outcome: Outcome::Unknown,
            severity: Severity::Low,
            raw,
            user: None,
            device: None,
            network: None,
            process: None,
            file: None,
            registry: None,
            url: None,
            dns: None,
            authentication: None,
            authorization: None,
            threat: None,
            custom: ObjectMap::new(),
        }
    }

    /// Count of structured sub-records present, used by confidence scoring.
    pub fn subrecord_count(&self) -> usize {
        [
            self.user.is_some(),
            self.device.is_some(),
            self.network.is_some(),
            self.process.is_some(),
            self.file.is_some(),
            self.registry.is_some(),
            self.url.is_some(),
            self.dns.is_some(),
            self.authentication.is_some(),
            self.authorization.is_some(),
            self.threat.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// Whether any of the security-significant sub-records is present.
    pub fn has_security_context(&self) -> bool {
        self.authentication.is_some() || self.authorization.is_some() || self.threat.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_is_fixed() {
        assert_eq!(Severity::Low.score(), 25);
        assert_eq!(Severity::Medium.score(), 50);
        assert_eq!(Severity::High.score(), 75);
        assert_eq!(Severity::Critical.score(), 100);
        for severity in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert_eq!(Severity::from_score(severity.score()), severity);
        }
    }

    #[test]
    fn subrecord_counting() {
        let mut event = ParsedEvent::new("test", "network", Bytes::new());
        assert_eq!(event.subrecord_count(), 0);
        assert!(!event.has_security_context());

        event.network = Some(NetworkInfo::default());
        event.authentication = Some(AuthenticationInfo::default());
        assert_eq!(event.subrecord_count(), 2);
        assert!(event.has_security_context());
    }
}
