//! Source-agnostic normalization helpers shared by parser implementations:
//! severity and category mapping tables, and the multi-format timestamp
//! parser.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};

use securewatch_event::Severity;

/// Map a syslog severity code (0-7) to the common grading.
pub fn syslog_severity(code: u8) -> Severity {
    match code {
        0 | 1 => Severity::Critical,
        2 | 3 => Severity::High,
        4 => Severity::Medium,
        _ => Severity::Low,
    }
}

/// Human name for a syslog facility code.
pub fn syslog_facility_name(code: u8) -> &'static str {
    match code {
        0 => "kern",
        1 => "user",
        2 => "mail",
        3 => "daemon",
        4 => "auth",
        5 => "syslog",
        6 => "lpr",
        7 => "news",
        8 => "uucp",
        9 => "cron",
        10 => "authpriv",
        11 => "ftp",
        12 => "ntp",
        13 => "audit",
        14 => "alert",
        15 => "clock",
        16 => "local0",
        17 => "local1",
        18 => "local2",
        19 => "local3",
        20 => "local4",
        21 => "local5",
        22 => "local6",
        23 => "local7",
        _ => "unknown",
    }
}

/// Event category implied by a syslog facility code.
pub fn classify_syslog_facility(code: u8) -> &'static str {
    match code {
        4 | 10 | 13 => "authentication",
        2 | 6 | 7 | 8 | 12 | 16..=23 => "application",
        11 => "network",
        _ => "system",
    }
}

/// Event category implied by a Windows Security event id.
pub fn classify_windows_event_id(event_id: u32) -> &'static str {
    match event_id {
        4624 | 4625 | 4634 | 4647 | 4648 | 4672 | 4776..=4779 => "authentication",
        4720..=4767 => "iam",
        4688 | 4689 | 4697 => "endpoint",
        5140..=5158 => "network",
        1102 | 4608..=4621 => "system",
        _ => "application",
    }
}

/// Parse a timestamp in any of the formats the ingest tier sees: RFC 3339,
/// RFC 3164 (no year), epoch seconds (10 digits), epoch milliseconds
/// (13 digits), and the common log-file formats.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Some(parsed.with_timezone(&Utc));
    }

    if input.len() >= 10 && input.chars().all(|c| c.is_ascii_digit()) {
        match input.len() {
            10 => {
                if let Some(ts) = input
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                {
                    return Some(ts);
                }
            }
            13 => {
                if let Some(ts) = input
                    .parse::<i64>()
                    .ok()
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                {
                    return Some(ts);
                }
            }
            _ => {}
        }
    }

    // RFC 3164 carries no year; resolve it the way the live pipeline does.
    if let Ok(naive) = NaiveDateTime::parse_from_str(
        &format!("{} {input}", resolve_rfc3164_year(input)),
        "%Y %b %e %H:%M:%S",
    ) {
        return Some(Utc.from_utc_datetime(&naive));
    }

    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    // Apache/nginx access-log style, with offset.
    if let Ok(parsed) = DateTime::parse_from_str(input, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(parsed.with_timezone(&Utc));
    }

    None
}

/// Resolve the year for a timestamp that does not carry one. A December
/// timestamp seen in January belongs to the previous year.
pub fn resolve_rfc3164_year(input: &str) -> i32 {
    let now = Utc::now();
    let is_december = input.trim_start().starts_with("Dec");
    if now.month() == 1 && is_december {
        now.year() - 1
    } else {
        now.year()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn severity_codes_map_to_common_grading() {
        assert_eq!(syslog_severity(0), Severity::Critical);
        assert_eq!(syslog_severity(1), Severity::Critical);
        assert_eq!(syslog_severity(2), Severity::High);
        assert_eq!(syslog_severity(4), Severity::Medium);
        assert_eq!(syslog_severity(6), Severity::Low);
    }

    #[test]
    fn facility_classification() {
        assert_eq!(classify_syslog_facility(4), "authentication");
        assert_eq!(classify_syslog_facility(10), "authentication");
        assert_eq!(classify_syslog_facility(0), "system");
        assert_eq!(classify_syslog_facility(11), "network");
        assert_eq!(classify_syslog_facility(16), "application");
    }

    #[test]
    fn windows_event_id_classification() {
        assert_eq!(classify_windows_event_id(4625), "authentication");
        assert_eq!(classify_windows_event_id(4720), "iam");
        assert_eq!(classify_windows_event_id(4688), "endpoint");
        assert_eq!(classify_windows_event_id(5145), "network");
        assert_eq!(classify_windows_event_id(1102), "system");
        assert_eq!(classify_windows_event_id(9999), "application");
    }

    #[test]
    fn parses_rfc3339() {
        let ts = parse_timestamp("2024-01-01T12:00:00+02:00").unwrap();
        assert_eq!(ts.hour(), 10);
    }

    #[test]
    fn parses_epoch_seconds_and_millis() {
        let secs = parse_timestamp("1704110400").unwrap();
        assert_eq!(secs.timestamp(), 1_704_110_400);

        let millis = parse_timestamp("1704110400123").unwrap();
        assert_eq!(millis.timestamp_millis(), 1_704_110_400_123);
    }

    #[test]
    fn parses_rfc3164_with_resolved_year() {
        let ts = parse_timestamp("Oct 11 22:14:15").unwrap();
        assert_eq!(ts.hour(), 22);
        assert!(ts.year() >= 2024);
    }

    #[test]
    fn parses_common_log_formats() {
        assert!(parse_timestamp("2024-06-01 08:30:00.250").is_some());
        assert!(parse_timestamp("2024/06/01 08:30:00").is_some());
        assert!(parse_timestamp("10/Oct/2024:13:55:36 -0700").is_some());
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a time").is_none());
        assert!(parse_timestamp("12345").is_none());
    }
}
