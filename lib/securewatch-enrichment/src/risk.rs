//! Risk scoring: the `risk_score` formula applied by `calculate` actions.

use std::net::IpAddr;

use securewatch_event::{NormalizedEvent, Value};

/// Whether an address is externally routable: not RFC 1918, not loopback,
/// not link-local, not a ULA (fc00::/7).
pub fn is_external_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback() || v4.is_link_local()),
        IpAddr::V6(v6) => {
            let is_ula = (v6.octets()[0] & 0xfe) == 0xfc;
            !(v6.is_loopback() || is_ula)
        }
    }
}

fn category_contains(event: &NormalizedEvent, needle: &str) -> bool {
    event
        .get("event.category")
        .and_then(Value::as_array)
        .is_some_and(|categories| {
            categories
                .iter()
                .any(|c| c.as_str().is_some_and(|s| s == needle))
        })
}

fn has_admin_role(event: &NormalizedEvent) -> bool {
    event
        .get("user.roles")
        .and_then(Value::as_array)
        .is_some_and(|roles| {
            roles
                .iter()
                .any(|r| r.as_str().is_some_and(|s| s.eq_ignore_ascii_case("admin")))
        })
}

/// Compute the risk score for an event, in `[0.0, 100.0]`.
///
/// Base is 40% of the numeric severity. Authentication failures add 30,
/// IAM scope or an admin role adds 20, and an externally routable source
/// address adds 15.
pub fn risk_score(event: &NormalizedEvent) -> f64 {
    let severity = event.get_integer("event.severity").unwrap_or(0) as f64;
    let mut score = severity * 0.4;

    let failed = event
        .get_str("event.outcome")
        .is_some_and(|outcome| outcome == "failure");
    if failed && category_contains(event, "authentication") {
        score += 30.0;
    }

    if category_contains(event, "iam") || has_admin_role(event) {
        score += 20.0;
    }

    let external_source = event
        .get_str("source.ip")
        .and_then(|ip| ip.parse::<IpAddr>().ok())
        .is_some_and(is_external_ip);
    if external_source {
        score += 15.0;
    }

    score.clamp(0.0, 100.0)
}
