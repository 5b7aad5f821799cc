//! The enrichment engine: evaluates rules highest-priority-first and applies
//! their actions to the event in place.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use crate::providers::{
    GeoInfo, GeoIpProvider, MockGeoIpProvider, MockThreatIntelProvider, ThreatIndicator,
    ThreatIntelProvider, TtlCache,
};
use crate::tables::TableRegistry;
use crate::{risk, Action, ActionKind, Condition, ConditionOperator, Rule};
use securewatch_event::{NormalizedEvent, Value};

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    /// Budget for one provider lookup; a slow provider degrades to no
    /// enrichment rather than stalling the pipeline.
    pub lookup_timeout: Duration,
    pub cache_ttl: Duration,
    /// When false, the deterministic mock provider is used instead.
    pub geoip_enabled: bool,
    pub threat_intel_enabled: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookup_timeout: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(300),
            geoip_enabled: false,
            threat_intel_enabled: false,
        }
    }
}

/// Rule-driven enrichment. `enrich` never fails: per-rule errors are logged,
/// counted, and swallowed.
pub struct EnrichmentEngine {
    config: EnrichmentConfig,
    rules: RwLock<Vec<Rule>>,
    tables: TableRegistry,
    geoip: Arc<dyn GeoIpProvider>,
    threat: Arc<dyn ThreatIntelProvider>,
    geo_cache: TtlCache<IpAddr, Option<GeoInfo>>,
    threat_cache: TtlCache<String, Option<ThreatIndicator>>,
}

impl EnrichmentEngine {
    /// Build an engine with mock providers (the disabled-provider path).
    pub fn new(config: EnrichmentConfig) -> Self {
        Self::with_providers(
            config,
            Arc::new(MockGeoIpProvider),
            Arc::new(MockThreatIntelProvider::default()),
        )
    }

    pub fn with_providers(
        config: EnrichmentConfig,
        geoip: Arc<dyn GeoIpProvider>,
        threat: Arc<dyn ThreatIntelProvider>,
    ) -> Self {
        let cache_ttl = config.cache_ttl;
        Self {
            config,
            rules: RwLock::new(Vec::new()),
            tables: TableRegistry::new(),
            geoip,
            threat,
            geo_cache: TtlCache::new(cache_ttl),
            threat_cache: TtlCache::new(cache_ttl),
        }
    }

    /// An engine preloaded with the stock rule set: geolocation and threat
    /// intel on the source address, and risk scoring.
    pub fn with_default_rules(config: EnrichmentConfig) -> Self {
        let engine = Self::new(config);
        for rule in default_rules() {
            engine.add_rule(rule);
        }
        engine
    }

    /// Insert or replace a rule by id, keeping priority order.
    pub fn add_rule(&self, rule: Rule) {
        let mut rules = self.rules.write();
        rules.retain(|existing| existing.id != rule.id);
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        rules.len() != before
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Apply all matching rules to the event.
    pub async fn enrich(&self, event: &mut NormalizedEvent) {
        if !self.config.enabled {
            return;
        }

        let rules = self.rules();
        let mut applied = 0i64;
        for rule in &rules {
            if !rule.enabled {
                continue;
            }
            if !rule.conditions.iter().all(|c| condition_matches(event, c)) {
                continue;
            }
            applied += 1;
            for action in &rule.actions {
                if let Err(error) = self.apply_action(event, action).await {
                    warn!(
                        message = "Enrichment action failed.",
                        rule = %rule.id,
                        error = %error,
                    );
                    metrics::counter!("enrichment.rule_errors", "rule" => rule.id.clone())
                        .increment(1);
                }
            }
        }

        event.insert("securewatch.enrichment.timestamp", Utc::now());
        event.insert("securewatch.enrichment.rules_applied", applied);
        metrics::counter!("enrichment.events_enriched").increment(1);
    }

    async fn apply_action(
        &self,
        event: &mut NormalizedEvent,
        action: &Action,
    ) -> Result<(), String> {
        match action.kind {
            ActionKind::AddField => {
                let field = required(&action.field, "field")?;
                let value = action.value.clone().ok_or("add_field requires a value")?;
                event.insert_if_absent(field, value);
                Ok(())
            }
            ActionKind::SetField => {
                let field = required(&action.field, "field")?;
                let value = action.value.clone().ok_or("set_field requires a value")?;
                event.insert(field, value);
                Ok(())
            }
            ActionKind::AddTag => {
                let tag = action
                    .value
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .ok_or("add_tag requires a string value")?
                    .into_owned();
                event.add_tag(tag);
                Ok(())
            }
            ActionKind::Lookup => self.apply_lookup(event, action),
            ActionKind::Geoip => self.apply_geoip(event, action).await,
            ActionKind::ThreatIntel => self.apply_threat_intel(event, action).await,
            ActionKind::Calculate => apply_calculate(event, action),
        }
    }

    fn apply_lookup(&self, event: &mut NormalizedEvent, action: &Action) -> Result<(), String> {
        let table = required(&action.source, "source")?;
        let key_field = required(&action.field, "field")?;
        let Some(key) = event.get_str(key_field).map(|s| s.into_owned()) else {
            return Ok(());
        };
        if let Some(row) = self.tables.find(table, &key) {
            for (column, value) in row {
                event.insert_if_absent(format!("enrichment.{table}.{column}"), value);
            }
        }
        Ok(())
    }

    async fn apply_geoip(&self, event: &mut NormalizedEvent, action: &Action) -> Result<(), String> {
        let field = action.field.as_deref().unwrap_or("source.ip");
        let Some(raw) = event.get_str(field).map(|s| s.into_owned()) else {
            return Ok(());
        };
        let ip: IpAddr = raw.parse().map_err(|_| format!("{field} is not an IP"))?;

        let info = match self.geo_cache.get(&ip) {
            Some(cached) => cached,
            None => {
                let answer = tokio::time::timeout(self.config.lookup_timeout, self.geoip.lookup(ip))
                    .await
                    .map_err(|_| "geoip lookup timed out".to_string())?;
                self.geo_cache.insert(ip, answer.clone());
                answer
            }
        };

        if let Some(info) = info {
            let prefix = field
                .strip_suffix(".ip")
                .map_or_else(|| "geo".to_string(), |base| format!("{base}.geo"));
            event.insert_if_absent(format!("{prefix}.country_iso_code"), info.country_iso_code);
            if let Some(city) = info.city_name {
                event.insert_if_absent(format!("{prefix}.city_name"), city);
            }
            if let (Some(lat), Some(lon)) = (info.latitude, info.longitude) {
                event.insert_if_absent(format!("{prefix}.location.lat"), lat);
                event.insert_if_absent(format!("{prefix}.location.lon"), lon);
            }
        }
        Ok(())
    }

    async fn apply_threat_intel(
        &self,
        event: &mut NormalizedEvent,
        action: &Action,
    ) -> Result<(), String> {
        let field = action.field.as_deref().unwrap_or("source.ip");
        let Some(indicator) = event.get_str(field).map(|s| s.into_owned()) else {
            return Ok(());
        };

        let verdict = match self.threat_cache.get(&indicator) {
            Some(cached) => cached,
            None => {
                let answer = tokio::time::timeout(
                    self.config.lookup_timeout,
                    self.threat.lookup(&indicator),
                )
                .await
                .map_err(|_| "threat intel lookup timed out".to_string())?;
                self.threat_cache.insert(indicator.clone(), answer.clone());
                answer
            }
        };

        if let Some(verdict) = verdict {
            event.insert_if_absent("threat.indicator.value", indicator);
            event.insert("threat.indicator.matched", verdict.matched);
            event.insert("threat.indicator.score", verdict.score);
            event.insert("threat.indicator.provider", verdict.provider);
            if verdict.matched {
                event.add_tag("threat-intel-match");
            }
        }
        Ok(())
    }
}

fn apply_calculate(event: &mut NormalizedEvent, action: &Action) -> Result<(), String> {
    let formula = required(&action.formula, "formula")?;
    let target = action.field.as_deref().unwrap_or("event.risk_score");
    match formula {
        "risk_score" => {
            let score = risk::risk_score(event);
            event.insert(target, score);
            Ok(())
        }
        other => Err(format!("unknown formula: {other}")),
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, String> {
    field
        .as_deref()
        .ok_or_else(|| format!("action requires `{name}`"))
}

fn condition_matches(event: &NormalizedEvent, condition: &Condition) -> bool {
    let value = event.get(&condition.field);
    match condition.operator {
        ConditionOperator::Exists => value.is_some_and(|v| !v.is_null()),
        ConditionOperator::Equals => match (value, &condition.value) {
            (Some(actual), Some(expected)) => {
                values_equal(actual, expected, condition.case_sensitive)
            }
            _ => false,
        },
        ConditionOperator::Contains => match (value, &condition.value) {
            (Some(Value::Array(items)), Some(expected)) => items
                .iter()
                .any(|item| values_equal(item, expected, condition.case_sensitive)),
            (Some(actual), Some(expected)) => {
                match (actual.as_str(), expected.as_str()) {
                    (Some(haystack), Some(needle)) => {
                        if condition.case_sensitive {
                            haystack.contains(needle.as_ref())
                        } else {
                            haystack
                                .to_lowercase()
                                .contains(&needle.to_lowercase())
                        }
                    }
                    _ => false,
                }
            }
            _ => false,
        },
        ConditionOperator::Matches => {
            let (Some(actual), Some(pattern)) = (value, &condition.value) else {
                return false;
            };
            let Some(pattern) = pattern.as_str() else {
                return false;
            };
            match regex::Regex::new(&pattern) {
                Ok(regex) => regex.is_match(&actual.to_string_lossy()),
                Err(error) => {
                    debug!(message = "Invalid condition pattern.", %error);
                    false
                }
            }
        }
        ConditionOperator::In => value.is_some_and(|actual| {
            condition
                .values
                .iter()
                .any(|candidate| values_equal(actual, candidate, condition.case_sensitive))
        }),
        ConditionOperator::Range => {
            let Some(actual) = value.and_then(Value::as_float) else {
                return false;
            };
            let (Some(min), Some(max)) = (
                condition.values.first().and_then(Value::as_float),
                condition.values.get(1).and_then(Value::as_float),
            ) else {
                return false;
            };
            actual >= min && actual <= max
        }
    }
}

fn values_equal(a: &Value, b: &Value, case_sensitive: bool) -> bool {
    if case_sensitive {
        return a == b;
    }
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
        _ => a == b,
    }
}

/// The stock rule set shipped with the engine.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "geoip-source".to_string(),
            name: "Geolocate source address".to_string(),
            priority: 50,
            enabled: true,
            conditions: vec![Condition::exists("source.ip")],
            actions: vec![Action::geoip("source.ip")],
        },
        Rule {
            id: "threat-intel-source".to_string(),
            name: "Threat intel on source address".to_string(),
            priority: 40,
            enabled: true,
            conditions: vec![Condition::exists("source.ip")],
            actions: vec![Action::threat_intel("source.ip")],
        },
        Rule {
            id: "risk-scoring".to_string(),
            name: "Risk score".to_string(),
            priority: 10,
            enabled: true,
            conditions: vec![Condition::exists("event.severity")],
            actions: vec![Action::calculate("risk_score", "event.risk_score")],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use securewatch_event::Severity;

    fn base_event() -> NormalizedEvent {
        let mut event = NormalizedEvent::new();
        event.set_severity(Severity::High);
        event.insert("event.outcome", "failure");
        event.insert(
            "event.category",
            Value::Array(vec!["authentication".into()]),
        );
        event.insert("source.ip", "203.0.113.5");
        event.insert("user.name", "alice");
        event
    }

    fn rule(id: &str, priority: i64, conditions: Vec<Condition>, actions: Vec<Action>) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            enabled: true,
            conditions,
            actions,
        }
    }

    #[tokio::test]
    async fn stamps_are_written_on_every_enriched_event() {
        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        let mut event = base_event();
        engine.enrich(&mut event).await;
        assert!(event.contains("securewatch.enrichment.timestamp"));
        assert_eq!(
            event.get_integer("securewatch.enrichment.rules_applied"),
            Some(0)
        );
    }

    #[tokio::test]
    async fn rules_apply_in_priority_order() {
        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        engine.add_rule(rule(
            "low",
            1,
            vec![],
            vec![Action::add_field("labels.tier", "low")],
        ));
        engine.add_rule(rule(
            "high",
            100,
            vec![],
            vec![Action::add_field("labels.tier", "high")],
        ));

        let mut event = base_event();
        engine.enrich(&mut event).await;
        // add_field does not overwrite, so the higher-priority rule wins.
        assert_eq!(event.get_str("labels.tier").unwrap(), "high");
        assert_eq!(
            event.get_integer("securewatch.enrichment.rules_applied"),
            Some(2)
        );
    }

    #[tokio::test]
    async fn conditions_gate_actions() {
        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        engine.add_rule(rule(
            "only-failures",
            10,
            vec![Condition::equals("event.outcome", "failure")],
            vec![Action::add_tag("failed")],
        ));
        engine.add_rule(rule(
            "only-successes",
            10,
            vec![Condition::equals("event.outcome", "success")],
            vec![Action::add_tag("succeeded")],
        ));

        let mut event = base_event();
        engine.enrich(&mut event).await;
        let tags = event.get("tags").unwrap().as_array().unwrap();
        assert_eq!(tags, &[Value::from("failed")]);
    }

    #[tokio::test]
    async fn lookup_resolves_against_registered_tables() {
        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        let mut row = securewatch_event::ObjectMap::new();
        row.insert("department".into(), Value::from("engineering"));
        engine.tables().load(vec![
            crate::tables::LookupTable::new("users", "user.name").with_row("alice", row),
        ]);
        engine.tables().finish_load();

        engine.add_rule(rule(
            "user-lookup",
            10,
            vec![Condition::exists("user.name")],
            vec![Action::lookup("users", "user.name")],
        ));

        let mut event = base_event();
        engine.enrich(&mut event).await;
        assert_eq!(
            event.get_str("enrichment.users.department").unwrap(),
            "engineering"
        );
    }

    #[tokio::test]
    async fn geoip_writes_under_the_field_prefix() {
        let engine = EnrichmentEngine::with_default_rules(EnrichmentConfig::default());
        let mut event = base_event();
        engine.enrich(&mut event).await;
        assert_eq!(event.get_str("source.geo.country_iso_code").unwrap(), "US");
    }

    #[tokio::test]
    async fn threat_intel_flags_seeded_indicator() {
        let engine = EnrichmentEngine::with_providers(
            EnrichmentConfig::default(),
            Arc::new(MockGeoIpProvider),
            Arc::new(MockThreatIntelProvider::with_indicators(["203.0.113.5"])),
        );
        engine.add_rule(rule(
            "ti",
            10,
            vec![Condition::exists("source.ip")],
            vec![Action::threat_intel("source.ip")],
        ));

        let mut event = base_event();
        engine.enrich(&mut event).await;
        assert_eq!(
            event.get("threat.indicator.matched"),
            Some(&Value::Boolean(true))
        );
        let tags = event.get("tags").unwrap().as_array().unwrap();
        assert!(tags.contains(&Value::from("threat-intel-match")));
    }

    #[tokio::test]
    async fn risk_score_matches_formula() {
        let engine = EnrichmentEngine::with_default_rules(EnrichmentConfig::default());
        let mut event = base_event();
        engine.enrich(&mut event).await;
        // 75 * 0.4 + 30 (auth failure) + 15 (external source) = 75.
        let score = event.get("event.risk_score").and_then(Value::as_float);
        assert_eq!(score, Some(75.0));
    }

    #[tokio::test]
    async fn rule_errors_are_swallowed() {
        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        engine.add_rule(rule(
            "broken",
            99,
            vec![],
            vec![Action {
                kind: ActionKind::Calculate,
                field: None,
                value: None,
                source: None,
                formula: Some("no_such_formula".to_string()),
            }],
        ));
        engine.add_rule(rule(
            "working",
            1,
            vec![],
            vec![Action::add_tag("made-it")],
        ));

        let mut event = base_event();
        engine.enrich(&mut event).await;
        let tags = event.get("tags").unwrap().as_array().unwrap();
        assert!(tags.contains(&Value::from("made-it")));
    }

    #[tokio::test]
    async fn disabled_engine_is_a_no_op() {
        let engine = EnrichmentEngine::with_default_rules(EnrichmentConfig {
            enabled: false,
            ..EnrichmentConfig::default()
        });
        let mut event = base_event();
        let before = event.clone();
        engine.enrich(&mut event).await;
        assert_eq!(event, before);
    }

    #[test]
    fn range_and_in_operators() {
        let mut event = NormalizedEvent::new();
        event.insert("event.severity", 75i64);
        event.insert("event.outcome", "failure");

        let range = Condition {
            field: "event.severity".to_string(),
            operator: ConditionOperator::Range,
            value: None,
            values: vec![Value::Integer(50), Value::Integer(100)],
            case_sensitive: false,
        };
        assert!(condition_matches(&event, &range));

        let within = Condition {
            field: "event.outcome".to_string(),
            operator: ConditionOperator::In,
            value: None,
            values: vec![Value::from("failure"), Value::from("unknown")],
            case_sensitive: false,
        };
        assert!(condition_matches(&event, &within));
    }

    #[test]
    fn matches_operator_uses_regex() {
        let mut event = NormalizedEvent::new();
        event.insert("user.name", "svc-deploy-01");
        let condition = Condition {
            field: "user.name".to_string(),
            operator: ConditionOperator::Matches,
            value: Some(Value::from(r"^svc-[a-z]+-\d+$")),
            values: vec![],
            case_sensitive: true,
        };
        assert!(condition_matches(&event, &condition));
    }
}
