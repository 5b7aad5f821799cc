//! External enrichment providers (geolocation, threat intelligence) behind
//! async traits, with a TTL cache in front of each.
//!
//! When a provider is disabled in configuration the engine substitutes the
//! mock implementation, so rule sets behave identically in tests and in
//! deployments without provider credentials.

use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::risk::is_external_ip;

/// Geolocation answer for an IP address.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    pub country_iso_code: String,
    pub city_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[async_trait]
pub trait GeoIpProvider: Send + Sync {
    /// Resolve an address. `None` means the provider has no answer, which
    /// is not an error.
    async fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Threat-intelligence verdict for an indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatIndicator {
    pub matched: bool,
    pub score: f64,
    pub provider: String,
    pub categories: Vec<String>,
}

#[async_trait]
pub trait ThreatIntelProvider: Send + Sync {
    async fn lookup(&self, indicator: &str) -> Option<ThreatIndicator>;
}

/// Deterministic stand-in used when geolocation is disabled: external
/// addresses resolve to a fixed locale, internal ones to nothing.
#[derive(Debug, Default)]
pub struct MockGeoIpProvider;

#[async_trait]
impl GeoIpProvider for MockGeoIpProvider {
    async fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        if !is_external_ip(ip) {
            return None;
        }
        Some(GeoInfo {
            country_iso_code: "US".to_string(),
            city_name: Some("Ashburn".to_string()),
            latitude: Some(39.0438),
            longitude: Some(-77.4874),
        })
    }
}

/// Deterministic stand-in used when threat intel is disabled. Indicators
/// can be seeded for tests; everything else is a clean verdict.
#[derive(Debug, Default)]
pub struct MockThreatIntelProvider {
    listed: HashSet<String>,
}

impl MockThreatIntelProvider {
    pub fn with_indicators<I, S>(indicators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            listed: indicators.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ThreatIntelProvider for MockThreatIntelProvider {
    async fn lookup(&self, indicator: &str) -> Option<ThreatIndicator> {
        let matched = self.listed.contains(indicator);
        Some(ThreatIndicator {
            matched,
            score: if matched { 85.0 } else { 0.0 },
            provider: "mock".to_string(),
            categories: if matched {
                vec!["known-bad".to_string()]
            } else {
                Vec::new()
            },
        })
    }
}

/// A small TTL cache for provider answers. Negative answers are cached too,
/// so a missing indicator does not hammer the provider.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        // Opportunistic sweep to keep the map from accumulating dead keys.
        if entries.len() > 4_096 {
            entries.retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
        }
        entries.insert(key, (Instant::now(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
