//! Rule-driven enrichment for normalized events: field addition, lookup
//! tables, geolocation, threat intelligence and risk scoring.
//!
//! Enrichment never fails the pipeline. Individual rule errors are logged
//! and swallowed; the event continues downstream with whatever enrichment
//! succeeded.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

mod engine;
pub mod providers;
pub mod risk;
pub mod tables;

pub use engine::{default_rules, EnrichmentConfig, EnrichmentEngine};
pub use tables::{LookupTable, TableRegistry};

use serde::{Deserialize, Serialize};

use securewatch_event::Value;

/// Operator applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Matches,
    Exists,
    In,
    Range,
}

/// A predicate over one dotted field of the normalized event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Option<Value>,
    /// Operand list for `In` and the `[min, max]` pair for `Range`.
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl Condition {
    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: ConditionOperator::Exists,
            value: None,
            values: Vec::new(),
            case_sensitive: false,
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: ConditionOperator::Equals,
            value: Some(value.into()),
            values: Vec::new(),
            case_sensitive: false,
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: ConditionOperator::Contains,
            value: Some(value.into()),
            values: Vec::new(),
            case_sensitive: false,
        }
    }
}

/// What an [`Action`] does to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AddField,
    SetField,
    AddTag,
    Lookup,
    Geoip,
    ThreatIntel,
    Calculate,
}

/// One enrichment step applied when a rule's conditions all match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Target or key-source field, depending on the kind.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    /// Named lookup table (for `Lookup`).
    #[serde(default)]
    pub source: Option<String>,
    /// Named formula (for `Calculate`).
    #[serde(default)]
    pub formula: Option<String>,
}

impl Action {
    pub fn add_field(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            kind: ActionKind::AddField,
            field: Some(field.into()),
            value: Some(value.into()),
            source: None,
            formula: None,
        }
    }

    pub fn set_field(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            kind: ActionKind::SetField,
            field: Some(field.into()),
            value: Some(value.into()),
            source: None,
            formula: None,
        }
    }

    pub fn add_tag(tag: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::AddTag,
            field: None,
            value: Some(tag.into().into()),
            source: None,
            formula: None,
        }
    }

    pub fn lookup(table: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Lookup,
            field: Some(key_field.into()),
            value: None,
            source: Some(table.into()),
            formula: None,
        }
    }

    pub fn geoip(field: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Geoip,
            field: Some(field.into()),
            value: None,
            source: None,
            formula: None,
        }
    }

    pub fn threat_intel(field: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::ThreatIntel,
            field: Some(field.into()),
            value: None,
            source: None,
            formula: None,
        }
    }

    pub fn calculate(formula: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Calculate,
            field: Some(target.into()),
            value: None,
            source: None,
            formula: Some(formula.into()),
        }
    }
}

/// An enrichment rule: conditions ANDed together, actions applied in order.
/// Rules are evaluated highest-priority-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}
