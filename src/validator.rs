//! Structural validation run on every parser before registration.

use crate::parser::{LogParser, CATEGORIES};

/// The verdict on a parser object: hard errors block registration,
/// warnings are logged and allowed through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Check a parser's descriptor for structural problems.
///
/// The three operations themselves are guaranteed callable by the trait;
/// what can go wrong at runtime is the metadata the registry indexes on.
/// Id uniqueness is the registry's responsibility; this only flags ids that
/// could never be valid.
pub fn validate_parser(parser: &dyn LogParser) -> ValidationReport {
    let descriptor = parser.descriptor();
    let mut report = ValidationReport::default();

    if descriptor.id.is_empty() {
        report.error("parser id must not be empty");
    } else if !descriptor
        .id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        report.error(format!(
            "parser id `{}` must be lowercase alphanumeric with `-` or `_`",
            descriptor.id
        ));
    }

    if descriptor.name.is_empty() {
        report.error("parser name must not be empty");
    }
    if descriptor.log_source.is_empty() {
        report.error("parser log_source must not be empty");
    }

    if !CATEGORIES.contains(&descriptor.category.as_str()) {
        report.error(format!(
            "parser category `{}` is not in the closed vocabulary",
            descriptor.category
        ));
    }

    if descriptor.vendor.is_empty() {
        report.warning("parser vendor is empty");
    }
    if descriptor.version.is_empty() {
        report.warning("parser version is empty");
    }
    if !(0..=100).contains(&descriptor.priority) {
        report.warning(format!(
            "parser priority {} is outside the conventional 0..=100 range",
            descriptor.priority
        ));
    }

    report.valid = report.errors.is_empty();
    report
}
