//! Built-in reference parsers. The vendor parser fleet lives outside this
//! crate; these two exist so the pipeline has first-party implementations
//! of the contract to dispatch to (and to test against).

mod cloudtrail;
mod syslog;

use std::sync::Arc;

pub use cloudtrail::CloudTrailParser;
pub use syslog::SyslogParser;

use crate::parser::LogParser;

/// The parsers shipped with the core.
pub fn builtin_parsers() -> Vec<Arc<dyn LogParser>> {
    vec![
        Arc::new(SyslogParser::new()),
        Arc::new(CloudTrailParser::new()),
    ]
}
