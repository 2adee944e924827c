//! Test reports, baseline snapshots and their classification result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The JSON test report a test command (or the agent) writes.
///
/// Test ids are `path::name`; the path part identifies the test file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: Vec<String>,
    /// Every test id that ran, when the reporter lists them.
    #[serde(default)]
    pub tests: Vec<String>,
}

/// Test state captured before the first phase runs. Read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub failing: BTreeSet<String>,
    pub total: u32,
    pub passed: u32,
    /// Test files that existed at capture time.
    #[serde(default)]
    pub test_files: BTreeSet<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEvaluation {
    pub pass: bool,
    pub regressions: Vec<String>,
    pub new_test_failures: Vec<String>,
    pub pre_existing_ignored: Vec<String>,
}

/// File part of a `path::name` test id.
pub fn test_file_of(test_id: &str) -> &str {
    match test_id.find("::") {
        Some(idx) => &test_id[..idx],
        None => test_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_of_splits_on_first_separator() {
        assert_eq!(test_file_of("tests/api.rs::mod::works"), "tests/api.rs");
        assert_eq!(test_file_of("standalone"), "standalone");
    }

    #[test]
    fn test_report_tolerates_missing_fields() {
        let report: TestReport = serde_json::from_str(r#"{"failed": ["a::b"]}"#).unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.failed, vec!["a::b"]);
        assert!(report.tests.is_empty());
    }
}
