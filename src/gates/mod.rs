//! Quality gates.
//!
//! A gate is a declarative pass/fail predicate attached to a phase. Each
//! [`GateSpec`] variant has one evaluator function here; evaluation reads
//! the phase directory and the project tree and nothing else. Compound
//! gates stop at the first failing member and report only that failure.

use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use forgeline_common::{BaselineSnapshot, GateResult, GateSpec};

use crate::baseline;
use crate::verify::syntax;

pub struct QualityGateEngine {
    project_dir: PathBuf,
    baseline: Option<BaselineSnapshot>,
}

/// Contents of an approval artifact written by an external reviewer.
#[derive(Debug, Deserialize)]
struct Approval {
    approved: bool,
    #[serde(default)]
    reviewer: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl QualityGateEngine {
    pub fn new(project_dir: &Path, baseline: Option<BaselineSnapshot>) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            baseline,
        }
    }

    pub fn baseline(&self) -> Option<&BaselineSnapshot> {
        self.baseline.as_ref()
    }

    /// Evaluate a phase's gate for the attempt that started at
    /// `attempt_started`. Test reports older than that are rejected. A phase
    /// without a gate passes.
    pub fn evaluate_phase(
        &self,
        gate: Option<&GateSpec>,
        phase_dir: &Path,
        attempt_started: Option<SystemTime>,
    ) -> GateResult {
        match gate {
            Some(spec) => self.evaluate_since(spec, phase_dir, attempt_started),
            None => GateResult::pass("no gate configured"),
        }
    }

    pub fn evaluate(&self, spec: &GateSpec, phase_dir: &Path) -> GateResult {
        self.evaluate_since(spec, phase_dir, None)
    }

    fn evaluate_since(&self, spec: &GateSpec, phase_dir: &Path, since: Option<SystemTime>) -> GateResult {
        let result = match spec {
            GateSpec::FilesExist { files } => self.files_exist(files, phase_dir),
            GateSpec::SyntaxValid { files } => self.syntax_valid(files, phase_dir),
            GateSpec::TestsPass { report } => self.tests_pass(report, phase_dir, since),
            GateSpec::ExternalApproval { artifact } => self.external_approval(artifact, phase_dir),
            GateSpec::Compound { name, gates } => self.compound(name, gates, phase_dir, since),
        };
        tracing::debug!(gate = spec.kind(), passed = result.passed, message = %result.message, "Gate evaluated");
        result
    }

    /// Resolve a gate path (file or glob): phase directory first, then the
    /// project root.
    fn resolve(&self, pattern: &str, phase_dir: &Path) -> Vec<PathBuf> {
        for dir in [phase_dir, self.project_dir.as_path()] {
            let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
            let found: Vec<PathBuf> = match glob::glob(&full) {
                Ok(paths) => paths.flatten().filter(|p| p.is_file()).collect(),
                Err(_) => Vec::new(),
            };
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    fn files_exist(&self, files: &[String], phase_dir: &Path) -> GateResult {
        let missing: Vec<&String> = files
            .iter()
            .filter(|f| self.resolve(f, phase_dir).is_empty())
            .collect();
        if missing.is_empty() {
            GateResult::pass(format!("all {} required files present", files.len()))
        } else {
            GateResult::fail(
                format!(
                    "missing files: {}",
                    missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ),
                json!({ "missing_files": missing }),
            )
        }
    }

    fn syntax_valid(&self, files: &[String], phase_dir: &Path) -> GateResult {
        let targets: Vec<PathBuf> = if files.is_empty() {
            walkdir::WalkDir::new(phase_dir.join("output"))
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect()
        } else {
            files.iter().flat_map(|f| self.resolve(f, phase_dir)).collect()
        };

        let mut errors = serde_json::Map::new();
        for path in targets.iter().filter(|p| syntax::is_checkable(p)) {
            if let Err(message) = syntax::check_file(path) {
                let name = path
                    .strip_prefix(&self.project_dir)
                    .unwrap_or(path)
                    .display()
                    .to_string();
                errors.insert(name, json!(message));
            }
        }

        if errors.is_empty() {
            GateResult::pass(format!("{} files parse cleanly", targets.len()))
        } else {
            let first = errors
                .iter()
                .next()
                .map(|(file, msg)| format!("{}: {}", file, msg.as_str().unwrap_or_default()))
                .unwrap_or_default();
            GateResult::fail(
                format!("syntax errors in {} files ({})", errors.len(), first),
                json!({ "syntax_errors": errors }),
            )
        }
    }

    fn tests_pass(&self, report: &str, phase_dir: &Path, since: Option<SystemTime>) -> GateResult {
        let candidates = [phase_dir.join(report), self.project_dir.join(report)];
        let Some(path) = candidates.iter().find(|p| p.is_file()) else {
            return GateResult::fail(
                format!("test report {} not found", report),
                json!({ "report": report }),
            );
        };
        if let Some(since) = since {
            let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            if modified.is_none_or(|m| m < since) {
                return GateResult::fail(
                    format!("test report {} is stale; tests were not run during this attempt", report),
                    json!({ "report": path, "stale": true }),
                );
            }
        }
        let report = match baseline::read_report(path) {
            Ok(report) => report,
            Err(e) => {
                return GateResult::fail(
                    format!("unreadable test report: {:#}", e),
                    json!({ "report": path }),
                );
            }
        };

        match &self.baseline {
            Some(snapshot) => {
                let eval = baseline::evaluate(&report.failed, snapshot);
                let details = serde_json::to_value(&eval).unwrap_or_default();
                if eval.pass {
                    GateResult {
                        passed: true,
                        message: format!(
                            "no new failures ({} pre-existing ignored)",
                            eval.pre_existing_ignored.len()
                        ),
                        details,
                    }
                } else {
                    GateResult::fail(
                        format!(
                            "{} regressions, {} new test failures",
                            eval.regressions.len(),
                            eval.new_test_failures.len()
                        ),
                        details,
                    )
                }
            }
            None if report.failed.is_empty() => {
                GateResult::pass(format!("{}/{} tests passed", report.passed, report.total))
            }
            None => GateResult::fail(
                format!("{} tests failed", report.failed.len()),
                json!({ "failing_tests": report.failed }),
            ),
        }
    }

    fn external_approval(&self, artifact: &str, phase_dir: &Path) -> GateResult {
        let candidates = [phase_dir.join(artifact), self.project_dir.join(artifact)];
        let Some(path) = candidates.iter().find(|p| p.is_file()) else {
            return GateResult::fail(
                format!("approval artifact {} not found", artifact),
                json!({ "artifact": artifact }),
            );
        };

        let parsed: Result<Approval, String> = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| match path.extension().and_then(|e| e.to_str()) {
                Some("json") => serde_json::from_str(&content).map_err(|e| e.to_string()),
                _ => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
            });

        match parsed {
            Ok(approval) if approval.approved => GateResult {
                passed: true,
                message: match &approval.reviewer {
                    Some(reviewer) => format!("approved by {}", reviewer),
                    None => "approved".to_string(),
                },
                details: json!({ "reviewer": approval.reviewer }),
            },
            Ok(approval) => GateResult::fail(
                format!(
                    "rejected: {}",
                    approval.reason.as_deref().unwrap_or("no reason given")
                ),
                json!({ "reviewer": approval.reviewer, "reason": approval.reason }),
            ),
            Err(e) => GateResult::fail(
                format!("invalid approval artifact: {}", e),
                json!({ "artifact": path }),
            ),
        }
    }

    fn compound(&self, name: &str, gates: &[GateSpec], phase_dir: &Path, since: Option<SystemTime>) -> GateResult {
        for (idx, gate) in gates.iter().enumerate() {
            let result = self.evaluate_since(gate, phase_dir, since);
            if !result.passed {
                let label = if name.is_empty() { "compound" } else { name };
                return GateResult::fail(
                    format!("[{}] {}", label, result.message),
                    json!({ "gate": gate.kind(), "index": idx, "details": result.details }),
                );
            }
        }
        GateResult::pass(format!("{} gates passed", gates.len()))
    }
}
