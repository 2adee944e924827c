//! Output verification for a finished agent attempt.
//!
//! Two layers run in order. The deterministic layer locates every expected
//! output and parse-checks the recognized formats; any miss is a hard fail
//! and the judge is never called. The judge layer (per-phase opt-in) asks an
//! independent agent whether the output meets the acceptance criteria, and
//! writes its defects to the phase feedback file on failure.
//!
//! The verifier does not retry. One call, one [`VerificationResult`].

pub mod judge;
pub mod syntax;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use forgeline_common::{PhaseDefinition, VerificationResult, WorkingConfig};

pub use judge::{AgentJudge, Judge, JudgeRequest, JudgeVerdict};

use crate::feedback;

pub struct Verifier {
    project_dir: PathBuf,
    search_dirs: Vec<String>,
    judge: Option<Arc<dyn Judge>>,
}

impl Verifier {
    pub fn new(project_dir: &Path, search_dirs: &[String]) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            search_dirs: search_dirs.to_vec(),
            judge: None,
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Directories searched for expected outputs, in priority order.
    pub fn candidate_dirs(&self, phase_dir: &Path) -> Vec<PathBuf> {
        let mut dirs = vec![phase_dir.join("output")];
        for dir in &self.search_dirs {
            let candidate = if dir == "." {
                self.project_dir.clone()
            } else {
                self.project_dir.join(dir)
            };
            if !dirs.contains(&candidate) {
                dirs.push(candidate);
            }
        }
        dirs
    }

    /// Resolve one expected-output entry (a path or a glob). The first
    /// candidate directory with any match wins.
    pub fn locate(&self, pattern: &str, phase_dir: &Path) -> Vec<PathBuf> {
        for dir in self.candidate_dirs(phase_dir) {
            let found = find_in(&dir, pattern);
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    pub async fn verify(
        &self,
        phase: &PhaseDefinition,
        phase_dir: &Path,
        working: &WorkingConfig,
        cancel: CancellationToken,
    ) -> VerificationResult {
        let mut result = VerificationResult::default();
        let mut found: BTreeSet<PathBuf> = BTreeSet::new();

        for pattern in &phase.expected_outputs {
            let matches = self.locate(pattern, phase_dir);
            if matches.is_empty() {
                result.missing_files.push(pattern.clone());
            }
            found.extend(matches);
        }

        for path in &found {
            if let Err(message) = syntax::check_file(path) {
                result.syntax_errors.insert(self.display(path), message);
            }
        }
        result.found_files = found.into_iter().collect();

        if !result.missing_files.is_empty() || !result.syntax_errors.is_empty() {
            tracing::info!(
                phase = %phase.id,
                missing = result.missing_files.len(),
                syntax_errors = result.syntax_errors.len(),
                "Deterministic verification failed"
            );
            return result;
        }

        if !phase.judge_enabled() {
            result.success = true;
            return result;
        }
        let Some(judge) = &self.judge else {
            tracing::warn!(phase = %phase.id, "Judge enabled for phase but no judge configured; skipping");
            result.success = true;
            return result;
        };

        let request = JudgeRequest {
            phase_id: phase.id.clone(),
            acceptance_criteria: working.acceptance_criteria.clone(),
            files: result.found_files.clone(),
            working_dir: self.project_dir.clone(),
            model: phase.judge.as_ref().and_then(|j| j.model.clone()),
        };
        result.judge_invoked = true;

        match judge.judge(request, cancel).await {
            Ok(verdict) => {
                result.success = verdict.pass;
                result.judgment = Some(verdict.summary());
                result.confidence = Some(verdict.confidence);
                if !verdict.pass {
                    tracing::info!(phase = %phase.id, defects = verdict.defects.len(), "Judge rejected output");
                    if let Err(e) = feedback::append(phase_dir, "Judge review", &verdict.feedback()) {
                        tracing::warn!(error = %e, "Failed to write judge feedback");
                    }
                }
            }
            Err(e) => {
                // Judge outages must not block the pipeline.
                tracing::warn!(phase = %phase.id, error = %format!("{:#}", e), "Judge unavailable; accepting deterministic result");
                result.success = true;
                result.judgment = Some(format!("judge unavailable: {:#}", e));
            }
        }

        result
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.project_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn find_in(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    if !is_glob(pattern) {
        let path = dir.join(pattern);
        return if path.is_file() { vec![path] } else { Vec::new() };
    }

    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    match glob::glob(&full) {
        Ok(paths) => paths.flatten().filter(|p| p.is_file()).collect(),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Invalid expected-output pattern");
            Vec::new()
        }
    }
}
