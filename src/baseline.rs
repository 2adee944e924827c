//! Baseline-aware test judging.
//!
//! A snapshot of failing tests and existing test files is captured once per
//! run before any phase executes. Later failures are classified against it:
//! failures already in the snapshot are ignored; anything else blocks, as a
//! regression (the test file existed before) or a new-test failure (the
//! pipeline created the file).

use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

use forgeline_common::{BaselineEvaluation, BaselineSnapshot, TestReport, test_file_of};

use crate::config::BaselineSection;
use crate::util::write_atomic;

const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".forgeline"];

/// Classify `current_failures` against `baseline`. Output lists are sorted
/// and de-duplicated, so the result depends only on the inputs.
pub fn evaluate(current_failures: &[String], baseline: &BaselineSnapshot) -> BaselineEvaluation {
    let failures: BTreeSet<&str> = current_failures.iter().map(String::as_str).collect();
    let mut eval = BaselineEvaluation::default();

    for test in failures {
        if baseline.failing.contains(test) {
            eval.pre_existing_ignored.push(test.to_string());
        } else if baseline.test_files.contains(test_file_of(test)) {
            eval.regressions.push(test.to_string());
        } else {
            eval.new_test_failures.push(test.to_string());
        }
    }

    eval.pass = eval.regressions.is_empty() && eval.new_test_failures.is_empty();
    eval
}

pub fn read_report(path: &Path) -> Result<TestReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read test report: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test report: {}", path.display()))
}

/// Run the configured test command through `sh -c` in the project root.
/// A non-zero exit is expected when tests fail and is not an error; only a
/// spawn failure or timeout is.
pub async fn run_test_command(project_dir: &Path, command: &str, timeout: Duration) -> Result<()> {
    tracing::info!(command, "Running test command");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(project_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn test command: {}", command))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.context("Failed to wait for test command")?,
        Err(_) => bail!("Test command timed out after {}s", timeout.as_secs()),
    };
    if !output.status.success() {
        tracing::debug!(
            exit_code = output.status.code().unwrap_or(-1),
            stderr = %crate::util::tail(&String::from_utf8_lossy(&output.stderr), 500),
            "Test command exited non-zero"
        );
    }
    Ok(())
}

/// Project-relative test files matching `patterns`.
pub fn scan_test_files(project_dir: &Path, patterns: &[String]) -> BTreeSet<String> {
    let compiled: Vec<glob::Pattern> = patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    WalkDir::new(project_dir)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(project_dir).ok()?;
            let rel = rel.to_string_lossy().replace('\\', "/");
            compiled.iter().any(|p| p.matches(&rel)).then_some(rel)
        })
        .collect()
}

/// Capture the baseline for a run. Returns `None` when capture is disabled
/// or no report can be produced.
pub async fn capture(project_dir: &Path, config: &BaselineSection) -> Result<Option<BaselineSnapshot>> {
    if !config.enabled {
        return Ok(None);
    }

    if let Some(command) = &config.command {
        run_test_command(
            project_dir,
            command,
            Duration::from_secs(config.command_timeout_secs),
        )
        .await?;
    }

    let report_path = project_dir.join(&config.report);
    if !report_path.exists() {
        tracing::info!(report = %report_path.display(), "No test report found; baseline not captured");
        return Ok(None);
    }
    let report = read_report(&report_path)?;

    let mut test_files = scan_test_files(project_dir, &config.test_patterns);
    for test in report.tests.iter().chain(report.failed.iter()) {
        test_files.insert(test_file_of(test).to_string());
    }

    let snapshot = BaselineSnapshot {
        failing: report.failed.iter().cloned().collect(),
        total: report.total,
        passed: report.passed,
        test_files,
        captured_at: Utc::now(),
    };
    tracing::info!(
        total = snapshot.total,
        failing = snapshot.failing.len(),
        test_files = snapshot.test_files.len(),
        "Baseline captured"
    );
    Ok(Some(snapshot))
}

pub fn save(path: &Path, snapshot: &BaselineSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize baseline")?;
    write_atomic(path, &json).with_context(|| format!("Failed to write baseline: {}", path.display()))
}

pub fn load(path: &Path) -> Result<Option<BaselineSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read baseline: {}", path.display()))?;
    let snapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse baseline: {}", path.display()))?;
    Ok(Some(snapshot))
}
