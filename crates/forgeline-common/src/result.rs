//! Per-attempt results: execution, verification and gate outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::escalation::Tier;

/// How an agent invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, connection resets, rate limiting. Retried with backoff.
    Transient,
    /// Syntax or name-resolution failures. Never retried at the execution level.
    Permanent,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Outcome of one attempt of a phase. Appended to the attempt history and
/// never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    pub attempt: u32,
    pub success: bool,
    pub output: String,
    #[serde(with = "crate::duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Transient-error retries absorbed inside this attempt.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    #[serde(default)]
    pub missing_files: Vec<String>,
    /// File path to parse error.
    #[serde(default)]
    pub syntax_errors: BTreeMap<String, String>,
    #[serde(default)]
    pub found_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub judge_invoked: bool,
}

impl VerificationResult {
    /// One-line description of why verification failed.
    pub fn failure_summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing_files.is_empty() {
            parts.push(format!("missing outputs: {}", self.missing_files.join(", ")));
        }
        for (file, message) in &self.syntax_errors {
            parts.push(format!("{}: {}", file, message));
        }
        if parts.is_empty()
            && let Some(judgment) = &self.judgment
        {
            parts.push(format!("judge: {}", judgment));
        }
        if parts.is_empty() {
            "verification failed".to_string()
        } else {
            parts.join("; ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl GateResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn fail(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details,
        }
    }
}

/// One persisted attempt: what ran, what verification said, what the gate said.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub result: PhaseResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    pub gate: GateResult,
    pub tier: Tier,
    pub recorded_at: DateTime<Utc>,
}
