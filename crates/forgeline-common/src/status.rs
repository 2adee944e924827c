//! The pipeline status record mirrored to `.forgeline/status.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::escalation::EscalationState;
use crate::phase::WorkingConfig;
use crate::result::AttemptRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingHuman,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
            RunState::AwaitingHuman => "awaiting_human",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    AwaitingHuman,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseState::Pending => "pending",
            PhaseState::Running => "running",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
            PhaseState::AwaitingHuman => "awaiting_human",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStatusRecord {
    pub id: String,
    pub status: PhaseState,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub escalation: EscalationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working: Option<WorkingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseStatusRecord {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: PhaseState::Pending,
            attempts: Vec::new(),
            escalation: EscalationState::default(),
            working: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Back to pending, dropping attempt history and escalation state.
    pub fn reset(&mut self) {
        *self = Self::new(&self.id);
    }
}

/// One record per pipeline run. `version` increases on every rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub project_hash: String,
    pub status: RunState,
    pub version: u64,
    #[serde(default)]
    pub phases: Vec<PhaseStatusRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub reverts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn new(project_hash: &str, phase_ids: &[String]) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            project_hash: project_hash.to_string(),
            status: RunState::Running,
            version: 0,
            phases: phase_ids.iter().map(|id| PhaseStatusRecord::new(id)).collect(),
            current_phase: None,
            reverts: 0,
            error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseStatusRecord> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Record for `id`, appended as pending if the phase is new to this run.
    pub fn phase_mut(&mut self, id: &str) -> &mut PhaseStatusRecord {
        let idx = match self.phases.iter().position(|p| p.id == id) {
            Some(idx) => idx,
            None => {
                self.phases.push(PhaseStatusRecord::new(id));
                self.phases.len() - 1
            }
        };
        &mut self.phases[idx]
    }

    pub fn completed_phases(&self) -> Vec<String> {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseState::Completed)
            .map(|p| p.id.clone())
            .collect()
    }
}
