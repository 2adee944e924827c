//! Job records and the ordered event stream a job emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::escalation::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Persisted job status, readable without replaying the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub project: PathBuf,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    /// Sequence number of the last event written.
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: &str, project: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            project,
            status: JobStatus::Pending,
            current_phase: None,
            last_seq: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Something that happened during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobStarted {
        project: PathBuf,
    },
    PhaseStart {
        phase_id: String,
    },
    VerificationFailed {
        phase_id: String,
        attempt: u32,
        message: String,
    },
    GateFailed {
        phase_id: String,
        attempt: u32,
        tier: Tier,
        message: String,
    },
    Escalated {
        phase_id: String,
        from: Tier,
        to: Tier,
    },
    HumanRequired {
        phase_id: String,
        request: PathBuf,
    },
    PhaseComplete {
        phase_id: String,
        attempts: u32,
    },
    PhaseFailed {
        phase_id: String,
        reason: String,
    },
    PhasesAdded {
        phase_ids: Vec<String>,
    },
    PhaseReverted {
        from: String,
        to: String,
    },
    ProjectComplete {
        phases: usize,
    },
    Heartbeat {
        #[serde(default)]
        phase_id: Option<String>,
        elapsed_secs: u64,
    },
    JobFailed {
        error: String,
    },
    JobCancelled,
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::JobStarted { .. } => "job_started",
            PipelineEvent::PhaseStart { .. } => "phase_start",
            PipelineEvent::VerificationFailed { .. } => "verification_failed",
            PipelineEvent::GateFailed { .. } => "gate_failed",
            PipelineEvent::Escalated { .. } => "escalated",
            PipelineEvent::HumanRequired { .. } => "human_required",
            PipelineEvent::PhaseComplete { .. } => "phase_complete",
            PipelineEvent::PhaseFailed { .. } => "phase_failed",
            PipelineEvent::PhasesAdded { .. } => "phases_added",
            PipelineEvent::PhaseReverted { .. } => "phase_reverted",
            PipelineEvent::ProjectComplete { .. } => "project_complete",
            PipelineEvent::Heartbeat { .. } => "heartbeat",
            PipelineEvent::JobFailed { .. } => "job_failed",
            PipelineEvent::JobCancelled => "job_cancelled",
        }
    }

    /// The last event a job ever emits is one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::ProjectComplete { .. }
                | PipelineEvent::JobFailed { .. }
                | PipelineEvent::JobCancelled
        )
    }
}

/// A [`PipelineEvent`] stamped with its 1-based position in the job log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_event_flattens_type_tag() {
        let event = JobEvent {
            seq: 3,
            timestamp: Utc::now(),
            event: PipelineEvent::PhaseStart {
                phase_id: "design".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["type"], "phase_start");
        assert_eq!(json["phase_id"], "design");

        let back: JobEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event, event.event);
    }

    #[test]
    fn test_event_names_match_serde_tags() {
        let events = vec![
            PipelineEvent::GateFailed {
                phase_id: "p".to_string(),
                attempt: 1,
                tier: Tier::Retry,
                message: "m".to_string(),
            },
            PipelineEvent::Heartbeat {
                phase_id: None,
                elapsed_secs: 15,
            },
            PipelineEvent::JobCancelled,
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.name());
        }
    }

    #[test]
    fn test_terminal_events() {
        assert!(PipelineEvent::JobCancelled.is_terminal());
        assert!(PipelineEvent::ProjectComplete { phases: 2 }.is_terminal());
        assert!(
            !PipelineEvent::PhaseStart {
                phase_id: "p".to_string()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
