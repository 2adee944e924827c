//! Shared domain types for forgeline.
//!
//! Everything here is plain serializable data: phase definitions as they are
//! read from the project file, per-attempt results, escalation state, baseline
//! snapshots, the on-disk status record and the job event stream. The engine
//! lives in the `forgeline` crate; external tools only need this one to read
//! `.forgeline/status.json` or consume `/api/jobs/{id}/events`.

pub mod baseline;
pub mod escalation;
pub mod job;
pub mod phase;
pub mod result;
pub mod status;

pub use baseline::{BaselineEvaluation, BaselineSnapshot, TestReport, test_file_of};
pub use escalation::{
    ConfigChange, EscalationState, HumanDecision, HumanOption, HumanRequest, RecoveryAction,
    Tier,
};
pub use job::{JobEvent, JobRecord, JobStatus, PipelineEvent};
pub use phase::{AgentConfig, GateSpec, JudgeConfig, PhaseDefinition, PolicyOverrides, WorkingConfig};
pub use result::{
    AttemptRecord, ErrorKind, ExecutionError, GateResult, PhaseResult, VerificationResult,
};
pub use status::{PhaseState, PhaseStatusRecord, RunState, RunStatus};

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
