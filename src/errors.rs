//! Typed error hierarchy for forgeline.
//!
//! Agent failures are data (see `forgeline_common::ExecutionError`), not
//! errors. The enums here cover what actually aborts work:
//! - `ProjectError`: the project file cannot be loaded or is inconsistent
//! - `StatusError`: the status record cannot be read or written
//! - `JobError`: job control requests that cannot be honoured

use std::path::PathBuf;
use thiserror::Error;

use forgeline_common::JobStatus;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("No project file found in {dir} (expected project.yaml, project.yml or project.json)")]
    NotFound { dir: PathBuf },

    #[error("Failed to read project file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Project defines no phases")]
    Empty,

    #[error("Phase id '{id}' is defined more than once")]
    DuplicatePhase { id: String },

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Dependency cycle between phases: {}", phases.join(", "))]
    Cycle { phases: Vec<String> },
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Failed to read status file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write status file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Status file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No previous run found at {path}")]
    NoPreviousRun { path: PathBuf },

    #[error("Failed to serialize status: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },

    #[error("Project directory {path} does not exist")]
    InvalidProject { path: PathBuf },

    #[error("Project {path} already has an active job {job}")]
    ProjectBusy { path: PathBuf, job: String },

    #[error("Phase {phase} of job {id} is not awaiting a decision")]
    NotAwaitingDecision { id: String, phase: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
