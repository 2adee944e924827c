//! The agent executor seam.
//!
//! An executor runs one unit of agent work in a directory and reports
//! whether it succeeded, what it printed and how long it took. The engine
//! never looks inside the work itself; [`classify`] is the only place that
//! reads agent output, and only to decide whether a failure is worth an
//! immediate retry.

pub mod classify;
pub mod command;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use classify::{FailureClass, classify_error, classify_output};
pub use command::CommandExecutor;

/// What the executor is asked to do.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub phase_id: String,
    pub attempt: u32,
    pub working_dir: PathBuf,
    /// Full instruction text, written to the agent's stdin.
    pub instructions: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub elapsed: Duration,
    pub exit_code: Option<i32>,
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            elapsed,
            exit_code: Some(0),
        }
    }

    pub fn failure(output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: output.into(),
            elapsed,
            exit_code: None,
        }
    }
}

/// Abstraction over agent invocation for testability.
/// Real implementation: [`CommandExecutor`]. Tests substitute scripted fakes.
///
/// `Err` means the invocation itself could not happen (spawn or I/O
/// failure); an agent that ran and failed is `Ok` with `success = false`.
/// Implementations must stop the agent promptly once `cancel` fires.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome>;
}
