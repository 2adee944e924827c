//! Agent executor backed by an external CLI process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AgentExecutor, ExecutionOutcome, ExecutionRequest};

/// Runs the configured agent command once per request.
///
/// The instruction text goes to stdin, stdout is collected line by line,
/// and stderr is appended to the output when the process fails. The child
/// is killed on cancellation and when the future is dropped (timeouts).
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
        }
    }

    pub fn from_config(agent: &crate::config::AgentSection) -> Self {
        Self::new(&agent.command, &agent.args)
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(model) = &request.model {
            cmd.args(["--model", model]);
        }
        cmd.current_dir(&request.working_dir)
            .env("FORGELINE_PHASE", &request.phase_id)
            .env("FORGELINE_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        tracing::debug!(
            phase = %request.phase_id,
            attempt = request.attempt,
            command = %self.command,
            model = request.model.as_deref().unwrap_or("default"),
            "Spawning agent"
        );

        let mut child = self
            .build_command(&request)
            .spawn()
            .with_context(|| format!("Failed to spawn agent process '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // An agent that exits without reading stdin closes the pipe; that
            // is its business, not an invocation failure.
            if let Err(e) = stdin.write_all(request.instructions.as_bytes()).await {
                tracing::debug!(error = %e, "Agent closed stdin early");
            }
            drop(stdin);
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut output = String::new();
        let mut cancelled = false;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            tracing::trace!(phase = %request.phase_id, "{}", line);
                            output.push_str(&line);
                            output.push('\n');
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed reading agent stdout");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        if cancelled {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill cancelled agent process");
            }
            return Ok(ExecutionOutcome::failure(output, start.elapsed()));
        }

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for agent process")?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(ExecutionOutcome::failure(output, start.elapsed()));
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let elapsed = start.elapsed();
        tracing::debug!(
            phase = %request.phase_id,
            exit_code = status.code().unwrap_or(-1),
            elapsed_ms = elapsed.as_millis() as u64,
            "Agent finished"
        );

        if status.success() {
            Ok(ExecutionOutcome {
                success: true,
                output,
                elapsed,
                exit_code: status.code(),
            })
        } else {
            if !stderr.trim().is_empty() {
                output.push_str(stderr.trim());
                output.push('\n');
            }
            Ok(ExecutionOutcome {
                success: false,
                output,
                elapsed,
                exit_code: status.code(),
            })
        }
    }
}
