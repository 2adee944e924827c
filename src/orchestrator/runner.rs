//! Drives one phase to a terminal outcome.
//!
//! Each attempt runs the agent (with its own transient-retry loop), then the
//! verifier, then the phase gate. Failed attempts go to the escalation
//! controller, whose decision picks the next step. Agent failures never
//! escape as errors: they become a failed gate result like any other. Only
//! status-store and artifact I/O failures propagate.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio_util::sync::CancellationToken;

use forgeline_common::{
    AttemptRecord, GateResult, HumanRequest, PhaseDefinition, PhaseResult, PhaseState,
    PipelineEvent, Tier, VerificationResult, WorkingConfig,
};

use super::events::EventSink;
use super::state::StatusStore;
use crate::baseline;
use crate::config::{ForgelineToml, PhasePolicy, ProjectPaths};
use crate::escalation::advisor::RecoveryAdvisor;
use crate::escalation::human::{GateWait, HumanGate};
use crate::escalation::{EscalationController, EscalationDecision, FailureContext};
use crate::executor::{
    AgentExecutor, ExecutionRequest, FailureClass, classify_error, classify_output,
};
use crate::executor::classify::to_execution_error;
use crate::feedback;
use crate::gates::QualityGateEngine;
use crate::project::resolve_instructions;
use crate::util::{tail, write_atomic};
use crate::verify::Verifier;

/// How a phase ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Passed(PhaseResult),
    Failed { reason: String },
    /// Re-run the pipeline from an earlier phase.
    Revert { to_phase: String },
    /// Halted at the human tier without a decision.
    AwaitingHuman,
    Cancelled,
}

/// Per-phase inputs from the orchestrator.
pub struct RunContext<'a> {
    pub status: &'a mut StatusStore,
    /// Completed phases before this one, oldest first.
    pub previous_phases: Vec<String>,
    pub reverts_remaining: u32,
    pub cancel: CancellationToken,
}

enum Execution {
    Finished(PhaseResult),
    Cancelled,
}

enum Step {
    Continue,
    Return(PhaseOutcome),
}

/// Mutable state of one phase run.
struct Attempts {
    working: WorkingConfig,
    history: Vec<AttemptRecord>,
    last_result: Option<PhaseResult>,
}

pub struct PhaseRunner {
    config: Arc<ForgelineToml>,
    paths: ProjectPaths,
    executor: Arc<dyn AgentExecutor>,
    verifier: Arc<Verifier>,
    gates: Arc<QualityGateEngine>,
    advisor: Arc<dyn RecoveryAdvisor>,
    human: Arc<dyn HumanGate>,
    sink: Arc<dyn EventSink>,
}

impl PhaseRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ForgelineToml>,
        paths: ProjectPaths,
        executor: Arc<dyn AgentExecutor>,
        verifier: Arc<Verifier>,
        gates: Arc<QualityGateEngine>,
        advisor: Arc<dyn RecoveryAdvisor>,
        human: Arc<dyn HumanGate>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            paths,
            executor,
            verifier,
            gates,
            advisor,
            human,
            sink,
        }
    }

    pub async fn run(&self, phase: &PhaseDefinition, mut ctx: RunContext<'_>) -> Result<PhaseOutcome> {
        let policy = self.config.phase_policy(phase);
        let phase_dir = self.paths.phase_dir(&phase.id);
        std::fs::create_dir_all(&phase_dir)
            .with_context(|| format!("Failed to create phase dir: {}", phase_dir.display()))?;

        let record = ctx.status.record().phase(&phase.id).cloned();
        let (escalation, working, history) = match record {
            Some(r) => (
                r.escalation,
                r.working.unwrap_or_else(|| phase.initial_working_config()),
                r.attempts,
            ),
            None => (Default::default(), phase.initial_working_config(), Vec::new()),
        };

        let mut controller = EscalationController::new(
            &phase.id,
            escalation,
            policy.max_retries,
            &self.paths.escalation_dir(&phase.id),
            self.advisor.clone(),
            self.config.escalation.fallback_models.clone(),
        );
        let mut state = Attempts {
            last_result: history.last().map(|a| a.result.clone()),
            working,
            history,
        };

        let mut pending = None;
        if controller.tier() == Tier::Human {
            tracing::info!(phase = %phase.id, "Resuming phase at the human tier");
            pending = Some(controller.pending_request(&FailureContext {
                attempts: &state.history,
                working: &state.working,
                previous_phases: &ctx.previous_phases,
                project_dir: &self.paths.project_dir,
            })?);
        }

        loop {
            if let Some(decision) = pending.take() {
                match self
                    .settle(decision, phase, &mut controller, &mut state, &mut ctx)
                    .await?
                {
                    Step::Continue => {}
                    Step::Return(outcome) => return Ok(outcome),
                }
            }

            if ctx.cancel.is_cancelled() {
                return Ok(PhaseOutcome::Cancelled);
            }

            let attempt = state.history.len() as u32 + 1;
            let attempt_started = SystemTime::now();
            let result = match self
                .execute(phase, &state.working, attempt, &policy, &phase_dir, &ctx.cancel)
                .await?
            {
                Execution::Finished(result) => result,
                Execution::Cancelled => return Ok(PhaseOutcome::Cancelled),
            };

            let (verification, gate) = self
                .check(phase, &phase_dir, &state.working, &result, attempt, attempt_started, &ctx.cancel)
                .await;
            if ctx.cancel.is_cancelled() {
                return Ok(PhaseOutcome::Cancelled);
            }

            let mut result = result;
            if let Some(v) = &verification {
                result.output_files = v.found_files.clone();
            }
            let record = AttemptRecord {
                result: result.clone(),
                verification,
                gate: gate.clone(),
                tier: controller.tier(),
                recorded_at: Utc::now(),
            };
            self.persist_attempt(&phase_dir, &record)?;
            state.history.push(record.clone());
            state.last_result = Some(result.clone());
            ctx.status.update(|s| s.phase_mut(&phase.id).attempts.push(record))?;

            if gate.passed {
                controller.record_success();
                if let Err(e) = feedback::clear(&phase_dir) {
                    tracing::warn!(error = %format!("{:#}", e), "Failed to clear feedback");
                }
                let working = state.working.clone();
                ctx.status.update(|s| {
                    let rec = s.phase_mut(&phase.id);
                    rec.escalation = Default::default();
                    rec.working = Some(working);
                })?;
                tracing::info!(phase = %phase.id, attempt, "Gate passed");
                return Ok(PhaseOutcome::Passed(result));
            }

            tracing::warn!(phase = %phase.id, attempt, tier = %controller.tier(), "Gate failed: {}", gate.message);
            self.sink.emit(PipelineEvent::GateFailed {
                phase_id: phase.id.clone(),
                attempt,
                tier: controller.tier(),
                message: gate.message.clone(),
            });
            let mut body = gate.message.clone();
            if !gate.details.is_null() {
                body.push_str(&format!(
                    "\n\nDetails:\n```json\n{}\n```",
                    serde_json::to_string_pretty(&gate.details).unwrap_or_default()
                ));
            }
            if let Err(e) = feedback::append(&phase_dir, &format!("Attempt {} failed", attempt), &body) {
                tracing::warn!(error = %format!("{:#}", e), "Failed to write feedback");
            }

            let before = controller.tier();
            let decision = controller
                .on_gate_failure(
                    FailureContext {
                        attempts: &state.history,
                        working: &state.working,
                        previous_phases: &ctx.previous_phases,
                        project_dir: &self.paths.project_dir,
                    },
                    ctx.cancel.clone(),
                )
                .await?;
            if controller.tier() != before {
                self.sink.emit(PipelineEvent::Escalated {
                    phase_id: phase.id.clone(),
                    from: before,
                    to: controller.tier(),
                });
            }
            self.save_escalation(phase, &controller, &state.working, ctx.status)?;
            pending = Some(decision);
        }
    }

    /// Act on an escalation decision. A human escalation waits here and then
    /// acts on whatever the human decided.
    async fn settle(
        &self,
        mut decision: EscalationDecision,
        phase: &PhaseDefinition,
        controller: &mut EscalationController,
        state: &mut Attempts,
        ctx: &mut RunContext<'_>,
    ) -> Result<Step> {
        loop {
            match decision {
                EscalationDecision::Retry { .. } => return Ok(Step::Continue),
                EscalationDecision::Reconfigure { config, changes } => {
                    for change in &changes {
                        tracing::info!(phase = %phase.id, "Reconfigured: {}", change);
                    }
                    state.working = config;
                    self.save_escalation(phase, controller, &state.working, ctx.status)?;
                    return Ok(Step::Continue);
                }
                EscalationDecision::Revert { to_phase } => {
                    if ctx.reverts_remaining > 0 {
                        return Ok(Step::Return(PhaseOutcome::Revert { to_phase }));
                    }
                    tracing::warn!(phase = %phase.id, target = %to_phase, "Revert budget exhausted; retrying instead");
                    return Ok(Step::Continue);
                }
                EscalationDecision::Abort { reason } => {
                    return Ok(Step::Return(PhaseOutcome::Failed { reason }));
                }
                EscalationDecision::Accept => {
                    tracing::info!(phase = %phase.id, "Output accepted by human decision");
                    controller.record_success();
                    let working = state.working.clone();
                    ctx.status.update(|s| {
                        let rec = s.phase_mut(&phase.id);
                        rec.escalation = Default::default();
                        rec.working = Some(working);
                    })?;
                    let result = state.last_result.clone().unwrap_or_else(|| PhaseResult {
                        phase_id: phase.id.clone(),
                        attempt: 0,
                        success: true,
                        output: String::new(),
                        duration: Default::default(),
                        output_files: Vec::new(),
                        error: None,
                        retries: 0,
                        model: None,
                    });
                    return Ok(Step::Return(PhaseOutcome::Passed(result)));
                }
                EscalationDecision::EscalateToHuman { request, path } => {
                    self.sink.emit(PipelineEvent::HumanRequired {
                        phase_id: phase.id.clone(),
                        request: path,
                    });
                    ctx.status.update(|s| s.phase_mut(&phase.id).status = PhaseState::AwaitingHuman)?;

                    match self.await_human(phase, controller, &request, state, ctx).await? {
                        Some(next) => {
                            ctx.status.update(|s| s.phase_mut(&phase.id).status = PhaseState::Running)?;
                            self.save_escalation(phase, controller, &state.working, ctx.status)?;
                            decision = next;
                        }
                        None if ctx.cancel.is_cancelled() => {
                            return Ok(Step::Return(PhaseOutcome::Cancelled));
                        }
                        None => return Ok(Step::Return(PhaseOutcome::AwaitingHuman)),
                    }
                }
            }
        }
    }

    /// Wait for a valid decision. `None` means halted or cancelled.
    async fn await_human(
        &self,
        phase: &PhaseDefinition,
        controller: &mut EscalationController,
        request: &HumanRequest,
        state: &Attempts,
        ctx: &RunContext<'_>,
    ) -> Result<Option<EscalationDecision>> {
        let dir = controller.artifacts().dir().to_path_buf();
        loop {
            match self.human.wait(&dir, ctx.cancel.clone()).await? {
                GateWait::Decision(decision) => {
                    match controller.apply_human_decision(&decision, request, &state.working) {
                        Ok(next) => return Ok(Some(next)),
                        Err(e) => {
                            tracing::warn!(phase = %phase.id, error = %e, "Ignoring invalid human decision");
                        }
                    }
                }
                GateWait::Halted | GateWait::Cancelled => return Ok(None),
            }
        }
    }

    /// Run the agent once, absorbing transient failures up to the policy's
    /// transient budget. Timeouts count as transient.
    async fn execute(
        &self,
        phase: &PhaseDefinition,
        working: &WorkingConfig,
        attempt: u32,
        policy: &PhasePolicy,
        phase_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        let instructions = self.compose_instructions(phase, working, phase_dir)?;
        let model = working
            .agent
            .model
            .clone()
            .or_else(|| self.config.agent.model.clone());
        let started = Instant::now();
        let mut retries = 0;

        loop {
            let request = ExecutionRequest {
                phase_id: phase.id.clone(),
                attempt,
                working_dir: self.paths.project_dir.clone(),
                instructions: instructions.clone(),
                model: model.clone(),
            };

            let outcome = tokio::select! {
                outcome = tokio::time::timeout(policy.timeout, self.executor.execute(request, cancel.child_token())) => outcome,
                _ = cancel.cancelled() => return Ok(Execution::Cancelled),
            };

            let (class, message) = match outcome {
                Ok(Ok(o)) if o.success => {
                    return Ok(Execution::Finished(PhaseResult {
                        phase_id: phase.id.clone(),
                        attempt,
                        success: true,
                        output: o.output,
                        duration: started.elapsed(),
                        output_files: Vec::new(),
                        error: None,
                        retries,
                        model,
                    }));
                }
                Ok(Ok(o)) => {
                    if cancel.is_cancelled() {
                        return Ok(Execution::Cancelled);
                    }
                    let class = classify_output(&o.output);
                    let exit = o.exit_code.map(|c| format!("exit code {}", c)).unwrap_or_else(|| "no exit code".to_string());
                    (class, format!("agent failed ({}): {}", exit, tail(o.output.trim(), 500)))
                }
                Ok(Err(e)) => (classify_error(&e), format!("{:#}", e)),
                Err(_) => (
                    FailureClass::Transient,
                    format!("agent timed out after {}s", policy.timeout.as_secs()),
                ),
            };

            if class == FailureClass::Transient && retries < policy.transient_retries {
                retries += 1;
                let delay = policy.backoff.delay(retries);
                tracing::warn!(
                    phase = %phase.id,
                    attempt,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure: {}", message
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = cancel.cancelled() => return Ok(Execution::Cancelled),
                }
            }

            tracing::warn!(phase = %phase.id, attempt, class = ?class, "Agent failed: {}", message);
            return Ok(Execution::Finished(PhaseResult {
                phase_id: phase.id.clone(),
                attempt,
                success: false,
                output: message.clone(),
                duration: started.elapsed(),
                output_files: Vec::new(),
                error: Some(to_execution_error(class, message)),
                retries,
                model,
            }));
        }
    }

    /// Verification then gate. Execution errors become a failed gate
    /// result without running either.
    async fn check(
        &self,
        phase: &PhaseDefinition,
        phase_dir: &Path,
        working: &WorkingConfig,
        result: &PhaseResult,
        attempt: u32,
        attempt_started: SystemTime,
        cancel: &CancellationToken,
    ) -> (Option<VerificationResult>, GateResult) {
        if let Some(error) = &result.error {
            return (
                None,
                GateResult::fail(
                    format!("{} error: {}", error.kind, error.message),
                    json!({ "error_kind": error.kind }),
                ),
            );
        }

        let verification = self
            .verifier
            .verify(phase, phase_dir, working, cancel.clone())
            .await;
        if !verification.success {
            let message = verification.failure_summary();
            self.sink.emit(PipelineEvent::VerificationFailed {
                phase_id: phase.id.clone(),
                attempt,
                message: message.clone(),
            });
            let details = serde_json::to_value(&verification).unwrap_or_default();
            return (Some(verification), GateResult::fail(message, details));
        }

        if let Some(gate) = &phase.gate
            && gate.reads_test_report()
            && let Some(command) = &self.config.baseline.command
        {
            let timeout = std::time::Duration::from_secs(self.config.baseline.command_timeout_secs);
            if let Err(e) = baseline::run_test_command(&self.paths.project_dir, command, timeout).await {
                tracing::warn!(phase = %phase.id, error = %format!("{:#}", e), "Test command failed");
            }
        }

        let gate = self
            .gates
            .evaluate_phase(phase.gate.as_ref(), phase_dir, Some(attempt_started));
        (Some(verification), gate)
    }

    fn compose_instructions(
        &self,
        phase: &PhaseDefinition,
        working: &WorkingConfig,
        phase_dir: &Path,
    ) -> Result<String> {
        let mut text = resolve_instructions(phase, &self.paths.project_dir)?;

        if !working.acceptance_criteria.is_empty() {
            text.push_str("\n\n## Acceptance Criteria\n");
            for criterion in &working.acceptance_criteria {
                text.push_str(&format!("- {}\n", criterion));
            }
        }
        if !working.agent.skills.is_empty() {
            text.push_str(&format!("\n\nSkills: {}\n", working.agent.skills.join(", ")));
        }
        if !working.agent.hints.is_empty() {
            text.push_str("\n\n## Additional Guidance\n");
            for hint in &working.agent.hints {
                text.push_str(&format!("- {}\n", hint));
            }
        }
        if !phase.expected_outputs.is_empty() {
            text.push_str(&format!(
                "\n\nWrite outputs under {} or the project root.\n",
                phase_dir.join("output").display()
            ));
        }
        if let Some(previous) = feedback::read(phase_dir) {
            text.push_str("\n\n## Feedback From Previous Attempts\n");
            text.push_str(&previous);
        }
        Ok(text)
    }

    fn persist_attempt(&self, phase_dir: &Path, record: &AttemptRecord) -> Result<PathBuf> {
        let path = phase_dir
            .join("attempts")
            .join(format!("attempt-{:03}.json", record.result.attempt));
        let json = serde_json::to_vec_pretty(record).context("Failed to serialize attempt")?;
        write_atomic(&path, &json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    fn save_escalation(
        &self,
        phase: &PhaseDefinition,
        controller: &EscalationController,
        working: &WorkingConfig,
        status: &mut StatusStore,
    ) -> Result<()> {
        let escalation = controller.state().clone();
        let working = working.clone();
        status.update(|s| {
            let rec = s.phase_mut(&phase.id);
            rec.escalation = escalation;
            rec.working = Some(working);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::advisor::NoopAdvisor;
    use crate::escalation::human::HaltingGate;
    use crate::executor::ExecutionOutcome;
    use crate::orchestrator::events::testing::MemorySink;
    use async_trait::async_trait;
    use forgeline_common::{ErrorKind, GateSpec, RunStatus};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    /// What the fake agent does on one invocation.
    #[derive(Clone)]
    enum Act {
        /// Sleep past any test timeout.
        Hang,
        Succeed,
        /// Write a file (relative to the working dir), then succeed.
        Write(&'static str),
        Fail(&'static str),
    }

    struct ScriptedExecutor {
        script: Mutex<VecDeque<Act>>,
        fallback: Act,
        calls: AtomicU32,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Act>, fallback: Act) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            request: ExecutionRequest,
            _cancel: CancellationToken,
        ) -> Result<ExecutionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let act = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            match act {
                Act::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ExecutionOutcome::success("late", Duration::from_secs(30)))
                }
                Act::Succeed => Ok(ExecutionOutcome::success("ok", Duration::ZERO)),
                Act::Write(file) => {
                    std::fs::write(request.working_dir.join(file), "content").unwrap();
                    Ok(ExecutionOutcome::success("wrote", Duration::ZERO))
                }
                Act::Fail(output) => Ok(ExecutionOutcome::failure(output, Duration::ZERO)),
            }
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        status: StatusStore,
        sink: Arc<MemorySink>,
    }

    fn harness(phase_ids: &[&str]) -> Harness {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        std::fs::create_dir_all(&paths.state_dir).unwrap();
        let ids: Vec<String> = phase_ids.iter().map(|s| s.to_string()).collect();
        let status = StatusStore::create(&paths.status_file(), RunStatus::new("h", &ids)).unwrap();
        Harness {
            dir,
            status,
            sink: Arc::new(MemorySink::default()),
        }
    }

    fn fast_config() -> ForgelineToml {
        let mut config = ForgelineToml::default();
        config.execution.backoff_base_ms = 1;
        config.execution.backoff_cap_secs = 1;
        config.baseline.enabled = false;
        config.escalation.advisor = crate::config::AdvisorMode::None;
        config
    }

    fn runner(h: &Harness, config: ForgelineToml, executor: Arc<dyn AgentExecutor>) -> PhaseRunner {
        let paths = ProjectPaths::new(h.dir.path());
        PhaseRunner::new(
            Arc::new(config),
            paths.clone(),
            executor,
            Arc::new(Verifier::new(&paths.project_dir, &[".".to_string()])),
            Arc::new(QualityGateEngine::new(&paths.project_dir, None)),
            Arc::new(NoopAdvisor),
            Arc::new(HaltingGate),
            h.sink.clone(),
        )
    }

    fn ctx<'a>(status: &'a mut StatusStore) -> RunContext<'a> {
        RunContext {
            status,
            previous_phases: vec![],
            reverts_remaining: 2,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_timeouts_retried_without_consuming_gate_budget() {
        let mut h = harness(&["build"]);
        let executor = ScriptedExecutor::new(vec![Act::Hang, Act::Hang], Act::Succeed);
        let mut phase = PhaseDefinition::new("build");
        phase.policy.timeout_secs = Some(1);
        let config = fast_config();
        let runner = runner(&h, config, executor.clone());

        let outcome = runner.run(&phase, ctx(&mut h.status)).await.unwrap();
        let PhaseOutcome::Passed(result) = outcome else {
            panic!("Expected pass, got {:?}", outcome);
        };
        assert!(result.success);
        assert_eq!(result.retries, 2);
        assert_eq!(result.attempt, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

        let record = h.status.record().phase("build").unwrap();
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(record.escalation.total_attempts, 0);
    }

    #[tokio::test]
    async fn test_report_left_from_before_the_attempt_fails_tests_gate() {
        let mut h = harness(&["test"]);
        let report = h.dir.path().join("test-results.json");
        std::fs::write(&report, r#"{"total": 1, "passed": 1, "failed": []}"#).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&report)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let mut phase = PhaseDefinition::new("test");
        phase.gate = Some(GateSpec::TestsPass {
            report: "test-results.json".to_string(),
        });
        let mut config = fast_config();
        config.execution.max_retries = 1;
        let runner = runner(&h, config, ScriptedExecutor::new(vec![], Act::Succeed));

        let outcome = runner.run(&phase, ctx(&mut h.status)).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::AwaitingHuman);
        let record = h.status.record().phase("test").unwrap();
        assert!(record.attempts[0].gate.message.contains("stale"), "{}", record.attempts[0].gate.message);
    }

    #[tokio::test]
    async fn test_transient_budget_exhaustion_becomes_gate_failure() {
        let mut h = harness(&["build"]);
        let executor = ScriptedExecutor::new(vec![], Act::Fail("HTTP 429 Too Many Requests"));
        let mut config = fast_config();
        config.execution.max_retries = 1;
        let runner = runner(&h, config, executor.clone());

        let outcome = runner
            .run(&PhaseDefinition::new("build"), ctx(&mut h.status))
            .await
            .unwrap();
        assert_eq!(outcome, PhaseOutcome::AwaitingHuman);

        let record = h.status.record().phase("build").unwrap();
        assert_eq!(record.status, PhaseState::AwaitingHuman);
        // 2 tiers x 1 attempt x (1 + 2 transient retries)
        assert_eq!(executor.calls.load(Ordering::SeqCst), 6);
        let first = &record.attempts[0];
        assert_eq!(first.result.retries, 2);
        assert_eq!(first.result.error.as_ref().unwrap().kind, ErrorKind::Transient);
        assert!(!first.gate.passed);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let mut h = harness(&["build"]);
        let executor = ScriptedExecutor::new(
            vec![Act::Fail("SyntaxError: invalid syntax")],
            Act::Succeed,
        );
        let runner = runner(&h, fast_config(), executor.clone());

        let outcome = runner
            .run(&PhaseDefinition::new("build"), ctx(&mut h.status))
            .await
            .unwrap();
        assert!(matches!(outcome, PhaseOutcome::Passed(_)));
        // one permanent failure (no transient retry), then a passing attempt
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        let record = h.status.record().phase("build").unwrap();
        assert_eq!(record.attempts.len(), 2);
        assert_eq!(
            record.attempts[0].result.error.as_ref().unwrap().kind,
            ErrorKind::Permanent
        );
        assert_eq!(record.attempts[0].result.retries, 0);
        assert!(h.sink.names().contains(&"gate_failed"));
    }

    #[tokio::test]
    async fn test_missing_output_reaches_human_after_six_attempts() {
        let mut h = harness(&["design"]);
        let executor = ScriptedExecutor::new(vec![], Act::Succeed);
        let runner = runner(&h, fast_config(), executor.clone());
        let phase = PhaseDefinition::new("design").with_outputs(&["design.md"]);

        let outcome = runner.run(&phase, ctx(&mut h.status)).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::AwaitingHuman);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 6);

        let names = h.sink.names();
        assert_eq!(names.iter().filter(|n| **n == "verification_failed").count(), 6);
        assert_eq!(names.iter().filter(|n| **n == "escalated").count(), 2);
        assert_eq!(names.last(), Some(&"human_required"));

        let paths = ProjectPaths::new(h.dir.path());
        let request = std::fs::read_to_string(paths.escalation_dir("design").join("human-request.yaml")).unwrap();
        let request: HumanRequest = serde_yaml::from_str(&request).unwrap();
        assert_eq!(request.attempts.len(), 6);

        let feedback = feedback::read(&paths.phase_dir("design")).unwrap();
        assert!(feedback.contains("missing outputs: design.md"));
        assert!(paths.phase_dir("design").join("attempts/attempt-006.json").exists());
    }

    #[tokio::test]
    async fn test_feedback_reaches_next_attempt_and_is_cleared_on_pass() {
        let mut h = harness(&["design"]);
        let executor = ScriptedExecutor::new(vec![Act::Succeed], Act::Write("design.md"));
        let runner = runner(&h, fast_config(), executor.clone());
        let phase = PhaseDefinition::new("design")
            .with_outputs(&["design.md"])
            .with_gate(GateSpec::FilesExist {
                files: vec!["design.md".to_string()],
            });

        let outcome = runner.run(&phase, ctx(&mut h.status)).await.unwrap();
        let PhaseOutcome::Passed(result) = outcome else {
            panic!("Expected pass");
        };
        assert_eq!(result.attempt, 2);
        assert_eq!(result.output_files.len(), 1);
        let paths = ProjectPaths::new(h.dir.path());
        assert!(feedback::read(&paths.phase_dir("design")).is_none());
        let record = h.status.record().phase("design").unwrap();
        assert_eq!(record.escalation, Default::default());
    }

    #[tokio::test]
    async fn test_resume_at_human_tier_consumes_decision() {
        let mut h = harness(&["design"]);
        let paths = ProjectPaths::new(h.dir.path());
        let phase = PhaseDefinition::new("design").with_outputs(&["design.md"]);

        let first = runner(&h, fast_config(), ScriptedExecutor::new(vec![], Act::Succeed));
        assert_eq!(
            first.run(&phase, ctx(&mut h.status)).await.unwrap(),
            PhaseOutcome::AwaitingHuman
        );

        let request: HumanRequest = serde_yaml::from_str(
            &std::fs::read_to_string(paths.escalation_dir("design").join("human-request.yaml")).unwrap(),
        )
        .unwrap();
        let accept = request
            .options
            .iter()
            .find(|o| o.action == forgeline_common::RecoveryAction::AcceptOutput)
            .unwrap()
            .rank;
        crate::escalation::human::submit_decision(
            &paths.escalation_dir("design"),
            &forgeline_common::HumanDecision::ResumeWithOption { option: accept },
        )
        .unwrap();

        let executor = ScriptedExecutor::new(vec![], Act::Succeed);
        let second = runner(&h, fast_config(), executor.clone());
        let outcome = second.run(&phase, ctx(&mut h.status)).await.unwrap();
        assert!(matches!(outcome, PhaseOutcome::Passed(_)));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.status.record().phase("design").unwrap().escalation.tier, Tier::Retry);
    }

    #[tokio::test]
    async fn test_cancel_stops_hanging_agent() {
        let mut h = harness(&["build"]);
        let executor = ScriptedExecutor::new(vec![], Act::Hang);
        let runner = runner(&h, fast_config(), executor);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = runner
            .run(
                &PhaseDefinition::new("build"),
                RunContext {
                    status: &mut h.status,
                    previous_phases: vec![],
                    reverts_remaining: 0,
                    cancel,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, PhaseOutcome::Cancelled);
    }
}
