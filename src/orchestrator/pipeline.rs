//! Sequences phases through a run.
//!
//! The work list is a `VecDeque`: static phases in dependency order, then
//! whatever completed phases generate, with reverted phases pushed back on
//! the front. Phases never run concurrently.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use forgeline_common::{BaselineSnapshot, PhaseDefinition, PhaseState, PipelineEvent, RunState, RunStatus};

use super::events::{EventSink, TracingSink};
use super::runner::{PhaseOutcome, PhaseRunner, RunContext};
use super::state::StatusStore;
use crate::baseline;
use crate::config::{ForgelineToml, HumanWait, ProjectPaths};
use crate::escalation::advisor::{RecoveryAdvisor, advisor_from_config};
use crate::escalation::human::{FileDecisionPoller, HaltingGate, HumanGate};
use crate::executor::{AgentExecutor, CommandExecutor};
use crate::gates::QualityGateEngine;
use crate::project::{ProjectFile, load_generated, order_phases, project_hash};
use crate::verify::Verifier;
use crate::verify::judge::{AgentJudge, Judge};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Continue the run recorded in `status.json` instead of starting over.
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { phases: usize },
    Failed { phase: Option<String>, reason: String },
    Cancelled,
    /// Halted at the human tier; resume once a decision is written.
    AwaitingHuman { phase: String },
}

pub struct PipelineOrchestrator {
    paths: ProjectPaths,
    config: Arc<ForgelineToml>,
    executor: Option<Arc<dyn AgentExecutor>>,
    advisor: Option<Arc<dyn RecoveryAdvisor>>,
    human: Option<Arc<dyn HumanGate>>,
    judge: Option<Arc<dyn Judge>>,
    sink: Arc<dyn EventSink>,
}

/// The phases a run knows about and the order it learned them in.
struct Plan {
    order: Vec<String>,
    defs: HashMap<String, PhaseDefinition>,
    expanded: HashSet<String>,
}

impl Plan {
    fn new(phases: &[PhaseDefinition]) -> Self {
        Self {
            order: phases.iter().map(|p| p.id.clone()).collect(),
            defs: phases.iter().map(|p| (p.id.clone(), p.clone())).collect(),
            expanded: HashSet::new(),
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|p| p == id)
    }

    fn known(&self) -> HashSet<String> {
        self.order.iter().cloned().collect()
    }

    fn add(&mut self, phase: PhaseDefinition) {
        self.order.push(phase.id.clone());
        self.defs.insert(phase.id.clone(), phase);
    }
}

impl PipelineOrchestrator {
    pub fn new(project_dir: &Path, config: ForgelineToml) -> Self {
        Self {
            paths: ProjectPaths::new(project_dir),
            config: Arc::new(config),
            executor: None,
            advisor: None,
            human: None,
            judge: None,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn RecoveryAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_human_gate(mut self, human: Arc<dyn HumanGate>) -> Self {
        self.human = Some(human);
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub async fn run(&self, options: RunOptions, cancel: CancellationToken) -> Result<RunOutcome> {
        let project_file = ProjectFile::locate(&self.paths.state_dir)?;
        let project = ProjectFile::load(&project_file)?;
        let phases = project.execution_order()?;
        let hash = project_hash(&project_file)?;

        let mut status = self.open_status(options.resume, &hash, &phases)?;
        let baseline = self.prepare_baseline(options.resume).await?;

        let runner = self.build_runner(baseline);
        let mut plan = Plan::new(&phases);
        let mut queue: VecDeque<PhaseDefinition> = phases.into_iter().collect();

        tracing::info!(
            run_id = %status.record().run_id,
            phases = plan.order.len(),
            resume = options.resume,
            "Pipeline started"
        );

        while let Some(phase) = queue.pop_front() {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&mut status);
            }

            let completed = status
                .record()
                .phase(&phase.id)
                .is_some_and(|p| p.status == PhaseState::Completed);
            if completed {
                tracing::info!(phase = %phase.id, "Skipping completed phase");
                if let Err(e) = self.expand(&phase, &mut plan, &mut queue) {
                    return self.finish_failed(&mut status, Some(phase.id.as_str()), format!("{:#}", e));
                }
                continue;
            }

            if !self.sink.emit(PipelineEvent::PhaseStart {
                phase_id: phase.id.clone(),
            }) {
                return self.finish_cancelled(&mut status);
            }
            status.update(|s| {
                s.current_phase = Some(phase.id.clone());
                let rec = s.phase_mut(&phase.id);
                if rec.status == PhaseState::Failed {
                    rec.reset();
                }
                rec.status = PhaseState::Running;
                rec.error = None;
                rec.started_at.get_or_insert_with(Utc::now);
            })?;

            let previous_phases = self.previous_phases(&plan, &phase.id, status.record());
            let reverts_remaining = self
                .config
                .execution
                .max_reverts
                .saturating_sub(status.record().reverts);

            let outcome = runner
                .run(
                    &phase,
                    RunContext {
                        status: &mut status,
                        previous_phases,
                        reverts_remaining,
                        cancel: cancel.clone(),
                    },
                )
                .await?;

            match outcome {
                PhaseOutcome::Passed(_) => {
                    let attempts = status
                        .record()
                        .phase(&phase.id)
                        .map(|p| p.attempts.len() as u32)
                        .unwrap_or(0);
                    status.update(|s| {
                        let rec = s.phase_mut(&phase.id);
                        rec.status = PhaseState::Completed;
                        rec.finished_at = Some(Utc::now());
                    })?;
                    self.sink.emit(PipelineEvent::PhaseComplete {
                        phase_id: phase.id.clone(),
                        attempts,
                    });
                    if let Err(e) = self.expand(&phase, &mut plan, &mut queue) {
                        return self.finish_failed(&mut status, Some(phase.id.as_str()), format!("{:#}", e));
                    }
                }
                PhaseOutcome::Failed { reason } => {
                    return self.finish_failed(&mut status, Some(phase.id.as_str()), reason);
                }
                PhaseOutcome::Revert { to_phase } => {
                    self.revert(&phase, &to_phase, &plan, &mut queue, &mut status)?;
                }
                PhaseOutcome::AwaitingHuman => {
                    status.update(|s| {
                        s.status = RunState::AwaitingHuman;
                        s.error = Some(format!("awaiting human decision for phase {}", phase.id));
                    })?;
                    self.sink.emit(PipelineEvent::JobFailed {
                        error: format!("awaiting human decision for phase {}", phase.id),
                    });
                    tracing::warn!(phase = %phase.id, "Run halted awaiting a human decision");
                    return Ok(RunOutcome::AwaitingHuman { phase: phase.id });
                }
                PhaseOutcome::Cancelled => return self.finish_cancelled(&mut status),
            }
        }

        let phases = plan.order.len();
        status.update(|s| {
            s.status = RunState::Completed;
            s.current_phase = None;
            s.error = None;
            s.finished_at = Some(Utc::now());
        })?;
        self.sink.emit(PipelineEvent::ProjectComplete { phases });
        tracing::info!(phases, "Pipeline complete");
        Ok(RunOutcome::Completed { phases })
    }

    fn open_status(&self, resume: bool, hash: &str, phases: &[PhaseDefinition]) -> Result<StatusStore> {
        std::fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!("Failed to create state dir: {}", self.paths.state_dir.display())
        })?;
        let path = self.paths.status_file();

        if resume {
            let mut store = StatusStore::load(&path)?;
            if store.record().project_hash != hash {
                tracing::warn!(
                    recorded = %store.record().project_hash,
                    current = %hash,
                    "Project file changed since the run started"
                );
            }
            store.update(|s| {
                s.status = RunState::Running;
                s.error = None;
                s.finished_at = None;
                for phase in phases {
                    s.phase_mut(&phase.id);
                }
            })?;
            tracing::info!(
                run_id = %store.record().run_id,
                completed = store.record().completed_phases().len(),
                "Resuming run"
            );
            return Ok(store);
        }

        self.archive_previous_run()?;
        let ids: Vec<String> = phases.iter().map(|p| p.id.clone()).collect();
        Ok(StatusStore::create(&path, RunStatus::new(hash, &ids))?)
    }

    /// Move the previous run's phase directories (attempts, feedback,
    /// escalation artifacts) to `runs/<run id>/phases` so a fresh run starts
    /// from nothing.
    fn archive_previous_run(&self) -> Result<()> {
        let phases_dir = self.paths.phases_dir();
        if !phases_dir.exists() {
            return Ok(());
        }
        let label = match StatusStore::read(&self.paths.status_file()) {
            Ok(Some(previous)) => previous.run_id,
            Ok(None) | Err(_) => format!("unrecorded-{}", Utc::now().format("%Y%m%dT%H%M%S")),
        };
        let target = free_path(&self.paths.runs_dir(), &label);
        std::fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        std::fs::rename(&phases_dir, target.join("phases"))
            .with_context(|| format!("Failed to archive {}", phases_dir.display()))?;
        tracing::info!(archive = %target.display(), "Archived previous run artifacts");
        Ok(())
    }

    async fn prepare_baseline(&self, resume: bool) -> Result<Option<BaselineSnapshot>> {
        let path = self.paths.baseline_file();
        if resume && let Some(snapshot) = baseline::load(&path)? {
            tracing::info!(failing = snapshot.failing.len(), "Reusing stored baseline");
            return Ok(Some(snapshot));
        }

        match baseline::capture(&self.paths.project_dir, &self.config.baseline).await {
            Ok(Some(snapshot)) => {
                baseline::save(&path, &snapshot)?;
                Ok(Some(snapshot))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Baseline capture failed; gating on absolute test results");
                Ok(None)
            }
        }
    }

    fn build_runner(&self, baseline: Option<BaselineSnapshot>) -> PhaseRunner {
        let executor: Arc<dyn AgentExecutor> = match &self.executor {
            Some(executor) => executor.clone(),
            None => Arc::new(CommandExecutor::from_config(&self.config.agent)),
        };
        let judge: Arc<dyn Judge> = match &self.judge {
            Some(judge) => judge.clone(),
            None => Arc::new(AgentJudge::new(
                executor.clone(),
                self.config
                    .agent
                    .judge_model
                    .clone()
                    .or_else(|| self.config.agent.model.clone()),
            )),
        };
        let advisor = match &self.advisor {
            Some(advisor) => advisor.clone(),
            None => advisor_from_config(&self.config, executor.clone()),
        };
        let human: Arc<dyn HumanGate> = match &self.human {
            Some(human) => human.clone(),
            None => match self.config.escalation.human_wait {
                HumanWait::Halt => Arc::new(HaltingGate),
                HumanWait::Wait => Arc::new(FileDecisionPoller::new(Duration::from_secs(
                    self.config.escalation.human_poll_secs.max(1),
                ))),
            },
        };

        let verifier = Verifier::new(&self.paths.project_dir, &self.config.verify.search_dirs)
            .with_judge(judge);

        PhaseRunner::new(
            self.config.clone(),
            self.paths.clone(),
            executor,
            Arc::new(verifier),
            Arc::new(QualityGateEngine::new(&self.paths.project_dir, baseline)),
            advisor,
            human,
            self.sink.clone(),
        )
    }

    /// Completed phases that ran before `current`, in plan order.
    fn previous_phases(&self, plan: &Plan, current: &str, record: &RunStatus) -> Vec<String> {
        let end = plan.position(current).unwrap_or(plan.order.len());
        plan.order[..end]
            .iter()
            .filter(|id| {
                record
                    .phase(id)
                    .is_some_and(|p| p.status == PhaseState::Completed)
            })
            .cloned()
            .collect()
    }

    /// Append the phases a completed phase generated, once per run.
    fn expand(
        &self,
        phase: &PhaseDefinition,
        plan: &mut Plan,
        queue: &mut VecDeque<PhaseDefinition>,
    ) -> Result<()> {
        if !phase.generates_phases || plan.expanded.contains(&phase.id) {
            return Ok(());
        }
        plan.expanded.insert(phase.id.clone());

        let Some(generated) = load_generated(&self.paths.phase_dir(&phase.id))? else {
            tracing::debug!(phase = %phase.id, "No generated phases");
            return Ok(());
        };
        if generated.is_empty() {
            return Ok(());
        }

        let ordered = order_phases(&generated, &plan.known())
            .with_context(|| format!("Invalid phases generated by {}", phase.id))?;
        let ids: Vec<String> = ordered.iter().map(|p| p.id.clone()).collect();
        for def in ordered {
            plan.add(def.clone());
            queue.push_back(def);
        }
        tracing::info!(phase = %phase.id, added = ids.len(), "Generated phases appended");
        self.sink.emit(PipelineEvent::PhasesAdded { phase_ids: ids });
        Ok(())
    }

    /// Reset `to_phase` through `current` and queue them again in order.
    fn revert(
        &self,
        current: &PhaseDefinition,
        to_phase: &str,
        plan: &Plan,
        queue: &mut VecDeque<PhaseDefinition>,
        status: &mut StatusStore,
    ) -> Result<()> {
        let (Some(start), Some(end)) = (plan.position(to_phase), plan.position(&current.id)) else {
            anyhow::bail!("Cannot revert {} to unknown phase {}", current.id, to_phase);
        };
        let span: Vec<String> = plan.order[start.min(end)..=end].to_vec();

        status.update(|s| {
            s.reverts += 1;
            for id in &span {
                s.phase_mut(id).reset();
            }
        })?;
        let generation = status.record().reverts;
        for id in &span {
            let attempts = self.paths.phase_dir(id).join("attempts");
            if attempts.exists() {
                let archived = free_path(
                    &self.paths.phase_dir(id),
                    &format!("attempts-reverted-{}", generation),
                );
                std::fs::rename(&attempts, &archived)
                    .with_context(|| format!("Failed to archive {}", attempts.display()))?;
            }
        }

        // Anything from the span still queued would run twice.
        queue.retain(|p| !span.contains(&p.id));
        for id in span.iter().rev() {
            if let Some(def) = plan.defs.get(id) {
                queue.push_front(def.clone());
            }
        }

        tracing::warn!(
            from = %current.id,
            to = %to_phase,
            reset = span.len(),
            reverts = status.record().reverts,
            "Reverting pipeline"
        );
        self.sink.emit(PipelineEvent::PhaseReverted {
            from: current.id.clone(),
            to: to_phase.to_string(),
        });
        Ok(())
    }

    fn finish_failed(&self, status: &mut StatusStore, phase: Option<&str>, reason: String) -> Result<RunOutcome> {
        status.update(|s| {
            if let Some(id) = phase {
                let rec = s.phase_mut(id);
                rec.status = PhaseState::Failed;
                rec.error = Some(reason.clone());
                rec.finished_at = Some(Utc::now());
            }
            s.status = RunState::Failed;
            s.error = Some(reason.clone());
            s.finished_at = Some(Utc::now());
        })?;
        if let Some(id) = phase {
            self.sink.emit(PipelineEvent::PhaseFailed {
                phase_id: id.to_string(),
                reason: reason.clone(),
            });
        }
        self.sink.emit(PipelineEvent::JobFailed { error: reason.clone() });
        Ok(RunOutcome::Failed {
            phase: phase.map(str::to_string),
            reason,
        })
    }

    fn finish_cancelled(&self, status: &mut StatusStore) -> Result<RunOutcome> {
        status.update(|s| {
            if let Some(id) = s.current_phase.clone() {
                let rec = s.phase_mut(&id);
                if rec.status == PhaseState::Running {
                    rec.status = PhaseState::Pending;
                }
            }
            s.status = RunState::Cancelled;
            s.finished_at = Some(Utc::now());
        })?;
        self.sink.emit(PipelineEvent::JobCancelled);
        tracing::info!("Pipeline cancelled");
        Ok(RunOutcome::Cancelled)
    }
}

/// `dir/name`, or `dir/name-N` with the smallest N that does not exist yet.
fn free_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (2..)
        .map(|n| dir.join(format!("{}-{}", name, n)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::advisor::{RecoveryContext, RecoveryPlan};
    use crate::escalation::human::submit_decision;
    use crate::executor::{ExecutionOutcome, ExecutionRequest};
    use crate::orchestrator::events::testing::MemorySink;
    use async_trait::async_trait;
    use forgeline_common::{HumanDecision, HumanRequest, RecoveryAction};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    type Behaviour = Box<dyn Fn(&ExecutionRequest, u32) -> ExecutionOutcome + Send + Sync>;

    /// Calls `behaviour` with the request and how many times that phase has
    /// run so far (1-based).
    struct FnExecutor {
        behaviour: Behaviour,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl FnExecutor {
        fn new(behaviour: impl Fn(&ExecutionRequest, u32) -> ExecutionOutcome + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                behaviour: Box::new(behaviour),
                calls: Mutex::new(HashMap::new()),
            })
        }

        fn calls(&self, phase: &str) -> u32 {
            self.calls.lock().unwrap().get(phase).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl AgentExecutor for FnExecutor {
        async fn execute(&self, request: ExecutionRequest, _cancel: CancellationToken) -> Result<ExecutionOutcome> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(request.phase_id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            Ok((self.behaviour)(&request, n))
        }
    }

    fn ok() -> ExecutionOutcome {
        ExecutionOutcome::success("done", Duration::ZERO)
    }

    fn write(request: &ExecutionRequest, rel: &str, content: &str) {
        let path = request.working_dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn project(dir: &Path, yaml: &str) {
        let state = dir.join(".forgeline");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("project.yaml"), yaml).unwrap();
    }

    fn config() -> ForgelineToml {
        let mut config = ForgelineToml::default();
        config.baseline.enabled = false;
        config.execution.max_retries = 1;
        config.execution.backoff_base_ms = 1;
        config.escalation.advisor = crate::config::AdvisorMode::None;
        config.escalation.human_wait = HumanWait::Halt;
        config
    }

    fn orchestrator(dir: &Path, executor: Arc<dyn AgentExecutor>, sink: Arc<MemorySink>) -> PipelineOrchestrator {
        PipelineOrchestrator::new(dir, config())
            .with_executor(executor)
            .with_sink(sink)
    }

    const TWO_PHASES: &str = r#"
phases:
  - id: build
    depends_on: [design]
    expected_outputs: [build.txt]
  - id: design
    expected_outputs: [design.md]
"#;

    #[tokio::test]
    async fn test_phases_run_in_dependency_order() {
        let dir = tempdir().unwrap();
        project(dir.path(), TWO_PHASES);
        let executor = FnExecutor::new(|req, _| {
            match req.phase_id.as_str() {
                "design" => write(req, "design.md", "# Design"),
                _ => write(req, "build.txt", "built"),
            }
            ok()
        });
        let sink = Arc::new(MemorySink::default());

        let outcome = orchestrator(dir.path(), executor, sink.clone())
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { phases: 2 });

        let starts: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::PhaseStart { phase_id } => Some(phase_id),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec!["design", "build"]);
        assert_eq!(sink.names().last(), Some(&"project_complete"));

        let status = StatusStore::read(&dir.path().join(".forgeline/status.json"))
            .unwrap()
            .unwrap();
        assert_eq!(status.status, RunState::Completed);
        assert_eq!(status.completed_phases().len(), 2);
    }

    #[tokio::test]
    async fn test_generated_phases_are_appended() {
        let dir = tempdir().unwrap();
        project(
            dir.path(),
            "phases:\n  - id: plan\n    generates_phases: true\n",
        );
        let executor = FnExecutor::new(|req, _| {
            if req.phase_id == "plan" {
                write(
                    req,
                    ".forgeline/phases/plan/generated-phases.json",
                    r#"[{"id": "impl-b", "depends_on": ["impl-a"]}, {"id": "impl-a", "depends_on": ["plan"]}]"#,
                );
            }
            ok()
        });
        let sink = Arc::new(MemorySink::default());

        let outcome = orchestrator(dir.path(), executor.clone(), sink.clone())
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { phases: 3 });
        assert!(sink.events().contains(&PipelineEvent::PhasesAdded {
            phase_ids: vec!["impl-a".to_string(), "impl-b".to_string()],
        }));
        assert_eq!(executor.calls("impl-a"), 1);
        assert_eq!(executor.calls("impl-b"), 1);
    }

    #[tokio::test]
    async fn test_invalid_generated_phases_fail_the_run() {
        let dir = tempdir().unwrap();
        project(
            dir.path(),
            "phases:\n  - id: plan\n    generates_phases: true\n",
        );
        let executor = FnExecutor::new(|req, _| {
            write(
                req,
                ".forgeline/phases/plan/generated-phases.json",
                r#"[{"id": "x", "depends_on": ["nowhere"]}]"#,
            );
            ok()
        });
        let sink = Arc::new(MemorySink::default());

        let outcome = orchestrator(dir.path(), executor, sink.clone())
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        let RunOutcome::Failed { phase, reason } = outcome else {
            panic!("Expected failure");
        };
        assert_eq!(phase.as_deref(), Some("plan"));
        assert!(reason.contains("unknown phase nowhere"), "{}", reason);
        assert_eq!(sink.names().last(), Some(&"job_failed"));
    }

    struct RevertOnce {
        target: String,
        used: AtomicBool,
    }

    #[async_trait]
    impl RecoveryAdvisor for RevertOnce {
        fn name(&self) -> &'static str {
            "revert-once"
        }

        async fn advise(&self, _context: &RecoveryContext, _cancel: CancellationToken) -> Result<RecoveryPlan> {
            let mut plan = RecoveryPlan::unchanged("test");
            if !self.used.swap(true, Ordering::SeqCst) {
                plan.revert_to = Some(self.target.clone());
            }
            Ok(plan)
        }
    }

    #[tokio::test]
    async fn test_revert_reruns_earlier_phase() {
        let dir = tempdir().unwrap();
        project(dir.path(), TWO_PHASES);
        let design_runs = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = design_runs.clone();
        let executor = FnExecutor::new(move |req, _| {
            if req.phase_id == "design" {
                counter.fetch_add(1, Ordering::SeqCst);
                write(req, "design.md", "# Design");
            } else if counter.load(Ordering::SeqCst) >= 2 {
                write(req, "build.txt", "built");
            }
            ok()
        });
        let sink = Arc::new(MemorySink::default());

        let outcome = orchestrator(dir.path(), executor, sink.clone())
            .with_advisor(Arc::new(RevertOnce {
                target: "design".to_string(),
                used: AtomicBool::new(false),
            }))
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { phases: 2 });
        assert_eq!(design_runs.load(Ordering::SeqCst), 2);
        assert!(sink.events().contains(&PipelineEvent::PhaseReverted {
            from: "build".to_string(),
            to: "design".to_string(),
        }));

        let status = StatusStore::read(&dir.path().join(".forgeline/status.json"))
            .unwrap()
            .unwrap();
        assert_eq!(status.reverts, 1);
        assert_eq!(status.phase("build").unwrap().attempts.len(), 1);
        let build_dir = dir.path().join(".forgeline/phases/build");
        assert!(build_dir.join("attempts/attempt-001.json").exists());
        assert!(build_dir.join("attempts-reverted-1/attempt-001.json").exists());
    }

    fn revert_once(target: &str) -> Arc<RevertOnce> {
        Arc::new(RevertOnce {
            target: target.to_string(),
            used: AtomicBool::new(false),
        })
    }

    /// `build` only succeeds on its second call, after the revert.
    fn build_after_revert() -> Arc<FnExecutor> {
        FnExecutor::new(|req, n| {
            if req.phase_id == "design" {
                write(req, "design.md", "# Design");
            } else if n >= 2 {
                write(req, "build.txt", "built");
            }
            ok()
        })
    }

    #[tokio::test]
    async fn test_second_fresh_run_can_revert_again() {
        let dir = tempdir().unwrap();
        project(dir.path(), TWO_PHASES);
        let status_path = dir.path().join(".forgeline/status.json");

        let outcome = orchestrator(dir.path(), build_after_revert(), Arc::new(MemorySink::default()))
            .with_advisor(revert_once("design"))
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { phases: 2 });
        let first_run = StatusStore::read(&status_path).unwrap().unwrap().run_id;

        std::fs::remove_file(dir.path().join("build.txt")).unwrap();
        let sink = Arc::new(MemorySink::default());
        let outcome = orchestrator(dir.path(), build_after_revert(), sink.clone())
            .with_advisor(revert_once("design"))
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { phases: 2 });
        assert!(sink.names().contains(&"phase_reverted"));

        let archived = dir.path().join(".forgeline/runs").join(&first_run).join("phases/build");
        assert!(archived.join("attempts-reverted-1/attempt-001.json").exists());
        let current = dir.path().join(".forgeline/phases/build");
        assert!(current.join("attempts-reverted-1/attempt-001.json").exists());
        assert!(!current.join("attempts-reverted-1-2").exists());
    }

    #[test]
    fn test_free_path_skips_taken_names() {
        let dir = tempdir().unwrap();
        assert_eq!(free_path(dir.path(), "a"), dir.path().join("a"));
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("a-2")).unwrap();
        assert_eq!(free_path(dir.path(), "a"), dir.path().join("a-3"));
    }

    #[tokio::test]
    async fn test_fresh_run_does_not_inherit_previous_feedback() {
        let dir = tempdir().unwrap();
        project(dir.path(), "phases:\n  - id: only\n    expected_outputs: [never.txt]\n");
        let prompts = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = prompts.clone();
        let executor = FnExecutor::new(move |req, _| {
            seen.lock().unwrap().push(req.instructions.clone());
            ok()
        });
        let status_path = dir.path().join(".forgeline/status.json");

        let outcome = orchestrator(dir.path(), executor.clone(), Arc::new(MemorySink::default()))
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::AwaitingHuman { .. }));
        let first_run = StatusStore::read(&status_path).unwrap().unwrap().run_id;
        let first_run_calls = prompts.lock().unwrap().len();
        assert_eq!(first_run_calls, 2);

        orchestrator(dir.path(), executor.clone(), Arc::new(MemorySink::default()))
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        let prompts = prompts.lock().unwrap();
        assert!(!prompts[first_run_calls].contains("Feedback From Previous Attempts"));
        assert!(prompts[first_run_calls + 1].contains("Feedback From Previous Attempts"));
        let archived = dir.path().join(".forgeline/runs").join(&first_run).join("phases/only");
        assert!(archived.join("escalation/human-request.yaml").exists());
        assert!(archived.join("attempts/attempt-002.json").exists());
    }

    #[tokio::test]
    async fn test_halt_then_resume_with_decision() {
        let dir = tempdir().unwrap();
        project(dir.path(), TWO_PHASES);
        let executor = FnExecutor::new(|req, _| {
            if req.phase_id == "design" {
                write(req, "design.md", "# Design");
            }
            ok()
        });
        let sink = Arc::new(MemorySink::default());

        let outcome = orchestrator(dir.path(), executor.clone(), sink.clone())
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::AwaitingHuman {
                phase: "build".to_string()
            }
        );
        let status_path = dir.path().join(".forgeline/status.json");
        assert_eq!(
            StatusStore::read(&status_path).unwrap().unwrap().status,
            RunState::AwaitingHuman
        );

        let escalation = dir.path().join(".forgeline/phases/build/escalation");
        let request: HumanRequest =
            serde_yaml::from_str(&std::fs::read_to_string(escalation.join("human-request.yaml")).unwrap())
                .unwrap();
        let accept = request
            .options
            .iter()
            .find(|o| o.action == RecoveryAction::AcceptOutput)
            .unwrap();
        submit_decision(&escalation, &HumanDecision::ResumeWithOption { option: accept.rank }).unwrap();

        let outcome = orchestrator(dir.path(), executor.clone(), sink.clone())
            .run(RunOptions { resume: true }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { phases: 2 });
        assert_eq!(executor.calls("design"), 1);
        assert_eq!(executor.calls("build"), 2);
    }

    #[tokio::test]
    async fn test_abort_decision_fails_run() {
        let dir = tempdir().unwrap();
        project(dir.path(), "phases:\n  - id: only\n    expected_outputs: [never.txt]\n");
        let executor = FnExecutor::new(|_, _| ok());
        let sink = Arc::new(MemorySink::default());
        let orchestrator = orchestrator(dir.path(), executor.clone(), sink.clone());

        orchestrator
            .run(RunOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        submit_decision(
            &orchestrator.paths().escalation_dir("only"),
            &HumanDecision::Abort {
                reason: Some("out of scope".to_string()),
            },
        )
        .unwrap();

        let outcome = orchestrator
            .run(RunOptions { resume: true }, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { phase: Some(ref p), .. } if p == "only"));
        assert!(sink.names().contains(&"phase_failed"));
        assert_eq!(executor.calls("only"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_emits_no_phase_start() {
        let dir = tempdir().unwrap();
        project(dir.path(), TWO_PHASES);
        let executor = FnExecutor::new(|_, _| ok());
        let sink = Arc::new(MemorySink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator(dir.path(), executor.clone(), sink.clone())
            .run(RunOptions::default(), cancel)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(sink.names(), vec!["job_cancelled"]);
        assert_eq!(executor.calls("design"), 0);
    }

    #[tokio::test]
    async fn test_resume_without_previous_run_errors() {
        let dir = tempdir().unwrap();
        project(dir.path(), TWO_PHASES);
        let err = orchestrator(dir.path(), FnExecutor::new(|_, _| ok()), Arc::new(MemorySink::default()))
            .run(RunOptions { resume: true }, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No previous run"));
    }
}
