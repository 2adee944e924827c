//! The per-phase escalation state machine.
//!
//! Tiers run in strict order: RETRY, then AUTONOMOUS, then HUMAN. Each tier
//! gets the same attempt budget. Leaving RETRY consults the recovery
//! advisor, which may reconfigure the phase or revert the pipeline; leaving
//! AUTONOMOUS writes a human request and waits for a decision. Only a human
//! resume moves the tier backwards, and it always resets both counters.
//!
//! | tier       | event                     | next           |
//! |------------|---------------------------|----------------|
//! | retry      | budget-th consecutive fail| autonomous     |
//! | autonomous | budget-th consecutive fail| human          |
//! | human      | resume decision           | retry (reset)  |
//! | human      | abort decision            | terminal fail  |

pub mod advisor;
pub mod artifacts;
pub mod human;

use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use forgeline_common::{
    AttemptRecord, ConfigChange, EscalationState, HumanDecision, HumanRequest, RecoveryAction,
    Tier, WorkingConfig,
};

use advisor::{RecoveryAdvisor, RecoveryContext, RecoveryPlan};
use artifacts::{AutonomousDecision, EscalationArtifacts, Trigger};
use human::{last_failure_of, override_config, rank_options};

/// What the runner should do after a failed attempt or a human decision.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationDecision {
    /// Try again with the same configuration.
    Retry { feedback: String },
    /// Replace the working configuration, then try again.
    Reconfigure {
        config: WorkingConfig,
        changes: Vec<ConfigChange>,
    },
    /// Re-run the pipeline from an earlier phase.
    Revert { to_phase: String },
    EscalateToHuman { request: HumanRequest, path: PathBuf },
    Abort { reason: String },
    /// Mark the phase complete with its current output.
    Accept,
}

#[derive(Debug, Error, PartialEq)]
pub enum DecisionError {
    #[error("Option {0} was not offered in the human request")]
    UnknownOption(u32),
}

/// Everything the controller needs to know about the failure it reacts to.
pub struct FailureContext<'a> {
    /// Full attempt history of the phase, including the failed attempt.
    pub attempts: &'a [AttemptRecord],
    pub working: &'a WorkingConfig,
    pub previous_phases: &'a [String],
    pub project_dir: &'a Path,
}

pub struct EscalationController {
    phase_id: String,
    state: EscalationState,
    budget: u32,
    artifacts: EscalationArtifacts,
    advisor: Arc<dyn RecoveryAdvisor>,
    fallback_models: Vec<String>,
}

impl EscalationController {
    /// `state` is the persisted state from the status record, so a restart
    /// continues at the same tier and count.
    pub fn new(
        phase_id: &str,
        state: EscalationState,
        budget: u32,
        escalation_dir: &Path,
        advisor: Arc<dyn RecoveryAdvisor>,
        fallback_models: Vec<String>,
    ) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            state,
            budget: budget.max(1),
            artifacts: EscalationArtifacts::new(escalation_dir),
            advisor,
            fallback_models,
        }
    }

    pub fn state(&self) -> &EscalationState {
        &self.state
    }

    pub fn tier(&self) -> Tier {
        self.state.tier
    }

    pub fn artifacts(&self) -> &EscalationArtifacts {
        &self.artifacts
    }

    pub fn record_success(&mut self) {
        self.state = EscalationState::default();
    }

    pub async fn on_gate_failure(
        &mut self,
        ctx: FailureContext<'_>,
        cancel: CancellationToken,
    ) -> Result<EscalationDecision> {
        let failure = last_failure_of(ctx.attempts);
        self.state.total_attempts += 1;
        self.state.attempts_at_tier += 1;

        if self.state.attempts_at_tier < self.budget {
            return Ok(EscalationDecision::Retry { feedback: failure });
        }

        match self.state.tier {
            Tier::Retry => self.enter_autonomous(&ctx, failure, cancel).await,
            Tier::Autonomous | Tier::Human => self.enter_human(&ctx, failure),
        }
    }

    fn advance(&mut self, to: Tier, failure: &str) -> Result<()> {
        let from = self.state.tier;
        self.artifacts.write_trigger(&Trigger {
            phase_id: self.phase_id.clone(),
            from,
            to,
            attempts_at_tier: self.state.attempts_at_tier,
            total_attempts: self.state.total_attempts,
            last_failure: failure.to_string(),
            created_at: Utc::now(),
        })?;
        tracing::warn!(
            phase = %self.phase_id,
            from = %from,
            to = %to,
            total_attempts = self.state.total_attempts,
            "Escalating"
        );
        self.state.tier = to;
        self.state.attempts_at_tier = 0;
        Ok(())
    }

    fn recovery_context(&self, ctx: &FailureContext<'_>) -> RecoveryContext {
        RecoveryContext {
            phase_id: self.phase_id.clone(),
            working: ctx.working.clone(),
            attempts: ctx.attempts.to_vec(),
            previous_phases: ctx.previous_phases.to_vec(),
            models_tried: self
                .state
                .models_tried()
                .into_iter()
                .map(str::to_string)
                .collect(),
            project_dir: ctx.project_dir.to_path_buf(),
        }
    }

    async fn enter_autonomous(
        &mut self,
        ctx: &FailureContext<'_>,
        failure: String,
        cancel: CancellationToken,
    ) -> Result<EscalationDecision> {
        self.advance(Tier::Autonomous, &failure)?;

        let recovery = self.recovery_context(ctx);
        let plan = match self.advisor.advise(&recovery, cancel).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(phase = %self.phase_id, error = %format!("{:#}", e), "Recovery advisor failed");
                RecoveryPlan::unchanged(&format!("advisor failed: {:#}", e))
            }
        };

        if let Some(target) = plan
            .revert_to
            .clone()
            .filter(|t| ctx.previous_phases.contains(t))
        {
            let changes = vec![ConfigChange::PlanRevert {
                to_phase: target.clone(),
            }];
            self.record_autonomous(&plan, &changes)?;
            self.state.changes.extend(changes);
            return Ok(EscalationDecision::Revert { to_phase: target });
        }

        let mut config = ctx.working.clone();
        let mut changes = Vec::new();
        if let Some(model) = &plan.model
            && config.agent.model.as_ref() != Some(model)
        {
            changes.push(ConfigChange::ModelSwap {
                from: config.agent.model.clone(),
                to: model.clone(),
            });
            config.agent.model = Some(model.clone());
        }
        for hint in &plan.hints {
            if !config.agent.hints.contains(hint) {
                config.agent.hints.push(hint.clone());
                changes.push(ConfigChange::HintAdded { hint: hint.clone() });
            }
        }
        if let Some(criteria) = &plan.acceptance_criteria
            && *criteria != config.acceptance_criteria
        {
            changes.push(ConfigChange::CriteriaRefined {
                criteria: criteria.clone(),
            });
            config.acceptance_criteria = criteria.clone();
        }

        self.record_autonomous(&plan, &changes)?;
        self.artifacts.write_updated_config(&config)?;
        self.state.changes.extend(changes.iter().cloned());

        if changes.is_empty() {
            tracing::info!(phase = %self.phase_id, "No reconfiguration; continuing with unchanged config");
            Ok(EscalationDecision::Retry { feedback: failure })
        } else {
            Ok(EscalationDecision::Reconfigure { config, changes })
        }
    }

    fn record_autonomous(&self, plan: &RecoveryPlan, changes: &[ConfigChange]) -> Result<()> {
        self.artifacts.write_autonomous_decision(&AutonomousDecision {
            phase_id: self.phase_id.clone(),
            advisor: self.advisor.name().to_string(),
            plan: plan.clone(),
            changes: changes.to_vec(),
            created_at: Utc::now(),
        })?;
        Ok(())
    }

    fn enter_human(&mut self, ctx: &FailureContext<'_>, failure: String) -> Result<EscalationDecision> {
        self.advance(Tier::Human, &failure)?;
        let request = self.build_request(ctx, failure);
        let path = self.artifacts.write_human_request(&request)?;
        Ok(EscalationDecision::EscalateToHuman { request, path })
    }

    fn build_request(&self, ctx: &FailureContext<'_>, failure: String) -> HumanRequest {
        HumanRequest {
            phase_id: self.phase_id.clone(),
            total_attempts: self.state.total_attempts,
            last_failure: failure,
            attempts: ctx.attempts.to_vec(),
            interventions: self.state.changes.clone(),
            options: rank_options(&self.recovery_context(ctx), &self.fallback_models),
            created_at: Utc::now(),
        }
    }

    /// The outstanding request of a phase already in the human tier, as
    /// written before a restart. Rebuilt if the file went missing.
    pub fn pending_request(&self, ctx: &FailureContext<'_>) -> Result<EscalationDecision> {
        let path = self.artifacts.path(artifacts::HUMAN_REQUEST_FILE);
        let request = match self.artifacts.read_human_request()? {
            Some(request) => request,
            None => {
                let request = self.build_request(ctx, last_failure_of(ctx.attempts));
                self.artifacts.write_human_request(&request)?;
                request
            }
        };
        Ok(EscalationDecision::EscalateToHuman { request, path })
    }

    /// Turn an external decision into the runner's next step. Anything but
    /// abort resets the phase to the retry tier with zeroed counters.
    pub fn apply_human_decision(
        &mut self,
        decision: &HumanDecision,
        request: &HumanRequest,
        working: &WorkingConfig,
    ) -> Result<EscalationDecision, DecisionError> {
        let outcome = match decision {
            HumanDecision::ResumeWithOption { option } => {
                let chosen = request
                    .option(*option)
                    .ok_or(DecisionError::UnknownOption(*option))?;
                let resume = ConfigChange::HumanResume {
                    summary: chosen.description.clone(),
                };
                match &chosen.action {
                    RecoveryAction::RetryWithHints { hints } => {
                        let mut changes = vec![resume];
                        changes.extend(hints.iter().map(|h| ConfigChange::HintAdded { hint: h.clone() }));
                        EscalationDecision::Reconfigure {
                            config: override_config(working, None, hints),
                            changes,
                        }
                    }
                    RecoveryAction::SwitchModel { model } => EscalationDecision::Reconfigure {
                        config: override_config(working, Some(model), &[]),
                        changes: vec![
                            resume,
                            ConfigChange::ModelSwap {
                                from: working.agent.model.clone(),
                                to: model.clone(),
                            },
                        ],
                    },
                    RecoveryAction::RevertTo { phase } => EscalationDecision::Revert {
                        to_phase: phase.clone(),
                    },
                    RecoveryAction::AcceptOutput => EscalationDecision::Accept,
                    RecoveryAction::Abort => EscalationDecision::Abort {
                        reason: "human selected abort".to_string(),
                    },
                }
            }
            HumanDecision::ManualOverride {
                model,
                hints,
                accept_output,
            } => {
                if *accept_output {
                    EscalationDecision::Accept
                } else {
                    let mut changes = vec![ConfigChange::HumanResume {
                        summary: "manual override".to_string(),
                    }];
                    if let Some(model) = model {
                        changes.push(ConfigChange::ModelSwap {
                            from: working.agent.model.clone(),
                            to: model.clone(),
                        });
                    }
                    changes.extend(hints.iter().map(|h| ConfigChange::HintAdded { hint: h.clone() }));
                    EscalationDecision::Reconfigure {
                        config: override_config(working, model.as_deref(), hints),
                        changes,
                    }
                }
            }
            HumanDecision::Abort { reason } => EscalationDecision::Abort {
                reason: reason.clone().unwrap_or_else(|| "aborted by human".to_string()),
            },
        };

        if let Err(e) = self.artifacts.archive_human_request() {
            tracing::warn!(error = %format!("{:#}", e), "Failed to archive human request");
        }

        if !matches!(outcome, EscalationDecision::Abort { .. }) {
            self.state.tier = Tier::Retry;
            self.state.attempts_at_tier = 0;
            self.state.total_attempts = 0;
            match &outcome {
                EscalationDecision::Reconfigure { changes, .. } => {
                    self.state.changes.extend(changes.iter().cloned());
                }
                EscalationDecision::Revert { to_phase } => {
                    self.state.changes.push(ConfigChange::PlanRevert {
                        to_phase: to_phase.clone(),
                    });
                }
                _ => {}
            }
            tracing::info!(phase = %self.phase_id, "Resuming at retry tier after human decision");
        }

        Ok(outcome)
    }
}
