//! Human-in-the-loop decision delivery.
//!
//! A decision arrives as `human-decision.yaml` in the phase's escalation
//! directory, written by `forgeline decide` or the HTTP API. Waiting is a
//! timer-driven poll; nothing is held while no decision exists.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use forgeline_common::{
    AttemptRecord, HumanDecision, HumanOption, RecoveryAction, WorkingConfig,
};

use super::advisor::{RecoveryContext, next_untried_model};
use super::artifacts::{HUMAN_DECISION_FILE, HUMAN_REQUEST_FILE};
use crate::util::{tail, write_atomic};

#[derive(Debug, Clone, PartialEq)]
pub enum GateWait {
    Decision(HumanDecision),
    /// No decision yet and the gate does not wait.
    Halted,
    Cancelled,
}

#[async_trait]
pub trait HumanGate: Send + Sync {
    async fn wait(&self, escalation_dir: &Path, cancel: CancellationToken) -> Result<GateWait>;
}

/// Polls for the decision file until it appears.
pub struct FileDecisionPoller {
    poll_interval: Duration,
}

impl FileDecisionPoller {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

#[async_trait]
impl HumanGate for FileDecisionPoller {
    async fn wait(&self, escalation_dir: &Path, cancel: CancellationToken) -> Result<GateWait> {
        tracing::info!(dir = %escalation_dir.display(), "Waiting for human decision");
        loop {
            if let Some(decision) = take_decision(escalation_dir)? {
                return Ok(GateWait::Decision(decision));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(GateWait::Cancelled),
            }
        }
    }
}

/// Consumes a decision that is already present, otherwise halts the run.
pub struct HaltingGate;

#[async_trait]
impl HumanGate for HaltingGate {
    async fn wait(&self, escalation_dir: &Path, _cancel: CancellationToken) -> Result<GateWait> {
        Ok(match take_decision(escalation_dir)? {
            Some(decision) => GateWait::Decision(decision),
            None => GateWait::Halted,
        })
    }
}

/// Read and archive a pending decision. Unparseable files are renamed to
/// `*.rejected` so the next poll does not trip over them again.
pub fn take_decision(escalation_dir: &Path) -> Result<Option<HumanDecision>> {
    let path = escalation_dir.join(HUMAN_DECISION_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");

    match serde_yaml::from_str::<HumanDecision>(&content) {
        Ok(decision) => {
            let archived = escalation_dir.join(format!("human-decision.{}.yaml", stamp));
            std::fs::rename(&path, &archived)
                .with_context(|| format!("Failed to archive {}", path.display()))?;
            tracing::info!(decision = ?decision, "Human decision received");
            Ok(Some(decision))
        }
        Err(e) => {
            let rejected = escalation_dir.join(format!("human-decision.{}.rejected", stamp));
            tracing::warn!(error = %e, moved_to = %rejected.display(), "Rejecting unparseable human decision");
            std::fs::rename(&path, &rejected)
                .with_context(|| format!("Failed to move aside {}", path.display()))?;
            Ok(None)
        }
    }
}

/// Whether the phase has an outstanding human request.
pub fn awaiting_decision(escalation_dir: &Path) -> bool {
    escalation_dir.join(HUMAN_REQUEST_FILE).exists()
}

/// Deliver a decision for a phase that is waiting on one.
pub fn submit_decision(escalation_dir: &Path, decision: &HumanDecision) -> Result<PathBuf> {
    if !awaiting_decision(escalation_dir) {
        bail!(
            "No human request found in {}; the phase is not awaiting a decision",
            escalation_dir.display()
        );
    }
    let path = escalation_dir.join(HUMAN_DECISION_FILE);
    let yaml = serde_yaml::to_string(decision).context("Failed to serialize decision")?;
    write_atomic(&path, yaml.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Ranked recovery options offered in a human request: targeted retry,
/// untried model, revert, accept, abort.
pub fn rank_options(context: &RecoveryContext, fallback_models: &[String]) -> Vec<HumanOption> {
    let mut actions = vec![(
        RecoveryAction::RetryWithHints {
            hints: vec![format!(
                "Previous attempts failed with: {}",
                tail(&context.last_failure(), 400)
            )],
        },
        "Retry with the last failure added as an explicit hint".to_string(),
    )];
    if let Some(model) = next_untried_model(fallback_models, context) {
        actions.push((
            RecoveryAction::SwitchModel {
                model: model.clone(),
            },
            format!("Retry with model {}", model),
        ));
    }
    if let Some(previous) = context.previous_phases.last() {
        actions.push((
            RecoveryAction::RevertTo {
                phase: previous.clone(),
            },
            format!("Re-run from phase {} and continue", previous),
        ));
    }
    actions.push((
        RecoveryAction::AcceptOutput,
        "Accept the current output and mark the phase complete".to_string(),
    ));
    actions.push((RecoveryAction::Abort, "Abort the pipeline".to_string()));

    actions
        .into_iter()
        .enumerate()
        .map(|(i, (action, description))| HumanOption {
            rank: i as u32 + 1,
            action,
            description,
        })
        .collect()
}

/// Apply a human-chosen model and hints to a working configuration.
pub fn override_config(working: &WorkingConfig, model: Option<&str>, hints: &[String]) -> WorkingConfig {
    let mut config = working.clone();
    if let Some(model) = model {
        config.agent.model = Some(model.to_string());
    }
    config.agent.hints.extend(hints.iter().cloned());
    config
}

pub fn last_failure_of(attempts: &[AttemptRecord]) -> String {
    attempts
        .last()
        .map(|a| a.gate.message.clone())
        .unwrap_or_default()
}
