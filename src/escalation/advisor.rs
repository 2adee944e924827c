//! Recovery advisors for the autonomous escalation tier.
//!
//! An advisor sees the failure history of one phase and proposes what to
//! change before the next round of attempts: another model, extra hints,
//! refined acceptance criteria, or a revert to an earlier phase.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use forgeline_common::{AttemptRecord, WorkingConfig};

use crate::config::{AdvisorMode, ForgelineToml};
use crate::executor::{AgentExecutor, ExecutionRequest};
use crate::util::{extract_json_object, tail};

/// What an advisor is told about a failing phase.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub phase_id: String,
    pub working: WorkingConfig,
    pub attempts: Vec<AttemptRecord>,
    /// Phases completed before this one, oldest first. Revert targets.
    pub previous_phases: Vec<String>,
    pub models_tried: Vec<String>,
    pub project_dir: PathBuf,
}

impl RecoveryContext {
    pub fn last_failure(&self) -> String {
        self.attempts
            .last()
            .map(|a| a.gate.message.clone())
            .unwrap_or_else(|| "no attempts recorded".to_string())
    }
}

/// A proposed intervention. Empty fields mean "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl RecoveryPlan {
    pub fn unchanged(reasoning: &str) -> Self {
        Self {
            reasoning: reasoning.to_string(),
            confidence: 1.0,
            ..Default::default()
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.model.is_none()
            && self.revert_to.is_none()
            && self.hints.is_empty()
            && self.acceptance_criteria.is_none()
    }
}

#[async_trait]
pub trait RecoveryAdvisor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn advise(&self, context: &RecoveryContext, cancel: CancellationToken) -> Result<RecoveryPlan>;
}

/// Never intervenes. The autonomous tier then re-runs the unchanged
/// configuration for its budget and advances to the human tier.
pub struct NoopAdvisor;

#[async_trait]
impl RecoveryAdvisor for NoopAdvisor {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn advise(&self, _context: &RecoveryContext, _cancel: CancellationToken) -> Result<RecoveryPlan> {
        Ok(RecoveryPlan::unchanged("no recovery advisor configured"))
    }
}

/// Deterministic advisor: next untried fallback model plus a hint built
/// from the most recent failure.
pub struct RuleBasedAdvisor {
    fallback_models: Vec<String>,
}

impl RuleBasedAdvisor {
    pub fn new(fallback_models: Vec<String>) -> Self {
        Self { fallback_models }
    }

    pub fn next_model(&self, context: &RecoveryContext) -> Option<String> {
        next_untried_model(&self.fallback_models, context)
    }

    pub fn plan(&self, context: &RecoveryContext) -> RecoveryPlan {
        let model = self.next_model(context);
        let hint = format!(
            "Earlier attempts failed with: {}. Fix that before anything else.",
            tail(&context.last_failure(), 400)
        );
        let reasoning = match &model {
            Some(m) => format!("{} failed attempts; switching to {} with a failure hint", context.attempts.len(), m),
            None => format!("{} failed attempts; no untried fallback model, adding a failure hint", context.attempts.len()),
        };
        RecoveryPlan {
            model,
            revert_to: None,
            hints: vec![hint],
            acceptance_criteria: None,
            reasoning,
            confidence: 0.7,
        }
    }
}

#[async_trait]
impl RecoveryAdvisor for RuleBasedAdvisor {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn advise(&self, context: &RecoveryContext, _cancel: CancellationToken) -> Result<RecoveryPlan> {
        Ok(self.plan(context))
    }
}

/// First fallback model that is neither the current model nor already tried.
pub fn next_untried_model(fallback_models: &[String], context: &RecoveryContext) -> Option<String> {
    fallback_models
        .iter()
        .find(|m| {
            context.working.agent.model.as_deref() != Some(m.as_str())
                && !context.models_tried.iter().any(|t| t == *m)
        })
        .cloned()
}

/// Asks an agent for a structured plan. Errors, unparseable answers and
/// answers below the confidence threshold fall back to the rule-based plan.
pub struct AgentAdvisor {
    executor: Arc<dyn AgentExecutor>,
    model: Option<String>,
    confidence_threshold: f64,
    fallback: RuleBasedAdvisor,
}

impl AgentAdvisor {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        model: Option<String>,
        confidence_threshold: f64,
        fallback_models: Vec<String>,
    ) -> Self {
        Self {
            executor,
            model,
            confidence_threshold,
            fallback: RuleBasedAdvisor::new(fallback_models),
        }
    }

    async fn ask(&self, context: &RecoveryContext, cancel: CancellationToken) -> Result<RecoveryPlan> {
        let outcome = self
            .executor
            .execute(
                ExecutionRequest {
                    phase_id: format!("{}-advisor", context.phase_id),
                    attempt: 1,
                    working_dir: context.project_dir.clone(),
                    instructions: build_advisor_prompt(context),
                    model: self.model.clone(),
                },
                cancel,
            )
            .await
            .context("Advisor invocation failed")?;
        if !outcome.success {
            bail!("Advisor exited unsuccessfully: {}", tail(&outcome.output, 300));
        }
        let mut plan = parse_plan(&outcome.output)?;
        if let Some(target) = &plan.revert_to
            && !context.previous_phases.contains(target)
        {
            tracing::warn!(target = %target, "Advisor proposed revert to unknown phase; ignoring");
            plan.revert_to = None;
        }
        Ok(plan)
    }
}

#[async_trait]
impl RecoveryAdvisor for AgentAdvisor {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn advise(&self, context: &RecoveryContext, cancel: CancellationToken) -> Result<RecoveryPlan> {
        match self.ask(context, cancel).await {
            Ok(plan) if plan.confidence >= self.confidence_threshold => Ok(plan),
            Ok(plan) => {
                tracing::info!(
                    confidence = plan.confidence,
                    threshold = self.confidence_threshold,
                    "Advisor confidence below threshold; using rule-based plan"
                );
                Ok(self.fallback.plan(context))
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Advisor failed; using rule-based plan");
                Ok(self.fallback.plan(context))
            }
        }
    }
}

pub fn build_advisor_prompt(context: &RecoveryContext) -> String {
    let mut history = String::new();
    for record in &context.attempts {
        history.push_str(&format!(
            "- attempt {} ({} tier, model {}): {}\n",
            record.result.attempt,
            record.tier,
            record.result.model.as_deref().unwrap_or("default"),
            tail(&record.gate.message, 300)
        ));
    }
    let criteria = if context.working.acceptance_criteria.is_empty() {
        "(none declared)".to_string()
    } else {
        context.working.acceptance_criteria.join("; ")
    };
    let previous = if context.previous_phases.is_empty() {
        "(none)".to_string()
    } else {
        context.previous_phases.join(", ")
    };

    format!(
        r#"# Recovery Decision

Phase `{phase}` keeps failing its quality gate. Decide what to change before
the next attempts.

## Failure History
{history}
## Current Configuration
- Model: {model}
- Acceptance criteria: {criteria}
- Models already tried: {tried}
- Completed earlier phases (revert targets): {previous}

## Options
- `model`: switch to another model
- `hints`: extra instructions for the agent
- `acceptance_criteria`: replace the criteria if they are wrong or ambiguous
- `revert_to`: re-run from an earlier phase whose output caused this failure

## Response Format
Answer with a single JSON object:
```json
{{"model": null, "hints": [], "acceptance_criteria": null, "revert_to": null, "reasoning": "...", "confidence": 0.8}}
```
"#,
        phase = context.phase_id,
        model = context.working.agent.model.as_deref().unwrap_or("default"),
        tried = if context.models_tried.is_empty() {
            "(none)".to_string()
        } else {
            context.models_tried.join(", ")
        },
    )
}

pub fn parse_plan(response: &str) -> Result<RecoveryPlan> {
    let json = extract_json_object(response).context("Advisor response contained no JSON object")?;
    let mut plan: RecoveryPlan =
        serde_json::from_str(&json).context("Advisor response JSON did not match the plan shape")?;
    plan.confidence = plan.confidence.clamp(0.0, 1.0);
    Ok(plan)
}

/// Build the advisor selected in configuration.
pub fn advisor_from_config(config: &ForgelineToml, executor: Arc<dyn AgentExecutor>) -> Arc<dyn RecoveryAdvisor> {
    let fallback = config.escalation.fallback_models.clone();
    match config.escalation.advisor {
        AdvisorMode::None => Arc::new(NoopAdvisor),
        AdvisorMode::Rules => Arc::new(RuleBasedAdvisor::new(fallback)),
        AdvisorMode::Agent => Arc::new(AgentAdvisor::new(
            executor,
            config
                .agent
                .advisor_model
                .clone()
                .or_else(|| config.agent.model.clone()),
            config.escalation.confidence_threshold,
            fallback,
        )),
    }
}
