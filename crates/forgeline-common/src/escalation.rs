//! Escalation tiers, per-phase escalation state and the human decision package.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::result::AttemptRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Retry,
    Autonomous,
    Human,
}

impl Tier {
    /// The tier a phase moves to once this tier's budget is spent.
    pub fn next(self) -> Tier {
        match self {
            Tier::Retry => Tier::Autonomous,
            Tier::Autonomous | Tier::Human => Tier::Human,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Retry => "retry",
            Tier::Autonomous => "autonomous",
            Tier::Human => "human",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid tier '{0}'. Valid values: retry, autonomous, human")]
pub struct ParseTierError(String);

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "retry" => Ok(Tier::Retry),
            "autonomous" => Ok(Tier::Autonomous),
            "human" => Ok(Tier::Human),
            _ => Err(ParseTierError(s.to_string())),
        }
    }
}

/// A configuration change applied to a phase during escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigChange {
    ModelSwap {
        #[serde(default)]
        from: Option<String>,
        to: String,
    },
    PlanRevert { to_phase: String },
    HintAdded { hint: String },
    CriteriaRefined { criteria: Vec<String> },
    HumanResume { summary: String },
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigChange::ModelSwap { from, to } => write!(
                f,
                "model {} -> {}",
                from.as_deref().unwrap_or("default"),
                to
            ),
            ConfigChange::PlanRevert { to_phase } => write!(f, "revert to {}", to_phase),
            ConfigChange::HintAdded { hint } => write!(f, "hint: {}", hint),
            ConfigChange::CriteriaRefined { criteria } => {
                write!(f, "criteria refined ({} items)", criteria.len())
            }
            ConfigChange::HumanResume { summary } => write!(f, "human: {}", summary),
        }
    }
}

/// Per-phase escalation bookkeeping. Persisted in the status record so a
/// restarted process picks up at the same tier and count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationState {
    pub tier: Tier,
    pub attempts_at_tier: u32,
    pub total_attempts: u32,
    #[serde(default)]
    pub changes: Vec<ConfigChange>,
}

impl EscalationState {
    /// Models already tried through a swap, in order.
    pub fn models_tried(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter_map(|c| match c {
                ConfigChange::ModelSwap { to, .. } => Some(to.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A concrete recovery step offered to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RecoveryAction {
    RetryWithHints { hints: Vec<String> },
    SwitchModel { model: String },
    RevertTo { phase: String },
    AcceptOutput,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanOption {
    /// 1-based; lower is recommended first.
    pub rank: u32,
    #[serde(flatten)]
    pub action: RecoveryAction,
    pub description: String,
}

/// The decision package written when a phase reaches the human tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanRequest {
    pub phase_id: String,
    pub total_attempts: u32,
    pub last_failure: String,
    pub attempts: Vec<AttemptRecord>,
    /// Interventions the autonomous tier already tried.
    pub interventions: Vec<ConfigChange>,
    pub options: Vec<HumanOption>,
    pub created_at: DateTime<Utc>,
}

impl HumanRequest {
    pub fn option(&self, rank: u32) -> Option<&HumanOption> {
        self.options.iter().find(|o| o.rank == rank)
    }
}

/// The externally supplied answer to a [`HumanRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum HumanDecision {
    ResumeWithOption {
        option: u32,
    },
    ManualOverride {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        hints: Vec<String>,
        #[serde(default)]
        accept_output: bool,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_progression_is_monotonic() {
        assert_eq!(Tier::Retry.next(), Tier::Autonomous);
        assert_eq!(Tier::Autonomous.next(), Tier::Human);
        assert_eq!(Tier::Human.next(), Tier::Human);
        assert!(Tier::Retry < Tier::Autonomous && Tier::Autonomous < Tier::Human);
    }

    #[test]
    fn test_tier_from_str() {
        assert_eq!("AUTONOMOUS".parse::<Tier>().unwrap(), Tier::Autonomous);
        assert!("later".parse::<Tier>().is_err());
    }

    #[test]
    fn test_human_decision_yaml_forms() {
        let resume: HumanDecision =
            serde_yaml::from_str("decision: resume-with-option\noption: 2\n").unwrap();
        assert_eq!(resume, HumanDecision::ResumeWithOption { option: 2 });

        let manual: HumanDecision = serde_yaml::from_str(
            "decision: manual-override\nmodel: opus\nhints:\n  - keep the API stable\n",
        )
        .unwrap();
        assert_eq!(
            manual,
            HumanDecision::ManualOverride {
                model: Some("opus".to_string()),
                hints: vec!["keep the API stable".to_string()],
                accept_output: false,
            }
        );

        let abort: HumanDecision = serde_yaml::from_str("decision: abort\n").unwrap();
        assert_eq!(abort, HumanDecision::Abort { reason: None });
    }

    #[test]
    fn test_human_option_flattens_action() {
        let option = HumanOption {
            rank: 1,
            action: RecoveryAction::SwitchModel {
                model: "opus".to_string(),
            },
            description: "Switch to opus".to_string(),
        };
        let json = serde_json::to_value(&option).unwrap();
        assert_eq!(json["action"], "switch-model");
        assert_eq!(json["model"], "opus");
        assert_eq!(json["rank"], 1);
    }

    #[test]
    fn test_models_tried_reads_swaps_only() {
        let state = EscalationState {
            changes: vec![
                ConfigChange::HintAdded {
                    hint: "x".to_string(),
                },
                ConfigChange::ModelSwap {
                    from: None,
                    to: "opus".to_string(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(state.models_tried(), vec!["opus"]);
    }
}
