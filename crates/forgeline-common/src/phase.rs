//! Phase definitions as declared in the project file.

use serde::{Deserialize, Serialize};

/// One unit of pipeline work. Loaded once from the project file and never
/// mutated; escalation works on a [`WorkingConfig`] copy instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    /// Free-form phase kind ("design", "implement", ...). Opaque to the engine.
    #[serde(default, rename = "type")]
    pub phase_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Instruction text handed to the agent, or a path (relative to the
    /// project root) of a file holding it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Glob patterns the phase must produce.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeConfig>,
    #[serde(default)]
    pub policy: PolicyOverrides,
    /// When set, a completed phase may emit `generated-phases.json` in its
    /// phase directory and those phases are appended to the run.
    #[serde(default)]
    pub generates_phases: bool,
}

impl PhaseDefinition {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            phase_type: String::new(),
            name: None,
            depends_on: Vec::new(),
            instructions: None,
            agent: AgentConfig::default(),
            expected_outputs: Vec::new(),
            gate: None,
            acceptance_criteria: Vec::new(),
            judge: None,
            policy: PolicyOverrides::default(),
            generates_phases: false,
        }
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.expected_outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_gate(mut self, gate: GateSpec) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_dependency(mut self, id: &str) -> Self {
        self.depends_on.push(id.to_string());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn judge_enabled(&self) -> bool {
        self.judge.as_ref().is_some_and(|j| j.enabled)
    }

    /// The configuration the first attempt runs with.
    pub fn initial_working_config(&self) -> WorkingConfig {
        WorkingConfig {
            agent: self.agent.clone(),
            acceptance_criteria: self.acceptance_criteria.clone(),
        }
    }
}

/// Agent settings for a phase. The engine only reads `model` and `hints`;
/// everything else is passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_judge_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_judge_enabled() -> bool {
    true
}

/// Per-phase overrides of the execution policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// The mutable copy of a phase's configuration that escalation rewrites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// Declarative quality gate attached to a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GateSpec {
    /// Every listed glob must match at least one file.
    FilesExist { files: Vec<String> },
    /// Every file matched by the globs must parse. With no globs, the
    /// phase's expected outputs are checked.
    SyntaxValid {
        #[serde(default)]
        files: Vec<String>,
    },
    /// Reads a JSON test report and judges it, against the baseline when
    /// one was captured.
    TestsPass {
        #[serde(default = "default_test_report")]
        report: String,
    },
    /// Reads an approval artifact written by some outside reviewer.
    ExternalApproval {
        #[serde(default = "default_approval_artifact")]
        artifact: String,
    },
    /// Ordered sub-gates, stopping at the first failure.
    Compound {
        #[serde(default)]
        name: String,
        gates: Vec<GateSpec>,
    },
}

pub fn default_test_report() -> String {
    "test-results.json".to_string()
}

fn default_approval_artifact() -> String {
    "approval.json".to_string()
}

impl GateSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            GateSpec::FilesExist { .. } => "files-exist",
            GateSpec::SyntaxValid { .. } => "syntax-valid",
            GateSpec::TestsPass { .. } => "tests-pass",
            GateSpec::ExternalApproval { .. } => "external-approval",
            GateSpec::Compound { .. } => "compound",
        }
    }

    /// Whether evaluating this gate reads a test report.
    pub fn reads_test_report(&self) -> bool {
        match self {
            GateSpec::TestsPass { .. } => true,
            GateSpec::Compound { gates, .. } => gates.iter().any(GateSpec::reads_test_report),
            _ => false,
        }
    }
}
