//! Configuration for forgeline, read from `.forgeline/forgeline.toml`.
//!
//! Layered: file, then `FORGELINE_*` environment variables, then CLI flags,
//! then the per-phase `policy` block in the project file.
//!
//! ```toml
//! [agent]
//! command = "claude"
//! args = ["--print", "--dangerously-skip-permissions"]
//! model = "sonnet"
//! judge_model = "haiku"
//!
//! [execution]
//! max_retries = 3
//! transient_retries = 2
//! phase_timeout_secs = 600
//! heartbeat_secs = 15
//!
//! [baseline]
//! enabled = true
//! command = "cargo test --no-fail-fast -- -Z unstable-options --format json > test-results.json"
//! report = "test-results.json"
//!
//! [escalation]
//! advisor = "agent"
//! fallback_models = ["opus"]
//! human_wait = "wait"
//!
//! [phases.overrides."impl-*"]
//! max_retries = 5
//! phase_timeout_secs = 1800
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use forgeline_common::PhaseDefinition;

pub const STATE_DIR: &str = ".forgeline";

/// Where everything lives under a project's state directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            state_dir: project_dir.join(STATE_DIR),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("forgeline.toml")
    }

    pub fn status_file(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    pub fn baseline_file(&self) -> PathBuf {
        self.state_dir.join("baseline.json")
    }

    pub fn phases_dir(&self) -> PathBuf {
        self.state_dir.join("phases")
    }

    pub fn phase_dir(&self, phase_id: &str) -> PathBuf {
        self.phases_dir().join(phase_id)
    }

    /// Per-phase artifacts of earlier runs, one directory per run id.
    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn escalation_dir(&self, phase_id: &str) -> PathBuf {
        self.phase_dir(phase_id).join("escalation")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Model for the independent judge. Falls back to `model`.
    #[serde(default)]
    pub judge_model: Option<String>,
    /// Model for the autonomous recovery advisor. Falls back to `model`.
    #[serde(default)]
    pub advisor_model: Option<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            model: None,
            judge_model: None,
            advisor_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Attempts per escalation tier.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Transient-error retries inside one attempt.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_reverts")]
    pub max_reverts: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_transient_retries() -> u32 {
    2
}

fn default_phase_timeout_secs() -> u64 {
    600
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_backoff_cap_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_max_reverts() -> u32 {
    2
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            transient_retries: default_transient_retries(),
            phase_timeout_secs: default_phase_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_secs: default_backoff_cap_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            max_reverts: default_max_reverts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineSection {
    #[serde(default = "default_baseline_enabled")]
    pub enabled: bool,
    /// Shell command that runs the test suite and writes `report`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_report")]
    pub report: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Globs (relative to the project root) that identify test files.
    #[serde(default = "default_test_patterns")]
    pub test_patterns: Vec<String>,
}

fn default_baseline_enabled() -> bool {
    true
}

fn default_report() -> String {
    forgeline_common::phase::default_test_report()
}

fn default_command_timeout_secs() -> u64 {
    900
}

fn default_test_patterns() -> Vec<String> {
    vec![
        "tests/**/*".to_string(),
        "test/**/*".to_string(),
        "**/*_test.*".to_string(),
        "**/*.test.*".to_string(),
        "**/test_*.*".to_string(),
    ]
}

impl Default for BaselineSection {
    fn default() -> Self {
        Self {
            enabled: default_baseline_enabled(),
            command: None,
            report: default_report(),
            command_timeout_secs: default_command_timeout_secs(),
            test_patterns: default_test_patterns(),
        }
    }
}

/// Which recovery advisor the autonomous tier consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisorMode {
    /// No intervention; the tier re-runs the unchanged configuration.
    None,
    /// Next fallback model plus a hint built from the last failure.
    #[default]
    Rules,
    /// Agent invocation, falling back to rules.
    Agent,
}

impl std::fmt::Display for AdvisorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdvisorMode::None => write!(f, "none"),
            AdvisorMode::Rules => write!(f, "rules"),
            AdvisorMode::Agent => write!(f, "agent"),
        }
    }
}

/// What the human tier does while no decision exists yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HumanWait {
    /// Poll for `human-decision.yaml` until it appears.
    #[default]
    Wait,
    /// Stop the run; resume later with `forgeline run --resume`.
    Halt,
}

impl std::fmt::Display for HumanWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HumanWait::Wait => write!(f, "wait"),
            HumanWait::Halt => write!(f, "halt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSection {
    #[serde(default)]
    pub advisor: AdvisorMode,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub human_wait: HumanWait,
    #[serde(default = "default_human_poll_secs")]
    pub human_poll_secs: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_human_poll_secs() -> u64 {
    5
}

fn default_confidence_threshold() -> f64 {
    0.6
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            advisor: AdvisorMode::default(),
            fallback_models: Vec::new(),
            human_wait: HumanWait::default(),
            human_poll_secs: default_human_poll_secs(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySection {
    /// Project-relative directories searched for expected outputs, after
    /// the phase's own output directory.
    #[serde(default = "default_search_dirs")]
    pub search_dirs: Vec<String>,
}

fn default_search_dirs() -> Vec<String> {
    vec![
        ".".to_string(),
        "output".to_string(),
        "docs".to_string(),
        "src".to_string(),
    ]
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            search_dirs: default_search_dirs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub transient_retries: Option<u32>,
    #[serde(default)]
    pub phase_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Glob pattern over phase ids to override settings.
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgelineToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub baseline: BaselineSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub verify: VerifySection,
    #[serde(default)]
    pub phases: PhasesConfig,
}

/// Exponential backoff between transient-error retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Backoff {
    /// Delay before the `retry`-th retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.base.saturating_mul(multiplier).min(self.cap)
    }
}

/// Effective execution policy for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePolicy {
    pub max_retries: u32,
    pub transient_retries: u32,
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl ForgelineToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forgeline.toml")
    }

    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("forgeline.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// File plus environment: the configuration every command starts from.
    pub fn resolve(paths: &ProjectPaths) -> Result<Self> {
        Ok(Self::load_or_default(&paths.state_dir)?.with_env_overrides())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize forgeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn with_env_overrides(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply `FORGELINE_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(cmd) = lookup("FORGELINE_AGENT_CMD").filter(|c| !c.trim().is_empty()) {
            self.agent.command = cmd;
        }
        if let Some(v) = parse_env::<u32>(&lookup, "FORGELINE_MAX_RETRIES") {
            self.execution.max_retries = v;
        }
        if let Some(v) = parse_env::<u64>(&lookup, "FORGELINE_PHASE_TIMEOUT") {
            self.execution.phase_timeout_secs = v;
        }
        if let Some(v) = parse_env::<u64>(&lookup, "FORGELINE_HEARTBEAT_SECS") {
            self.execution.heartbeat_secs = v;
        }
        if let Some(v) = lookup("FORGELINE_BASELINE") {
            match v.to_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => self.baseline.enabled = true,
                "0" | "false" | "off" | "no" => self.baseline.enabled = false,
                other => tracing::warn!(value = other, "Ignoring invalid FORGELINE_BASELINE"),
            }
        }
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.execution.heartbeat_secs.max(1))
    }

    pub fn phase_policy(&self, phase: &PhaseDefinition) -> PhasePolicy {
        let mut policy = PhasePolicy {
            max_retries: self.execution.max_retries,
            transient_retries: self.execution.transient_retries,
            timeout: Duration::from_secs(self.execution.phase_timeout_secs),
            backoff: Backoff {
                base: Duration::from_millis(self.execution.backoff_base_ms),
                factor: self.execution.backoff_factor,
                cap: Duration::from_secs(self.execution.backoff_cap_secs),
            },
        };

        for (pattern, override_cfg) in &self.phases.overrides {
            if pattern_matches(pattern, &phase.id) {
                if let Some(v) = override_cfg.max_retries {
                    policy.max_retries = v;
                }
                if let Some(v) = override_cfg.transient_retries {
                    policy.transient_retries = v;
                }
                if let Some(v) = override_cfg.phase_timeout_secs {
                    policy.timeout = Duration::from_secs(v);
                }
            }
        }

        if let Some(v) = phase.policy.max_retries {
            policy.max_retries = v;
        }
        if let Some(v) = phase.policy.transient_retries {
            policy.transient_retries = v;
        }
        if let Some(v) = phase.policy.timeout_secs {
            policy.timeout = Duration::from_secs(v);
        }

        policy.max_retries = policy.max_retries.max(1);
        policy
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.execution.max_retries == 0 {
            warnings.push("execution.max_retries = 0 is treated as 1".to_string());
        }
        if self.execution.phase_timeout_secs == 0 {
            warnings.push("execution.phase_timeout_secs = 0 times out every attempt".to_string());
        }
        if self.execution.backoff_factor == 0 {
            warnings.push("execution.backoff_factor = 0 is treated as 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.escalation.confidence_threshold) {
            warnings.push(format!(
                "escalation.confidence_threshold {} is outside 0.0..=1.0",
                self.escalation.confidence_threshold
            ));
        }
        if self.agent.command.trim().is_empty() {
            warnings.push("agent.command is empty".to_string());
        }
        for pattern in self.phases.overrides.keys() {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid phase override pattern '{}'", pattern));
            }
        }
        for pattern in &self.baseline.test_patterns {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid baseline test pattern '{}'", pattern));
            }
        }

        warnings
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Case-insensitive glob match of a phase id against an override pattern.
pub fn pattern_matches(pattern: &str, phase_id: &str) -> bool {
    glob::Pattern::new(&pattern.to_lowercase())
        .map(|p| p.matches(&phase_id.to_lowercase()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ForgelineToml::default();
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.execution.transient_retries, 2);
        assert_eq!(config.execution.phase_timeout_secs, 600);
        assert_eq!(config.execution.heartbeat_secs, 15);
        assert!(config.baseline.enabled);
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.escalation.advisor, AdvisorMode::Rules);
        assert_eq!(config.escalation.human_wait, HumanWait::Wait);
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = ForgelineToml::parse(
            r#"
[execution]
max_retries = 5

[escalation]
advisor = "none"
human_wait = "halt"
"#,
        )
        .unwrap();
        assert_eq!(config.execution.max_retries, 5);
        assert_eq!(config.execution.transient_retries, 2);
        assert_eq!(config.escalation.advisor, AdvisorMode::None);
        assert_eq!(config.escalation.human_wait, HumanWait::Halt);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForgelineToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.execution.max_retries, 3);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forgeline.toml");
        let mut config = ForgelineToml::default();
        config.escalation.fallback_models = vec!["opus".to_string()];
        config.save(&path).unwrap();
        let loaded = ForgelineToml::load(&path).unwrap();
        assert_eq!(loaded.escalation.fallback_models, vec!["opus"]);
    }

    #[test]
    fn test_env_overrides() {
        let config = ForgelineToml::default().apply_env(env(&[
            ("FORGELINE_AGENT_CMD", "my-agent"),
            ("FORGELINE_MAX_RETRIES", "4"),
            ("FORGELINE_PHASE_TIMEOUT", "30"),
            ("FORGELINE_HEARTBEAT_SECS", "5"),
            ("FORGELINE_BASELINE", "off"),
        ]));
        assert_eq!(config.agent.command, "my-agent");
        assert_eq!(config.execution.max_retries, 4);
        assert_eq!(config.execution.phase_timeout_secs, 30);
        assert_eq!(config.execution.heartbeat_secs, 5);
        assert!(!config.baseline.enabled);
    }

    #[test]
    fn test_env_overrides_ignore_garbage() {
        let config =
            ForgelineToml::default().apply_env(env(&[("FORGELINE_MAX_RETRIES", "lots")]));
        assert_eq!(config.execution.max_retries, 3);
    }

    #[test]
    fn test_phase_policy_layering() {
        let mut config = ForgelineToml::parse(
            r#"
[phases.overrides."impl-*"]
max_retries = 5
phase_timeout_secs = 1800
"#,
        )
        .unwrap();
        config.execution.transient_retries = 1;

        let plain = PhaseDefinition::new("design");
        let policy = config.phase_policy(&plain);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.timeout, Duration::from_secs(600));

        let mut implement = PhaseDefinition::new("impl-api");
        let policy = config.phase_policy(&implement);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.transient_retries, 1);
        assert_eq!(policy.timeout, Duration::from_secs(1800));

        implement.policy.max_retries = Some(2);
        assert_eq!(config.phase_policy(&implement).max_retries, 2);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(6), Duration::from_secs(30));
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut config = ForgelineToml::default();
        assert!(config.validate().is_empty());
        config.escalation.confidence_threshold = 1.5;
        config
            .phases
            .overrides
            .insert("[bad".to_string(), PhaseOverride::default());
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_pattern_matches_case_insensitive() {
        assert!(pattern_matches("IMPL-*", "impl-api"));
        assert!(!pattern_matches("impl-*", "design"));
        assert!(!pattern_matches("[bad", "anything"));
    }

    #[test]
    fn test_project_paths_layout() {
        let paths = ProjectPaths::new(Path::new("/work/app"));
        assert_eq!(paths.status_file(), PathBuf::from("/work/app/.forgeline/status.json"));
        assert_eq!(
            paths.escalation_dir("design"),
            PathBuf::from("/work/app/.forgeline/phases/design/escalation")
        );
    }
}
