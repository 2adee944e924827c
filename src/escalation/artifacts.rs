//! YAML escalation artifacts, one directory per phase.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};

use forgeline_common::{ConfigChange, HumanRequest, Tier, WorkingConfig};

use super::advisor::RecoveryPlan;
use crate::util::write_atomic;

pub const TRIGGER_FILE: &str = "trigger.yaml";
pub const AUTONOMOUS_DECISION_FILE: &str = "autonomous-decision.yaml";
pub const UPDATED_CONFIG_FILE: &str = "updated-config.yaml";
pub const HUMAN_REQUEST_FILE: &str = "human-request.yaml";
pub const HUMAN_DECISION_FILE: &str = "human-decision.yaml";

/// Why escalation fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub phase_id: String,
    pub from: Tier,
    pub to: Tier,
    pub attempts_at_tier: u32,
    pub total_attempts: u32,
    pub last_failure: String,
    pub created_at: DateTime<Utc>,
}

/// What the autonomous tier decided and who decided it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomousDecision {
    pub phase_id: String,
    pub advisor: String,
    pub plan: RecoveryPlan,
    pub changes: Vec<ConfigChange>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EscalationArtifacts {
    dir: PathBuf,
}

impl EscalationArtifacts {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write_trigger(&self, trigger: &Trigger) -> Result<PathBuf> {
        self.write(TRIGGER_FILE, trigger)
    }

    pub fn write_autonomous_decision(&self, decision: &AutonomousDecision) -> Result<PathBuf> {
        self.write(AUTONOMOUS_DECISION_FILE, decision)
    }

    pub fn write_updated_config(&self, config: &WorkingConfig) -> Result<PathBuf> {
        self.write(UPDATED_CONFIG_FILE, config)
    }

    pub fn write_human_request(&self, request: &HumanRequest) -> Result<PathBuf> {
        self.write(HUMAN_REQUEST_FILE, request)
    }

    pub fn read_human_request(&self) -> Result<Option<HumanRequest>> {
        self.read(HUMAN_REQUEST_FILE)
    }

    /// Move a resolved human request aside so the phase no longer reads as
    /// awaiting a decision.
    pub fn archive_human_request(&self) -> Result<()> {
        let path = self.path(HUMAN_REQUEST_FILE);
        if !path.exists() {
            return Ok(());
        }
        let archived = self.path(&format!(
            "human-request.{}.resolved.yaml",
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        ));
        std::fs::rename(&path, &archived)
            .with_context(|| format!("Failed to archive {}", path.display()))
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.path(name);
        let yaml = serde_yaml::to_string(value)
            .with_context(|| format!("Failed to serialize {}", name))?;
        write_atomic(&path, yaml.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }
}
