//! Project file loading and phase ordering.
//!
//! The project file is `.forgeline/project.yaml` (or `.yml` / `.json`). It
//! lists phases; unknown fields anywhere in it are ignored so older binaries
//! keep reading newer files.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use forgeline_common::PhaseDefinition;

use crate::errors::ProjectError;

const PROJECT_FILE_NAMES: &[&str] = &["project.yaml", "project.yml", "project.json"];
const GENERATED_FILE_NAMES: &[&str] = &[
    "generated-phases.json",
    "generated-phases.yaml",
    "generated-phases.yml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,
}

/// A generated-phases file is either a bare list or `{ phases: [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum GeneratedPhases {
    List(Vec<PhaseDefinition>),
    Wrapped { phases: Vec<PhaseDefinition> },
}

impl ProjectFile {
    /// Find the project file inside a state directory.
    pub fn locate(state_dir: &Path) -> Result<PathBuf, ProjectError> {
        PROJECT_FILE_NAMES
            .iter()
            .map(|name| state_dir.join(name))
            .find(|p| p.exists())
            .ok_or_else(|| ProjectError::NotFound {
                dir: state_dir.to_path_buf(),
            })
    }

    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let content = std::fs::read_to_string(path).map_err(|source| ProjectError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, FileFormat::from_path(path)).map_err(|message| ProjectError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(content: &str, format: FileFormat) -> Result<Self, String> {
        match format {
            FileFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            FileFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        }
    }

    /// Validate ids and dependencies and return phases in execution order.
    pub fn execution_order(&self) -> Result<Vec<PhaseDefinition>, ProjectError> {
        if self.phases.is_empty() {
            return Err(ProjectError::Empty);
        }
        order_phases(&self.phases, &HashSet::new())
    }
}

/// Order `phases` so every phase follows its dependencies, keeping declared
/// order wherever dependencies allow it. Ids in `satisfied` count as already
/// done and must not be redefined.
pub fn order_phases(
    phases: &[PhaseDefinition],
    satisfied: &HashSet<String>,
) -> Result<Vec<PhaseDefinition>, ProjectError> {
    let mut ids: HashSet<&str> = HashSet::new();
    for phase in phases {
        if satisfied.contains(&phase.id) || !ids.insert(phase.id.as_str()) {
            return Err(ProjectError::DuplicatePhase {
                id: phase.id.clone(),
            });
        }
    }
    for phase in phases {
        for dep in &phase.depends_on {
            if !ids.contains(dep.as_str()) && !satisfied.contains(dep) {
                return Err(ProjectError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut placed: HashSet<String> = satisfied.clone();
    let mut remaining: Vec<&PhaseDefinition> = phases.iter().collect();
    let mut ordered = Vec::with_capacity(phases.len());

    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|p| p.depends_on.iter().all(|d| placed.contains(d)));
        match ready {
            Some(idx) => {
                let phase = remaining.remove(idx);
                placed.insert(phase.id.clone());
                ordered.push(phase.clone());
            }
            None => {
                return Err(ProjectError::Cycle {
                    phases: remaining.iter().map(|p| p.id.clone()).collect(),
                });
            }
        }
    }

    Ok(ordered)
}

/// Read phases a completed phase generated, if it wrote any.
pub fn load_generated(phase_dir: &Path) -> anyhow::Result<Option<Vec<PhaseDefinition>>> {
    let Some(path) = GENERATED_FILE_NAMES
        .iter()
        .map(|name| phase_dir.join(name))
        .find(|p| p.exists())
    else {
        return Ok(None);
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read generated phases: {}", path.display()))?;
    let parsed: GeneratedPhases = match FileFormat::from_path(&path) {
        FileFormat::Json => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse generated phases: {}", path.display()))?,
        FileFormat::Yaml => serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse generated phases: {}", path.display()))?,
    };

    Ok(Some(match parsed {
        GeneratedPhases::List(phases) => phases,
        GeneratedPhases::Wrapped { phases } => phases,
    }))
}

/// SHA-256 of the project file, used to notice edits between run and resume.
pub fn project_hash(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read project file: {}", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Instruction text for a phase. A value naming an existing file (relative
/// to the project root) is read from disk; anything else is used verbatim.
pub fn resolve_instructions(phase: &PhaseDefinition, project_dir: &Path) -> anyhow::Result<String> {
    match &phase.instructions {
        Some(value) => {
            let candidate = project_dir.join(value);
            if !value.contains('\n') && candidate.is_file() {
                std::fs::read_to_string(&candidate).with_context(|| {
                    format!("Failed to read instructions: {}", candidate.display())
                })
            } else {
                Ok(value.clone())
            }
        }
        None => {
            let mut text = format!("Complete phase '{}'.", phase.display_name());
            if !phase.expected_outputs.is_empty() {
                text.push_str(&format!(
                    "\nProduce these files: {}",
                    phase.expected_outputs.join(", ")
                ));
            }
            Ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ids(phases: &[PhaseDefinition]) -> Vec<&str> {
        phases.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_parse_yaml_project() {
        let yaml = r#"
name: demo
phases:
  - id: design
    type: doc
    expected_outputs: ["design.md"]
    gate: { type: files-exist, files: ["design.md"] }
  - id: build
    depends_on: [design]
    agent: { model: sonnet }
    policy: { max_retries: 2 }
"#;
        let project = ProjectFile::parse(yaml, FileFormat::Yaml).unwrap();
        assert_eq!(project.name.as_deref(), Some("demo"));
        assert_eq!(project.phases.len(), 2);
        assert_eq!(project.phases[1].agent.model.as_deref(), Some("sonnet"));
        assert_eq!(project.phases[1].policy.max_retries, Some(2));
    }

    #[test]
    fn test_parse_json_project_ignores_unknown_fields() {
        let json = r#"{"version": 7, "phases": [{"id": "a", "color": "blue"}]}"#;
        let project = ProjectFile::parse(json, FileFormat::Json).unwrap();
        assert_eq!(ids(&project.phases), vec!["a"]);
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let project = ProjectFile {
            name: None,
            phases: vec![
                PhaseDefinition::new("c").with_dependency("b"),
                PhaseDefinition::new("a"),
                PhaseDefinition::new("b").with_dependency("a"),
                PhaseDefinition::new("d"),
            ],
        };
        let order = project.execution_order().unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_execution_order_keeps_declared_order_without_deps() {
        let project = ProjectFile {
            name: None,
            phases: vec![PhaseDefinition::new("z"), PhaseDefinition::new("a")],
        };
        assert_eq!(ids(&project.execution_order().unwrap()), vec!["z", "a"]);
    }

    #[test]
    fn test_execution_order_detects_cycle() {
        let project = ProjectFile {
            name: None,
            phases: vec![
                PhaseDefinition::new("a").with_dependency("b"),
                PhaseDefinition::new("b").with_dependency("a"),
                PhaseDefinition::new("c"),
            ],
        };
        match project.execution_order() {
            Err(ProjectError::Cycle { phases }) => assert_eq!(phases, vec!["a", "b"]),
            other => panic!("Expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_execution_order_rejects_unknown_dependency_and_duplicates() {
        let unknown = ProjectFile {
            name: None,
            phases: vec![PhaseDefinition::new("a").with_dependency("ghost")],
        };
        assert!(matches!(
            unknown.execution_order(),
            Err(ProjectError::UnknownDependency { .. })
        ));

        let duplicate = ProjectFile {
            name: None,
            phases: vec![PhaseDefinition::new("a"), PhaseDefinition::new("a")],
        };
        assert!(matches!(
            duplicate.execution_order(),
            Err(ProjectError::DuplicatePhase { .. })
        ));

        let empty = ProjectFile {
            name: None,
            phases: vec![],
        };
        assert!(matches!(empty.execution_order(), Err(ProjectError::Empty)));
    }

    #[test]
    fn test_order_generated_phases_against_known() {
        let known: HashSet<String> = ["design".to_string()].into_iter().collect();
        let generated = vec![
            PhaseDefinition::new("impl-2").with_dependency("impl-1"),
            PhaseDefinition::new("impl-1").with_dependency("design"),
        ];
        let order = order_phases(&generated, &known).unwrap();
        assert_eq!(ids(&order), vec!["impl-1", "impl-2"]);

        let clash = vec![PhaseDefinition::new("design")];
        assert!(matches!(
            order_phases(&clash, &known),
            Err(ProjectError::DuplicatePhase { .. })
        ));
    }

    #[test]
    fn test_locate_and_load() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ProjectFile::locate(dir.path()),
            Err(ProjectError::NotFound { .. })
        ));
        std::fs::write(dir.path().join("project.yml"), "phases:\n  - id: only\n").unwrap();
        let path = ProjectFile::locate(dir.path()).unwrap();
        let project = ProjectFile::load(&path).unwrap();
        assert_eq!(ids(&project.phases), vec!["only"]);
    }

    #[test]
    fn test_load_reports_parse_error_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("project.json");
        std::fs::write(&path, "{ not json").unwrap();
        match ProjectFile::load(&path) {
            Err(ProjectError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_generated_accepts_list_and_wrapped() {
        let dir = tempdir().unwrap();
        assert!(load_generated(dir.path()).unwrap().is_none());

        std::fs::write(
            dir.path().join("generated-phases.json"),
            r#"[{"id": "g1"}, {"id": "g2"}]"#,
        )
        .unwrap();
        let phases = load_generated(dir.path()).unwrap().unwrap();
        assert_eq!(ids(&phases), vec!["g1", "g2"]);

        let other = tempdir().unwrap();
        std::fs::write(
            other.path().join("generated-phases.yaml"),
            "phases:\n  - id: g3\n",
        )
        .unwrap();
        let phases = load_generated(other.path()).unwrap().unwrap();
        assert_eq!(ids(&phases), vec!["g3"]);
    }

    #[test]
    fn test_project_hash_changes_with_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("project.yaml");
        std::fs::write(&path, "phases: []").unwrap();
        let first = project_hash(&path).unwrap();
        assert_eq!(first.len(), 64);
        std::fs::write(&path, "phases: [{id: a}]").unwrap();
        assert_ne!(first, project_hash(&path).unwrap());
    }

    #[test]
    fn test_resolve_instructions_reads_file_or_literal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("steps.md"), "Write the design.").unwrap();

        let mut phase = PhaseDefinition::new("design");
        phase.instructions = Some("steps.md".to_string());
        assert_eq!(resolve_instructions(&phase, dir.path()).unwrap(), "Write the design.");

        phase.instructions = Some("Just do it".to_string());
        assert_eq!(resolve_instructions(&phase, dir.path()).unwrap(), "Just do it");

        phase.instructions = None;
        phase.expected_outputs = vec!["design.md".to_string()];
        let text = resolve_instructions(&phase, dir.path()).unwrap();
        assert!(text.contains("design.md"));
    }
}
