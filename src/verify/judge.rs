//! The independent judge: a second, cheaper agent call that compares a
//! phase's output with its acceptance criteria.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::executor::{AgentExecutor, ExecutionRequest};
use crate::util::extract_json_object;

/// Per-file cap on content included in the judge prompt.
const MAX_FILE_CHARS: usize = 12_000;

#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub phase_id: String,
    pub acceptance_criteria: Vec<String>,
    pub files: Vec<PathBuf>,
    pub working_dir: PathBuf,
    pub model: Option<String>,
}

/// Structured verdict returned by a judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub pass: bool,
    #[serde(default)]
    pub defects: Vec<String>,
    #[serde(default)]
    pub correction: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl JudgeVerdict {
    pub fn pass(confidence: f64) -> Self {
        Self {
            pass: true,
            defects: Vec::new(),
            correction: None,
            confidence,
        }
    }

    pub fn fail(defects: &[&str], correction: Option<&str>) -> Self {
        Self {
            pass: false,
            defects: defects.iter().map(|d| d.to_string()).collect(),
            correction: correction.map(str::to_string),
            confidence: 0.9,
        }
    }

    /// Markdown written to the phase feedback file on a failing verdict.
    pub fn feedback(&self) -> String {
        let mut text = String::from("The reviewer found these defects:\n");
        for defect in &self.defects {
            text.push_str(&format!("- {}\n", defect));
        }
        if let Some(correction) = &self.correction {
            text.push_str(&format!("\nSuggested correction: {}\n", correction));
        }
        text
    }

    pub fn summary(&self) -> String {
        if self.pass {
            "acceptance criteria met".to_string()
        } else if self.defects.is_empty() {
            "acceptance criteria not met".to_string()
        } else {
            self.defects.join("; ")
        }
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: JudgeRequest, cancel: CancellationToken) -> Result<JudgeVerdict>;
}

/// Judge backed by an [`AgentExecutor`] call that must answer with JSON.
pub struct AgentJudge {
    executor: Arc<dyn AgentExecutor>,
    default_model: Option<String>,
}

impl AgentJudge {
    pub fn new(executor: Arc<dyn AgentExecutor>, default_model: Option<String>) -> Self {
        Self {
            executor,
            default_model,
        }
    }
}

#[async_trait]
impl Judge for AgentJudge {
    async fn judge(&self, request: JudgeRequest, cancel: CancellationToken) -> Result<JudgeVerdict> {
        let prompt = build_judge_prompt(&request);
        let outcome = self
            .executor
            .execute(
                ExecutionRequest {
                    phase_id: format!("{}-judge", request.phase_id),
                    attempt: 1,
                    working_dir: request.working_dir.clone(),
                    instructions: prompt,
                    model: request.model.clone().or_else(|| self.default_model.clone()),
                },
                cancel,
            )
            .await
            .context("Judge invocation failed")?;

        if !outcome.success {
            bail!("Judge exited unsuccessfully: {}", crate::util::tail(&outcome.output, 500));
        }
        parse_verdict(&outcome.output)
    }
}

pub fn build_judge_prompt(request: &JudgeRequest) -> String {
    let criteria = if request.acceptance_criteria.is_empty() {
        "- The output fully accomplishes the phase's purpose.".to_string()
    } else {
        request
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut files = String::new();
    for path in &request.files {
        files.push_str(&render_file(path, &request.working_dir));
    }

    format!(
        r#"# Output Review

You are reviewing the output of phase `{phase}`. Do not modify any files.

## Acceptance Criteria
{criteria}

## Output Files
{files}
## Response Format
Answer with a single JSON object and nothing else:
```json
{{"pass": true, "defects": ["specific defect"], "correction": "what to change", "confidence": 0.8}}
```
"#,
        phase = request.phase_id,
    )
}

fn render_file(path: &Path, working_dir: &Path) -> String {
    let display = path.strip_prefix(working_dir).unwrap_or(path).display();
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let truncated: String = content.chars().take(MAX_FILE_CHARS).collect();
            let marker = if truncated.len() < content.len() {
                "\n[truncated]"
            } else {
                ""
            };
            format!("### {}\n```\n{}{}\n```\n\n", display, truncated, marker)
        }
        Err(_) => format!("### {}\n(binary or unreadable)\n\n", display),
    }
}

pub fn parse_verdict(response: &str) -> Result<JudgeVerdict> {
    let json = extract_json_object(response).context("Judge response contained no JSON object")?;
    let mut verdict: JudgeVerdict =
        serde_json::from_str(&json).context("Judge response JSON did not match the verdict shape")?;
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}
