//! Human decision delivery: `forgeline decide`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use forgeline::config::ProjectPaths;
use forgeline::escalation::human::submit_decision;
use forgeline_common::HumanDecision;

/// Build a decision from the `decide` flags. Exactly one of `--option`,
/// `--override` or `--abort` must be given.
pub fn decision_from_args(
    option: Option<u32>,
    manual: bool,
    model: Option<String>,
    hints: Vec<String>,
    accept: bool,
    abort: bool,
    reason: Option<String>,
) -> Result<HumanDecision> {
    match (option, manual, abort) {
        (Some(option), false, false) => {
            if option == 0 {
                bail!("Options are numbered from 1");
            }
            Ok(HumanDecision::ResumeWithOption { option })
        }
        (None, true, false) => Ok(HumanDecision::ManualOverride {
            model,
            hints,
            accept_output: accept,
        }),
        (None, false, true) => Ok(HumanDecision::Abort { reason }),
        (None, false, false) => bail!("Give one of --option N, --override or --abort"),
        _ => bail!("--option, --override and --abort are mutually exclusive"),
    }
}

pub fn cmd_decide(project_dir: &Path, phase: &str, decision: &HumanDecision) -> Result<()> {
    if phase.is_empty() || phase.contains('/') || phase.contains("..") {
        bail!("Invalid phase id: {}", phase);
    }
    let paths = ProjectPaths::new(project_dir);
    let path = submit_decision(&paths.escalation_dir(phase), decision)?;
    println!(
        "{} Decision recorded for phase {}: {}",
        style("✓").green().bold(),
        phase,
        path.display()
    );
    println!("  A waiting run picks it up on its next poll; a halted run needs `forgeline run --resume`.");
    Ok(())
}
