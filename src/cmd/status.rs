//! Read-only inspection: `forgeline status` and `forgeline validate`.

use anyhow::Result;
use console::style;
use std::path::Path;

use forgeline::config::ProjectPaths;
use forgeline::orchestrator::StatusStore;
use forgeline::project::ProjectFile;
use forgeline_common::{PhaseState, RunState};

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let Some(run) = StatusStore::read(&paths.status_file())? else {
        println!("No run found. Start one with `forgeline run`.");
        return Ok(());
    };

    let state = match run.status {
        RunState::Completed => style(run.status.to_string()).green(),
        RunState::Failed | RunState::Cancelled => style(run.status.to_string()).red(),
        RunState::AwaitingHuman => style(run.status.to_string()).yellow(),
        RunState::Running => style(run.status.to_string()).cyan(),
    };

    println!();
    println!("Run {}  {}", style(&run.run_id).bold(), state);
    println!("  started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = run.finished_at {
        println!("  finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if run.reverts > 0 {
        println!("  reverts: {}", run.reverts);
    }
    println!();

    for phase in &run.phases {
        let icon = match phase.status {
            PhaseState::Completed => style("✓").green(),
            PhaseState::Failed => style("✗").red(),
            PhaseState::AwaitingHuman => style("⏸").yellow(),
            PhaseState::Running => style("▶").cyan(),
            PhaseState::Pending => style("·").dim(),
        };
        println!(
            "  {} {:<24} {:<15} tier: {:<10} attempts: {}",
            icon,
            phase.id,
            phase.status.to_string(),
            phase.escalation.tier.as_str(),
            phase.attempts.len()
        );
        if let Some(error) = &phase.error {
            println!("      {}", style(error).red());
        }
        if phase.status == PhaseState::AwaitingHuman {
            println!(
                "      decision needed: {}",
                paths.escalation_dir(&phase.id).join("human-request.yaml").display()
            );
        }
    }

    if let Some(error) = &run.error {
        println!();
        println!("{} {}", style("Error:").red().bold(), error);
    }
    Ok(())
}

pub fn cmd_validate(project_dir: &Path) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let file = ProjectFile::locate(&paths.state_dir)?;
    let project = ProjectFile::load(&file)?;
    let order = project.execution_order()?;

    println!(
        "{} {} is valid ({} phases)",
        style("✓").green().bold(),
        file.display(),
        order.len()
    );
    println!();
    println!("Execution order:");
    for (i, phase) in order.iter().enumerate() {
        let mut line = format!("  {:>2}. {}", i + 1, phase.id);
        if !phase.depends_on.is_empty() {
            line.push_str(&format!("  (after {})", phase.depends_on.join(", ")));
        }
        if let Some(gate) = &phase.gate {
            line.push_str(&format!("  [gate: {}]", gate.kind()));
        }
        println!("{}", line);
    }
    Ok(())
}
