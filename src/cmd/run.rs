//! Pipeline execution: `forgeline run` and `forgeline baseline`.

use anyhow::{Result, bail};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use forgeline::baseline;
use forgeline::config::{ForgelineToml, HumanWait, ProjectPaths};
use forgeline::orchestrator::{PipelineOrchestrator, RunOptions, RunOutcome};

pub async fn cmd_run(project_dir: &Path, resume: bool, halt_on_human: bool) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let mut config = ForgelineToml::resolve(&paths)?;
    if halt_on_human {
        config.escalation.human_wait = HumanWait::Halt;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling run...");
            on_signal.cancel();
        }
    });

    let outcome = PipelineOrchestrator::new(project_dir, config)
        .run(RunOptions { resume }, cancel)
        .await?;

    println!();
    match outcome {
        RunOutcome::Completed { phases } => {
            println!(
                "{} {} phase(s) complete",
                console::style("✓").green().bold(),
                phases
            );
            Ok(())
        }
        RunOutcome::AwaitingHuman { phase } => {
            let request = paths.escalation_dir(&phase).join("human-request.yaml");
            println!(
                "{} Phase {} needs a decision: {}",
                console::style("⏸").yellow().bold(),
                phase,
                request.display()
            );
            println!(
                "  Answer with `forgeline decide {} --option N`, then `forgeline run --resume`.",
                phase
            );
            bail!("Run halted awaiting a human decision for phase {}", phase)
        }
        RunOutcome::Failed { phase, reason } => {
            println!("{} {}", console::style("Error:").red().bold(), reason);
            match phase {
                Some(phase) => bail!("Phase {} failed", phase),
                None => bail!("Run failed"),
            }
        }
        RunOutcome::Cancelled => bail!("Run cancelled"),
    }
}

pub async fn cmd_baseline(project_dir: &Path) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let mut config = ForgelineToml::resolve(&paths)?;
    // An explicit request always captures.
    config.baseline.enabled = true;

    match baseline::capture(project_dir, &config.baseline).await? {
        Some(snapshot) => {
            std::fs::create_dir_all(&paths.state_dir)?;
            baseline::save(&paths.baseline_file(), &snapshot)?;
            println!();
            println!("Baseline captured: {}", paths.baseline_file().display());
            println!("  tests:      {}", snapshot.total);
            println!("  passing:    {}", snapshot.passed);
            println!("  failing:    {}", snapshot.failing.len());
            println!("  test files: {}", snapshot.test_files.len());
            for test in &snapshot.failing {
                println!("    {} {}", console::style("✗").red(), test);
            }
            Ok(())
        }
        None => bail!(
            "No test report at {}; set [baseline].command in forgeline.toml",
            project_dir.join(&config.baseline.report).display()
        ),
    }
}
