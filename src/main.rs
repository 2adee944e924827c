use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forgeline::logging::{LogFormat, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "forgeline")]
#[command(version, about = "Drive agent-executed phases through verification, quality gates and escalation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline defined in .forgeline/project.yaml
    Run {
        /// Continue the previous run from .forgeline/status.json
        #[arg(long)]
        resume: bool,

        /// Stop instead of waiting when a phase needs a human decision
        #[arg(long)]
        halt_on_human: bool,
    },
    /// Show the status of the current or last run
    Status,
    /// Check the project file: ids, dependencies, execution order
    Validate,
    /// Capture the test baseline without running any phase
    Baseline,
    /// Deliver a human decision to a phase awaiting one
    Decide {
        /// Phase id
        phase: String,

        /// Resume with the ranked option from human-request.yaml
        #[arg(long, conflicts_with_all = ["manual", "abort"])]
        option: Option<u32>,

        /// Resume with a manual override
        #[arg(long = "override", conflicts_with = "abort")]
        manual: bool,

        /// Model for the override
        #[arg(long, requires = "manual")]
        model: Option<String>,

        /// Extra guidance for the override (repeatable)
        #[arg(long = "hint", requires = "manual")]
        hints: Vec<String>,

        /// Accept the phase output as-is
        #[arg(long, requires = "manual")]
        accept: bool,

        /// Abort the run
        #[arg(long)]
        abort: bool,

        /// Reason recorded with an abort
        #[arg(long, requires = "abort")]
        reason: Option<String>,
    },
    /// Print the effective configuration and validation warnings
    Config,
    /// Serve the job control HTTP API
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "3141")]
        port: u16,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.log_format, cli.log_file.as_deref())?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            resume,
            halt_on_human,
        } => cmd::cmd_run(&project_dir, *resume, *halt_on_human).await?,
        Commands::Status => cmd::cmd_status(&project_dir)?,
        Commands::Validate => cmd::cmd_validate(&project_dir)?,
        Commands::Baseline => cmd::cmd_baseline(&project_dir).await?,
        Commands::Decide {
            phase,
            option,
            manual,
            model,
            hints,
            accept,
            abort,
            reason,
        } => {
            let decision = cmd::decide::decision_from_args(
                *option,
                *manual,
                model.clone(),
                hints.clone(),
                *accept,
                *abort,
                reason.clone(),
            )?;
            cmd::cmd_decide(&project_dir, phase, &decision)?;
        }
        Commands::Config => cmd::cmd_config(&project_dir)?,
        Commands::Serve { port, dev } => cmd::cmd_serve(&project_dir, *port, *dev).await?,
    }

    Ok(())
}
