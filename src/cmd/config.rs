//! Effective configuration: `forgeline config`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use forgeline::config::{ForgelineToml, ProjectPaths};

pub fn cmd_config(project_dir: &Path) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let config = ForgelineToml::resolve(&paths)?;

    let source = paths.config_file();
    if source.exists() {
        println!("# from {} (with FORGELINE_* overrides)", source.display());
    } else {
        println!("# defaults (no {} found)", source.display());
    }
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered);

    let warnings = config.validate();
    if !warnings.is_empty() {
        eprintln!();
        for warning in &warnings {
            eprintln!("{} {}", style("warning:").yellow().bold(), warning);
        }
    }
    Ok(())
}
