//! The per-phase feedback channel.
//!
//! `feedback.md` in a phase directory collects gate failures and judge
//! defects. Its contents are appended to the next attempt's instructions.
//! It is cleared when the phase passes.

use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const FEEDBACK_FILE: &str = "feedback.md";

pub fn feedback_path(phase_dir: &Path) -> PathBuf {
    phase_dir.join(FEEDBACK_FILE)
}

/// Append a titled section to the phase's feedback file.
pub fn append(phase_dir: &Path, title: &str, body: &str) -> Result<()> {
    std::fs::create_dir_all(phase_dir)
        .with_context(|| format!("Failed to create phase dir: {}", phase_dir.display()))?;
    let path = feedback_path(phase_dir);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open feedback file: {}", path.display()))?;
    writeln!(
        file,
        "## {} ({})\n\n{}\n",
        title,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        body.trim()
    )
    .with_context(|| format!("Failed to write feedback file: {}", path.display()))?;
    Ok(())
}

pub fn read(phase_dir: &Path) -> Option<String> {
    std::fs::read_to_string(feedback_path(phase_dir))
        .ok()
        .filter(|s| !s.trim().is_empty())
}

pub fn clear(phase_dir: &Path) -> Result<()> {
    let path = feedback_path(phase_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
