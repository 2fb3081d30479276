//! Listing checkpoints of a finished or running training run.

use anyhow::{Context, Result};
use cadence_training::{CheckpointManager, CheckpointPolicy, ResultsLayout};
use colored::Colorize;
use std::path::Path;

pub fn execute(results_folder: &Path, json: bool) -> Result<()> {
    let layout = ResultsLayout::new(results_folder);
    let models_dir = layout.models_dir();
    if !models_dir.is_dir() {
        anyhow::bail!("No models folder found under {}", results_folder.display());
    }

    // Listing only; the period is irrelevant because nothing is saved.
    let manager = CheckpointManager::open(&models_dir, None, CheckpointPolicy::default())
        .with_context(|| format!("Failed to read checkpoint index in {}", models_dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(manager.records())?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Checkpoints ({})", manager.records().len()).bold().cyan());
    println!("  {}", manager.dir().display().to_string().dimmed());
    println!();

    if manager.records().is_empty() {
        println!("  {}", "No checkpoints recorded yet.".dimmed());
        return Ok(());
    }

    println!("{:<10} {:<12} {:<18} {}", "Step", "Bytes", "SHA-256", "Path");
    println!("{}", "─".repeat(90));
    for record in manager.records() {
        println!(
            "{:<10} {:<12} {:<18} {}",
            record.step.to_string().cyan(),
            record.bytes,
            record.sha256.get(..16).unwrap_or(&record.sha256).dimmed(),
            record.path.display()
        );
    }
    if let Some(latest) = manager.latest() {
        println!();
        println!("  Latest: {}", latest.path.display().to_string().green());
    }
    println!();
    Ok(())
}
