//! `tess validate`: load a playbook directory and report rejected definitions.

use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use tessera_core::{EngineConfig, PlaybookRegistry};

#[derive(Serialize)]
struct ValidationReport {
    directory: String,
    valid: Vec<ValidEntry>,
    rejected: Vec<RejectedEntry>,
    all_valid: bool,
}

#[derive(Serialize)]
struct ValidEntry {
    code: String,
    locales: Vec<String>,
}

#[derive(Serialize)]
struct RejectedEntry {
    source: String,
    error: String,
}

/// Execute the validate command.
///
/// Fails when any definition in the directory is rejected.
pub fn execute(config: &EngineConfig, dir: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| config.playbooks_dir());
    let registry = PlaybookRegistry::load_with(&dir, config.fallback_locale())?;

    let report = ValidationReport {
        directory: dir.display().to_string(),
        valid: registry
            .codes()
            .into_iter()
            .map(|code| ValidEntry {
                code: code.to_string(),
                locales: registry.variants(code).iter().map(|v| v.locale.clone()).collect(),
            })
            .collect(),
        rejected: registry
            .rejected()
            .iter()
            .map(|r| RejectedEntry { source: r.source.display().to_string(), error: r.error.to_string() })
            .collect(),
        all_valid: registry.rejected().is_empty(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output_human(&report);
    }

    if !report.all_valid {
        anyhow::bail!("{} playbook definition(s) rejected", report.rejected.len());
    }
    Ok(())
}

fn output_human(report: &ValidationReport) {
    println!("{}", "tess validate".bold().cyan());
    println!("  Directory: {}", report.directory.dimmed());
    println!();

    for entry in &report.valid {
        println!("  {} {} {}", "✓".green().bold(), entry.code, format!("[{}]", entry.locales.join(", ")).dimmed());
    }
    for entry in &report.rejected {
        println!("  {} {}", "✗".red().bold(), entry.source);
        println!("    {}: {}", "Error".red(), entry.error.dimmed());
    }
    println!();

    if report.all_valid {
        println!("{}", format!("✓ {} playbook(s) valid", report.valid.len()).green().bold());
    } else {
        println!("{}", format!("✗ {} definition(s) rejected", report.rejected.len()).red().bold());
    }
}
