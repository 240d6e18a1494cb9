//! `tess list`: list loaded playbooks.

use colored::Colorize;
use serde::Serialize;
use tessera_core::{EngineConfig, PlaybookDefinition};

use super::load_registry;

#[derive(Serialize)]
struct PlaybookSummary<'a> {
    code: &'a str,
    name: &'a str,
    version: &'a str,
    kind: String,
    default_locale: &'a str,
    locales: Vec<&'a str>,
    tags: &'a [String],
    steps: usize,
    has_async_steps: bool,
}

pub fn execute(config: &EngineConfig, json: bool) -> anyhow::Result<()> {
    let registry = load_registry(config)?;

    let summaries: Vec<PlaybookSummary<'_>> = registry
        .list()
        .into_iter()
        .map(|definition| summarize(definition, registry.variants(&definition.code)))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "playbooks": summaries }))?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No playbooks found in {}.", config.playbooks_dir().display());
        return Ok(());
    }

    println!("{}", "Playbooks".bold());
    println!("=========");
    println!();
    println!("{:<28} {:<10} {:<14} {:<16} {}", "Code", "Version", "Kind", "Locales", "Name");
    println!("{}", "-".repeat(96));

    for summary in &summaries {
        let code = if summary.has_async_steps {
            format!("{} {}", summary.code, "(async)".dimmed())
        } else {
            summary.code.to_string()
        };
        println!(
            "{:<28} {:<10} {:<14} {:<16} {}",
            code.bright_blue(),
            summary.version,
            summary.kind,
            summary.locales.join(","),
            summary.name
        );
    }

    let rejected = registry.rejected().len();
    if rejected > 0 {
        println!();
        println!(
            "{} {} definition(s) rejected; run {} for details",
            "!".yellow(),
            rejected,
            "tess validate".bright_blue()
        );
    }

    Ok(())
}

fn summarize<'a>(
    definition: &'a PlaybookDefinition,
    variants: &'a [PlaybookDefinition],
) -> PlaybookSummary<'a> {
    PlaybookSummary {
        code: &definition.code,
        name: &definition.name,
        version: &definition.version,
        kind: definition.kind.to_string(),
        default_locale: &definition.default_locale,
        locales: variants.iter().map(|v| v.locale.as_str()).collect(),
        tags: &definition.tags,
        steps: definition.steps.len(),
        has_async_steps: definition.has_async_steps(),
    }
}
