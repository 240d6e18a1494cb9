//! `tess show`: print one playbook definition.

use colored::Colorize;
use tessera_core::playbooks::MergePolicy;
use tessera_core::{EngineConfig, PlaybookDefinition};

use super::load_registry;

pub fn execute(
    config: &EngineConfig,
    code: &str,
    locale: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let locale = locale.unwrap_or_else(|| config.fallback_locale());
    let definition = registry.resolve(code, locale)?;

    if json {
        println!("{}", serde_json::to_string_pretty(definition)?);
    } else {
        print_definition(definition);
    }
    Ok(())
}

fn print_definition(def: &PlaybookDefinition) {
    println!("{} {}", def.code.bold().cyan(), format!("v{}", def.version).dimmed());
    println!("  Name:    {}", def.name);
    println!("  Kind:    {}", def.kind);
    println!("  Locale:  {} (default {})", def.locale, def.default_locale);
    if !def.tags.is_empty() {
        println!("  Tags:    {}", def.tags.join(", "));
    }
    println!();

    println!("{}", "Tools".bold());
    for tool in &def.required_tools {
        println!("  {} {}", "•".green(), tool);
    }
    for tool in &def.optional_tools {
        println!("  {} {} {}", "•".yellow(), tool, "(optional)".dimmed());
    }
    println!();

    println!("{}", "Steps".bold());
    for (index, step) in def.steps.iter().enumerate() {
        let mut notes = Vec::new();
        if step.is_async {
            notes.push("async".to_string());
        }
        if step.condition.is_some() {
            notes.push("conditional".to_string());
        }
        if let Some(artifact) = &step.artifact {
            notes.push(format!("artifact: {}", artifact.name));
        }
        let notes = if notes.is_empty() { String::new() } else { format!("[{}]", notes.join(", ")) };
        println!("  {}. {} → {} {}", index + 1, step.step_id.bright_blue(), step.tool_ref, notes.dimmed());
    }
    println!();

    if !def.input_schema.is_empty() {
        println!("{}", "Inputs".bold());
        for (name, spec) in &def.input_schema {
            let required = if spec.required { "required".red().to_string() } else { "optional".dimmed().to_string() };
            println!("  {:<20} {:<16} {}", name, spec.param_type.to_string(), required);
        }
        println!();
    }

    if !def.output_schema.is_empty() {
        println!("{}", "Outputs".bold());
        for (name, field) in &def.output_schema {
            let merge = match &field.merge {
                MergePolicy::OverwriteLast => String::new(),
                MergePolicy::UnionByKey { key, .. } => format!("union by {key}"),
                MergePolicy::Reduce { reducer, from } if from.is_empty() => format!("{reducer:?}").to_lowercase(),
                MergePolicy::Reduce { reducer, from } => {
                    format!("{} of {}", format!("{reducer:?}").to_lowercase(), from.join(", "))
                }
            };
            println!("  {:<20} {:<10} {}", name, format!("{:?}", field.field_type).to_lowercase(), merge.dimmed());
        }
    }
}
