//! Tessera CLI - command-line front end for the playbook engine.
//!
//! Provides a `tess` command for listing, inspecting and validating playbooks
//! and for dry-running them against an echo tool.

mod commands;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tessera_core::EngineConfig;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{list, run, show, validate};

/// Tessera CLI - run Markdown playbooks
#[derive(Parser, Debug)]
#[command(
    name = "tess",
    author,
    version,
    about = "Tessera - Markdown playbook engine",
    long_about = "Tessera (tess) loads YAML-frontmattered Markdown playbooks, validates them,\nand runs them step by step against registered tools."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Playbook directory (overrides configuration and TESSERA_PLAYBOOKS_DIR)
    #[arg(short = 'p', long, global = true)]
    playbooks_dir: Option<PathBuf>,

    /// Configuration file (skips ~/.tessera/config.toml and .tesserarc discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available playbooks
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a playbook definition
    Show {
        /// Playbook code
        code: String,

        /// Preferred locale (falls back to the playbook's default locale)
        #[arg(long)]
        locale: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate every playbook in a directory
    ///
    /// Exits with a non-zero status if any definition is rejected.
    Validate {
        /// Directory to validate (defaults to the configured playbook directory)
        dir: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dry-run a playbook
    ///
    /// Every tool is answered by an echo tool that returns its parameters.
    /// Artifacts are written under the configured artifacts directory.
    Run {
        /// Playbook code
        code: String,

        /// Preferred locale
        #[arg(long)]
        locale: Option<String>,

        /// Inputs as a JSON object
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// File containing the inputs as a JSON object
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = EngineConfig::load_from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config
        }
        None => EngineConfig::discover_and_load(),
    };

    if let Some(dir) = &args.playbooks_dir {
        config.paths.playbooks_dir = Some(dir.clone());
    }
    Ok(config)
}

fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let filter = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(level.unwrap_or("warn")).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // Logs go to stderr so JSON output on stdout stays parseable.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(args.log_level.as_deref().or(config.log_level.as_deref()))?;

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::List { json } => list::execute(&config, json),
        Command::Show { code, locale, json } => show::execute(&config, &code, locale.as_deref(), json),
        Command::Validate { dir, json } => validate::execute(&config, dir, json),
        Command::Run { code, locale, input, input_file, json } => {
            let inputs = run::read_inputs(input.as_deref(), input_file.as_deref())?;
            run::execute(&config, &code, locale.as_deref(), inputs, json).await
        }
    }
}
