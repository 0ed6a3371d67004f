//! Releng - build/release action pipeline runner
//!
//! The `releng` command loads layered configuration, resolves the requested
//! actions against the declared list, and runs them in order.
//!
//! ## Commands
//!
//! - `run`: Execute the selected actions and exit with the run's exit code
//! - `list-actions`: Show declared actions and which ones a selection would run
//! - `show-config`: Show the merged configuration and where each key came from

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use releng_core::telemetry::{init_tracing, parse_level};
use releng_core::{
    declared_from_config, registry_from_config, ActionPipeline, ActionSelection, ConfigLayer,
    ConfigStore, HarnessError, PipelineContext, RunResult,
};

#[derive(Parser)]
#[command(name = "releng")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run ordered build/release actions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the selected actions
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        selection: SelectionArgs,

        /// Log what would run without running it
        #[arg(long)]
        noop: bool,

        /// Write the run result as JSON to this path
        #[arg(long)]
        summary_json: Option<PathBuf>,
    },

    /// List declared actions, marking the ones the selection would run
    ListActions {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Print the merged configuration with each key's origin
    ShowConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Configuration file (.json or .toml); later files win
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Override a configuration key; the value is parsed as JSON when possible
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

impl ConfigArgs {
    /// Merge defaults, files, then overrides.
    fn load(&self, extra_overrides: &[&str]) -> Result<ConfigStore> {
        let mut layers = vec![ConfigLayer::defaults()];
        for path in &self.files {
            let layer = ConfigLayer::from_file(path)
                .with_context(|| format!("Failed to load config file {}", path.display()))?;
            layers.push(layer);
        }
        let overrides = self
            .overrides
            .iter()
            .map(String::as_str)
            .chain(extra_overrides.iter().copied());
        layers.push(ConfigLayer::from_overrides(overrides).context("Invalid --set override")?);
        ConfigStore::load(layers)
            .interpolate()
            .context("Failed to resolve configuration placeholders")
    }
}

#[derive(Args, Debug, Clone, Default)]
struct SelectionArgs {
    /// Run only these actions (repeatable)
    #[arg(long = "action", value_name = "ACTION")]
    only: Vec<String>,

    /// Also run these actions on top of the defaults (repeatable)
    #[arg(long = "add-action", value_name = "ACTION")]
    add: Vec<String>,

    /// Do not run these actions (repeatable)
    #[arg(long = "skip-action", value_name = "ACTION")]
    skip: Vec<String>,
}

impl SelectionArgs {
    fn selection(&self) -> ActionSelection {
        ActionSelection::new()
            .only(self.only.iter().cloned())
            .add(self.add.iter().cloned())
            .skip(self.skip.iter().cloned())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            selection,
            noop,
            summary_json,
        } => {
            let extra: &[&str] = if noop { &["noop=true"] } else { &[] };
            let store = config.load(extra)?;
            setup_logging(cli.verbose, cli.json, &store);
            let code = cmd_run(store, &selection.selection(), summary_json.as_deref()).await?;
            std::process::exit(code);
        }
        Commands::ListActions { config, selection } => {
            let store = config.load(&[])?;
            setup_logging(cli.verbose, cli.json, &store);
            print!("{}", cmd_list_actions(&store, &selection.selection())?);
            Ok(())
        }
        Commands::ShowConfig { config } => {
            let store = config.load(&[])?;
            setup_logging(cli.verbose, cli.json, &store);
            print!("{}", cmd_show_config(&store));
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool, json: bool, store: &ConfigStore) {
    let level = if verbose {
        Level::DEBUG
    } else {
        store
            .get_as::<String>("log_level")
            .ok()
            .flatten()
            .and_then(|name| parse_level(&name))
            .unwrap_or(Level::INFO)
    };
    init_tracing(json, level);
}

async fn cmd_run(
    store: ConfigStore,
    selection: &ActionSelection,
    summary_json: Option<&Path>,
) -> Result<i32> {
    let config = Arc::new(store);
    let declared = declared_from_config(&config).context("Failed to read declared actions")?;
    let handlers = registry_from_config(&config).context("Failed to build action handlers")?;
    let ctx = PipelineContext::from_config(config).context("Failed to build pipeline context")?;
    let mut pipeline = ActionPipeline::new(declared, selection, handlers, ctx)
        .context("Failed to build pipeline")?;

    info!(actions = %pipeline.plan().join(","), "Resolved actions");

    let result = match pipeline.execute().await {
        Ok(result) => result,
        Err(HarnessError::HandlerFatal { result, .. }) => *result,
        Err(e) => return Err(e).context("Pipeline execution failed"),
    };

    print!("{}", result.render().text);
    if let Some(path) = summary_json {
        write_summary_json(&result, path)?;
    }
    Ok(result.exit_code())
}

fn write_summary_json(result: &RunResult, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    info!(path = %path.display(), "Wrote run summary");
    Ok(())
}

fn cmd_list_actions(store: &ConfigStore, selection: &ActionSelection) -> Result<String> {
    let declared = declared_from_config(store).context("Failed to read declared actions")?;
    let plan = selection.resolve(&declared)?;

    let mut out = String::new();
    for spec in &declared {
        let marker = if plan.contains(&spec.name) { "*" } else { " " };
        let tag = if spec.default { "" } else { " (not default)" };
        out.push_str(&format!("{} {}{}\n", marker, spec.name, tag));
    }
    Ok(out)
}

fn cmd_show_config(store: &ConfigStore) -> String {
    let mut out = String::new();
    for entry in store.entries() {
        out.push_str(&format!("{} = {} [{}]\n", entry.key, entry.value, entry.origin));
    }
    out
}
