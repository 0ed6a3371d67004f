//! Built-in action handlers and configuration-driven registry construction.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::action::{ActionContext, ActionHandler, ActionResult, ActionSpec, HandlerRegistry};
use crate::config::ConfigStore;
use crate::error::{HarnessError, Result};
use crate::matcher::{ErrorMatcher, ErrorRulesSource};
use crate::runner::CommandSpec;

/// Name of the built-in action that removes `work_dir`.
pub const CLOBBER_ACTION: &str = "clobber";

/// Fallback for `default_timeout_secs`.
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// The command(s) an action runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c`.
    Shell(String),
    /// A single argv.
    Argv(Vec<String>),
    /// Several argvs run in order; the first failure stops the action.
    Sequence(Vec<Vec<String>>),
}

impl CommandLine {
    fn argvs(&self) -> Vec<Vec<String>> {
        match self {
            CommandLine::Shell(script) => {
                vec![vec!["sh".to_string(), "-c".to_string(), script.clone()]]
            }
            CommandLine::Argv(argv) => vec![argv.clone()],
            CommandLine::Sequence(argvs) => argvs.clone(),
        }
    }
}

/// Configuration for one entry of the `actions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandActionConfig {
    pub command: CommandLine,

    /// Working directory for every command of the action.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Layered over the global `env` table.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Output timeout; `0` disables it. Falls back to `default_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Treat a failing command as fatal to the whole run.
    #[serde(default)]
    pub halt_on_failure: bool,

    /// Preset name or explicit rule list.
    #[serde(default)]
    pub error_rules: Option<ErrorRulesSource>,

    /// Files copied out once every command has succeeded.
    #[serde(default)]
    pub artifacts: Vec<ArtifactCopy>,
}

/// One `from` -> `to` file copy; missing parents of `to` are created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactCopy {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Runs configured commands through the context's [`crate::CommandRunner`].
#[derive(Debug, Clone)]
pub struct CommandHandler {
    commands: Vec<CommandSpec>,
    halt_on_failure: bool,
    cwd: Option<PathBuf>,
    artifacts: Vec<ArtifactCopy>,
}

impl CommandHandler {
    pub fn new(commands: Vec<CommandSpec>, halt_on_failure: bool) -> Self {
        Self {
            commands,
            halt_on_failure,
            cwd: None,
            artifacts: Vec::new(),
        }
    }

    /// Directory created before the first command runs.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactCopy>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Build from an `actions.<name>` table. Rules and timeouts are resolved here,
    /// so a bad definition fails before any action runs.
    pub fn from_config(
        name: &str,
        action: &CommandActionConfig,
        global_env: &BTreeMap<String, String>,
        default_timeout_secs: u64,
    ) -> Result<Self> {
        let argvs = action.command.argvs();
        if argvs.is_empty() || argvs.iter().any(|argv| argv.is_empty()) {
            return Err(HarnessError::InvalidConfiguration {
                key: format!("actions.{name}.command"),
                reason: "command must not be empty".to_string(),
            });
        }

        let rules = match &action.error_rules {
            Some(source) => ErrorMatcher::from_source(source)?,
            None => ErrorMatcher::base(),
        };
        let timeout = action.timeout_secs.unwrap_or(default_timeout_secs);

        let commands = argvs
            .into_iter()
            .map(|argv| {
                let mut spec = CommandSpec::new(argv)
                    .envs(global_env.clone())
                    .envs(action.env.clone())
                    .rules(rules.clone())
                    .output_timeout_secs(timeout);
                if let Some(cwd) = &action.cwd {
                    spec = spec.cwd(cwd.clone());
                }
                spec
            })
            .collect();

        let mut handler =
            Self::new(commands, action.halt_on_failure).with_artifacts(action.artifacts.clone());
        if let Some(cwd) = &action.cwd {
            handler = handler.with_cwd(cwd.clone());
        }
        Ok(handler)
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    fn failure(&self, message: String) -> ActionResult {
        if self.halt_on_failure {
            ActionResult::Fatal(message)
        } else {
            ActionResult::Recoverable(message)
        }
    }
}

#[async_trait]
impl ActionHandler for CommandHandler {
    async fn run(&self, ctx: &ActionContext<'_>) -> ActionResult {
        if let Some(cwd) = &self.cwd {
            if let Err(e) = ctx.files.mkdir_p(cwd) {
                return self.failure(format!("failed to create {}: {e}", cwd.display()));
            }
        }
        for spec in &self.commands {
            let outcome = ctx.runner.run(spec).await;
            if !outcome.success() {
                return self.failure(format!("`{}` {}", outcome.command, outcome.status));
            }
        }
        for artifact in &self.artifacts {
            let copied = match artifact.to.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => ctx.files.mkdir_p(parent),
                _ => Ok(()),
            }
            .and_then(|()| ctx.files.copy_file(&artifact.from, &artifact.to));
            if let Err(e) = copied {
                return self.failure(format!(
                    "failed to copy {} to {}: {e}",
                    artifact.from.display(),
                    artifact.to.display()
                ));
            }
        }
        ActionResult::Success
    }
}

/// Removes the configured `work_dir`.
#[derive(Debug, Clone, Default)]
pub struct ClobberHandler;

#[async_trait]
impl ActionHandler for ClobberHandler {
    async fn run(&self, ctx: &ActionContext<'_>) -> ActionResult {
        let work_dir: String = match ctx.config.get_as_or("work_dir", "build".to_string()) {
            Ok(dir) => dir,
            Err(e) => return ActionResult::Fatal(e.to_string()),
        };
        info!(action = %ctx.action, work_dir = %work_dir, "Clobbering work directory");
        match ctx.files.rmtree(&PathBuf::from(&work_dir)) {
            Ok(()) => ActionResult::Success,
            Err(e) => ActionResult::Recoverable(format!("failed to remove {work_dir}: {e}")),
        }
    }
}

/// Read the declared action list from `all_actions` and `default_actions`.
pub fn declared_from_config(config: &ConfigStore) -> Result<Vec<ActionSpec>> {
    let all: Vec<String> = config.require_as("all_actions")?;
    let defaults: Option<Vec<String>> = config.get_as("default_actions")?;
    ActionSpec::declare(&all, defaults.as_deref())
}

/// Build a handler for every action in `all_actions`.
///
/// An action uses its `actions.<name>` definition when present; `clobber`
/// falls back to the built-in. Anything else is a missing handler.
pub fn registry_from_config(config: &ConfigStore) -> Result<HandlerRegistry> {
    let all: Vec<String> = config.require_as("all_actions")?;
    let mut actions: BTreeMap<String, CommandActionConfig> =
        config.get_as("actions")?.unwrap_or_default();
    let global_env: BTreeMap<String, String> = config.get_as("env")?.unwrap_or_default();
    let default_timeout = config.get_as_or("default_timeout_secs", DEFAULT_TIMEOUT_SECS)?;

    if let Some(stray) = actions.keys().find(|name| !all.contains(name)) {
        return Err(HarnessError::UnknownAction {
            name: stray.clone(),
        });
    }

    let mut registry = HandlerRegistry::new();
    for name in &all {
        match actions.remove(name) {
            Some(action) => {
                let handler =
                    CommandHandler::from_config(name, &action, &global_env, default_timeout)?;
                registry = registry.with(name.clone(), handler);
            }
            None if name == CLOBBER_ACTION => {
                registry = registry.with(name.clone(), ClobberHandler);
            }
            None => return Err(HarnessError::MissingHandler { name: name.clone() }),
        }
    }
    Ok(registry)
}
