//! Action declarations, selection, and the handler contract.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::error::{HarnessError, Result};
use crate::files::FileOps;
use crate::runner::CommandRunner;
use crate::severity::Severity;

/// A declared pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionSpec {
    /// Unique name within the pipeline.
    pub name: String,

    /// Position in the declared order.
    pub ordinal: usize,

    /// Whether the action runs when no explicit subset is requested.
    pub default: bool,
}

impl ActionSpec {
    /// Declare an ordered action list.
    ///
    /// `defaults` marks the default subset; `None` makes every action a default.
    pub fn declare<S: AsRef<str>>(all: &[S], defaults: Option<&[S]>) -> Result<Vec<ActionSpec>> {
        let mut seen = HashSet::new();
        for name in all {
            if !seen.insert(name.as_ref()) {
                return Err(HarnessError::DuplicateAction {
                    name: name.as_ref().to_string(),
                });
            }
        }

        let default_set: Option<HashSet<&str>> = match defaults {
            Some(names) => {
                for name in names {
                    if !seen.contains(name.as_ref()) {
                        return Err(HarnessError::UnknownAction {
                            name: name.as_ref().to_string(),
                        });
                    }
                }
                Some(names.iter().map(|n| n.as_ref()).collect())
            }
            None => None,
        };

        Ok(all
            .iter()
            .enumerate()
            .map(|(ordinal, name)| ActionSpec {
                name: name.as_ref().to_string(),
                ordinal,
                default: default_set
                    .as_ref()
                    .map_or(true, |set| set.contains(name.as_ref())),
            })
            .collect())
    }
}

/// Requested subset modifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionSelection {
    /// Explicit subset; replaces the default list when non-empty.
    #[serde(default)]
    pub only: Vec<String>,

    /// Names to exclude. Skip wins over `only` and `add`.
    #[serde(default)]
    pub skip: Vec<String>,

    /// Names to include on top of the base list.
    #[serde(default)]
    pub add: Vec<String>,
}

impl ActionSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn skip<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn add<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add.extend(names.into_iter().map(Into::into));
        self
    }

    /// Resolve against the declared list.
    ///
    /// The result is deduplicated and always in declared order, whatever
    /// order the names were requested in.
    pub fn resolve(&self, declared: &[ActionSpec]) -> Result<Vec<String>> {
        let known: HashSet<&str> = declared.iter().map(|a| a.name.as_str()).collect();
        for name in self.only.iter().chain(&self.skip).chain(&self.add) {
            if !known.contains(name.as_str()) {
                return Err(HarnessError::UnknownAction { name: name.clone() });
            }
        }

        let only: HashSet<&str> = self.only.iter().map(String::as_str).collect();
        let skip: HashSet<&str> = self.skip.iter().map(String::as_str).collect();
        let add: HashSet<&str> = self.add.iter().map(String::as_str).collect();

        let mut ordered: Vec<&ActionSpec> = declared.iter().collect();
        ordered.sort_by_key(|a| a.ordinal);

        Ok(ordered
            .into_iter()
            .filter(|a| {
                let name = a.name.as_str();
                let base = if only.is_empty() {
                    a.default
                } else {
                    only.contains(name)
                };
                (base || add.contains(name)) && !skip.contains(name)
            })
            .map(|a| a.name.clone())
            .collect())
    }
}

/// What a handler reports back to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Success,
    /// The action failed; later actions still run.
    Recoverable(String),
    /// The action failed; the run aborts.
    Fatal(String),
}

/// Everything a handler may use. Passed explicitly, never global.
pub struct ActionContext<'a> {
    pub action: &'a str,
    pub config: &'a ConfigStore,
    pub runner: &'a CommandRunner,
    pub files: &'a FileOps,
    summary: Mutex<Vec<(Severity, String)>>,
}

impl<'a> ActionContext<'a> {
    pub fn new(
        action: &'a str,
        config: &'a ConfigStore,
        runner: &'a CommandRunner,
        files: &'a FileOps,
    ) -> Self {
        Self {
            action,
            config,
            runner,
            files,
            summary: Mutex::new(Vec::new()),
        }
    }

    /// Add a summary entry for this action at the given severity.
    ///
    /// Entries are recorded after the action's own outcome, in the order added.
    pub fn add_summary(&self, severity: Severity, message: impl Into<String>) {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((severity, message.into()));
    }

    /// Drain the entries added so far.
    pub fn take_summary(&self) -> Vec<(Severity, String)> {
        std::mem::take(
            &mut *self
                .summary
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// A named pipeline step implementation.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, ctx: &ActionContext<'_>) -> ActionResult;
}

/// Adapts a synchronous closure into an [`ActionHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&ActionContext<'_>) -> ActionResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ActionHandler for FnHandler<F>
where
    F: Fn(&ActionContext<'_>) -> ActionResult + Send + Sync,
{
    async fn run(&self, ctx: &ActionContext<'_>) -> ActionResult {
        (self.f)(ctx)
    }
}

/// Mapping from action name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a second registration for the same name is an error.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(HarnessError::DuplicateAction { name });
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Builder form; replaces any existing handler for `name`.
    pub fn with(mut self, name: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Builder form for closure handlers.
    pub fn with_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ActionContext<'_>) -> ActionResult + Send + Sync + 'static,
    {
        self.with(name, FnHandler::new(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
