//! Action pipeline: a run-once state machine over the resolved plan.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::Instrument;
use uuid::Uuid;

use crate::action::{ActionContext, ActionResult, ActionSelection, ActionSpec, HandlerRegistry};
use crate::config::ConfigStore;
use crate::error::{HarnessError, Result};
use crate::files::FileOps;
use crate::obs;
use crate::report::{ActionOutcome, RenderedSummary, SummaryReport};
use crate::runner::CommandRunner;
use crate::severity::{Severity, EXIT_ABORTED, EXIT_FAILURE, EXIT_SUCCESS};

/// Where a pipeline is in its single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    /// Executing the action at `index` of the plan.
    Running { index: usize, action: String },
    Completed,
    Aborted,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Final, immutable summary of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    /// The resolved plan, including actions never reached on abort.
    pub plan: Vec<String>,
    pub plan_digest: String,
    /// Each attempted action's outcome, followed by any summary entries it
    /// added, in execution order.
    pub outcomes: Vec<ActionOutcome>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn worst(&self) -> Option<Severity> {
        self.outcomes.iter().map(|o| o.severity).max()
    }

    /// `0` when the worst severity is at most warning, `2` when aborted,
    /// `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.status == RunStatus::Aborted {
            return EXIT_ABORTED;
        }
        match self.worst() {
            Some(worst) if worst.is_failure() => EXIT_FAILURE,
            _ => EXIT_SUCCESS,
        }
    }

    /// Number of outcomes below error severity.
    pub fn passed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.severity.is_failure())
            .count()
    }

    /// Number of outcomes at error severity or above.
    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.passed_count()
    }

    pub fn render(&self) -> RenderedSummary {
        SummaryReport::from(self.outcomes.clone()).render()
    }
}

/// Shared collaborators handed to every action.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub config: Arc<ConfigStore>,
    pub runner: CommandRunner,
    pub files: FileOps,
}

impl PipelineContext {
    /// Build collaborators from configuration; honours the `noop` key.
    pub fn from_config(config: Arc<ConfigStore>) -> Result<Self> {
        let noop = config.get_as_or("noop", false)?;
        Ok(Self {
            config,
            runner: CommandRunner::new(noop),
            files: FileOps::new(noop),
        })
    }
}

/// Ordered, filtered action runner. Executes exactly once.
pub struct ActionPipeline {
    declared: Vec<ActionSpec>,
    plan: Vec<String>,
    handlers: HandlerRegistry,
    context: PipelineContext,
    state: PipelineState,
    result: Option<RunResult>,
}

impl ActionPipeline {
    /// Validate the declaration, resolve the selection, and check handlers.
    ///
    /// Every error here is raised before any action can run.
    pub fn new(
        declared: Vec<ActionSpec>,
        selection: &ActionSelection,
        handlers: HandlerRegistry,
        context: PipelineContext,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        for spec in &declared {
            if !names.insert(spec.name.as_str()) {
                return Err(HarnessError::DuplicateAction {
                    name: spec.name.clone(),
                });
            }
        }

        if let Some(stray) = handlers.names().find(|n| !names.contains(n)) {
            return Err(HarnessError::UnknownAction {
                name: stray.to_string(),
            });
        }

        let plan = selection.resolve(&declared)?;
        if let Some(missing) = plan.iter().find(|n| !handlers.contains(n)) {
            return Err(HarnessError::MissingHandler {
                name: missing.clone(),
            });
        }

        Ok(Self {
            declared,
            plan,
            handlers,
            context,
            state: PipelineState::Pending,
            result: None,
        })
    }

    pub fn declared(&self) -> &[ActionSpec] {
        &self.declared
    }

    /// The resolved execution order.
    pub fn plan(&self) -> &[String] {
        &self.plan
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// The stored result once the pipeline has run.
    pub fn result(&self) -> Option<&RunResult> {
        self.result.as_ref()
    }

    /// Deterministic SHA-256 of the ordered plan.
    pub fn digest(&self) -> String {
        compute_plan_digest(&self.plan)
    }

    /// Run every planned action in order.
    ///
    /// Recoverable failures are recorded and the run continues. A fatal
    /// failure is recorded, the remaining actions are skipped, and
    /// [`HarnessError::HandlerFatal`] is returned carrying the partial result.
    pub async fn execute(&mut self) -> Result<RunResult> {
        if self.state != PipelineState::Pending {
            return Err(HarnessError::AlreadyExecuted);
        }

        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.run_plan(run_id).instrument(span).await
    }

    async fn run_plan(&mut self, run_id: String) -> Result<RunResult> {
        let start = Instant::now();
        let started_at = Utc::now();
        let plan_digest = self.digest();
        obs::emit_run_started(&run_id, &self.plan, &plan_digest);

        let mut report = SummaryReport::new();
        let mut abort: Option<(String, String)> = None;
        let total = self.plan.len();

        for (index, name) in self.plan.iter().enumerate() {
            self.state = PipelineState::Running {
                index,
                action: name.clone(),
            };
            obs::emit_action_started(name, index + 1, total);

            let handler = self
                .handlers
                .get(name)
                .ok_or_else(|| HarnessError::MissingHandler { name: name.clone() })?;
            let ctx = ActionContext::new(
                name,
                &self.context.config,
                &self.context.runner,
                &self.context.files,
            );

            let action_start = Instant::now();
            let result = handler.run(&ctx).await;
            let duration_ms = action_start.elapsed().as_millis() as u64;

            let (severity, message) = match &result {
                ActionResult::Success => (Severity::Info, "completed".to_string()),
                ActionResult::Recoverable(message) => (Severity::Error, message.clone()),
                ActionResult::Fatal(message) => (Severity::Fatal, message.clone()),
            };
            report.record(ActionOutcome::new(name, severity, message.clone(), duration_ms));
            for (severity, note) in ctx.take_summary() {
                report.record(ActionOutcome::new(name, severity, note, 0));
            }
            obs::emit_action_finished(name, severity, duration_ms);

            if let ActionResult::Fatal(_) = result {
                abort = Some((name.clone(), message));
                break;
            }
        }

        let status = if abort.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        self.state = match status {
            RunStatus::Completed => PipelineState::Completed,
            RunStatus::Aborted => PipelineState::Aborted,
        };

        let result = RunResult {
            run_id,
            status,
            plan: self.plan.clone(),
            plan_digest,
            outcomes: report.outcomes().to_vec(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        obs::emit_run_finished(
            &result.run_id,
            status.as_str(),
            result.exit_code(),
            result.duration_ms,
        );
        self.result = Some(result.clone());

        match abort {
            Some((action, message)) => Err(HarnessError::HandlerFatal {
                action,
                message,
                result: Box::new(result),
            }),
            None => Ok(result),
        }
    }
}

/// Compute deterministic digest of ordered action names.
fn compute_plan_digest(plan: &[String]) -> String {
    let mut hasher = Sha256::new();
    for name in plan {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}
