//! Releng Core - action pipeline execution for build/release automation
//!
//! Provides a linear step runner that:
//! - Resolves a declared action list against only/skip/add selections
//! - Dispatches each selected action to a registered handler, in declared order
//! - Runs external commands with line classification, timeouts and noop mode
//! - Aggregates per-action outcomes into a rendered summary and exit code

pub mod action;
pub mod config;
pub mod error;
pub mod files;
pub mod handlers;
pub mod matcher;
pub mod obs;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod severity;
pub mod telemetry;

// Re-export key types
pub use action::{
    ActionContext, ActionHandler, ActionResult, ActionSelection, ActionSpec, FnHandler,
    HandlerRegistry,
};
pub use config::{ConfigEntry, ConfigLayer, ConfigStore, LayerOrigin};
pub use error::{HarnessError, Result};
pub use files::FileOps;
pub use handlers::{
    declared_from_config, registry_from_config, ArtifactCopy, ClobberHandler,
    CommandActionConfig, CommandHandler, CommandLine,
};
pub use matcher::{ErrorMatcher, ErrorRule, ErrorRuleSpec, ErrorRulesSource, LinePattern};
pub use pipeline::{ActionPipeline, PipelineContext, PipelineState, RunResult, RunStatus};
pub use report::{ActionOutcome, RenderedSummary, SummaryReport};
pub use runner::{
    CapturedOutput, CommandOutcome, CommandRunner, CommandSpec, CommandStatus, LineMatch,
    OutputStream, SPAWN_FAILED_CODE, TIMED_OUT_CODE,
};
pub use severity::{RuleLevel, Severity, EXIT_ABORTED, EXIT_FAILURE, EXIT_SUCCESS};
