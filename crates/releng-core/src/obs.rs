//! Structured observability hooks for the pipeline lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span via [`run_span`]
//! - Emission functions for key lifecycle events: run start/finish, action
//!   start/finish, recorded outcomes, and classified command output
//!
//! Outcomes and classified lines are emitted at their own severity, so the
//! subscriber installed by [`crate::telemetry::init_tracing`] acts as the log sink.

use tracing::{debug, error, info, warn};

use crate::severity::Severity;

/// Span tagging every event of one run with its run_id.
///
/// # Example
///
/// ```ignore
/// pipeline_future.instrument(run_span("4b1d...")).await;
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("releng.run", run_id = %run_id)
}

/// Emit event: run started with its resolved plan.
pub fn emit_run_started(run_id: &str, actions: &[String], plan_digest: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        actions = %actions.join(","),
        plan_digest = %plan_digest,
    );
}

/// Emit event: one action is about to run.
pub fn emit_action_started(action: &str, position: usize, total: usize) {
    info!(
        event = "action.started",
        action = %action,
        position = position,
        total = total,
    );
}

/// Emit event: one action finished with the given severity.
pub fn emit_action_finished(action: &str, severity: Severity, duration_ms: u64) {
    info!(
        event = "action.finished",
        action = %action,
        severity = %severity,
        duration_ms = duration_ms,
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, status: &str, exit_code: i32, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

/// Forward a recorded outcome at its own severity.
pub fn emit_outcome(action: &str, severity: Severity, message: &str) {
    log_at(severity, "action.outcome", action, message);
}

/// Forward a classified output line at its matched severity.
pub fn emit_line_matched(command: &str, severity: Severity, line: &str) {
    log_at(severity, "command.line_matched", command, line);
}

fn log_at(severity: Severity, event: &'static str, subject: &str, message: &str) {
    match severity {
        Severity::Debug => debug!(event = event, subject = %subject, "{}", message),
        Severity::Info => info!(event = event, subject = %subject, "{}", message),
        Severity::Warning => warn!(event = event, subject = %subject, "{}", message),
        Severity::Error | Severity::Critical | Severity::Fatal => {
            error!(event = event, subject = %subject, severity = %severity, "{}", message)
        }
    }
}
