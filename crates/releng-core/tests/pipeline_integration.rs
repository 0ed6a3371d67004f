//! Integration tests for action pipeline execution.

use std::sync::{Arc, Mutex};

use releng_core::{
    declared_from_config, registry_from_config, ActionPipeline, ActionResult, ActionSelection,
    ActionSpec, ConfigLayer, ConfigStore, HandlerRegistry, HarnessError, PipelineContext,
    PipelineState, RunStatus, Severity, EXIT_ABORTED, EXIT_FAILURE, EXIT_SUCCESS,
};

const RELEASE: [&str; 5] = ["clobber", "checkout", "build", "test", "upload"];

type Calls = Arc<Mutex<Vec<String>>>;

fn context() -> PipelineContext {
    PipelineContext::from_config(Arc::new(ConfigStore::load(vec![ConfigLayer::defaults()])))
        .expect("default context")
}

/// Register a recording handler for every name; `fail` maps names to results.
fn recording_registry(
    names: &[&str],
    calls: &Calls,
    fail: &[(&str, ActionResult)],
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for name in names {
        let calls = calls.clone();
        let action = name.to_string();
        let result = fail
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
            .unwrap_or(ActionResult::Success);
        registry = registry.with_fn(*name, move |_| {
            calls.lock().unwrap().push(action.clone());
            result.clone()
        });
    }
    registry
}

fn names(result: &releng_core::RunResult) -> Vec<&str> {
    result.outcomes.iter().map(|o| o.action.as_str()).collect()
}

/// Test: skipping one action runs the rest in declared order
#[tokio::test]
async fn test_skip_runs_remaining_in_order() {
    let calls = Calls::default();
    let declared = ActionSpec::declare(&RELEASE, None).unwrap();
    let mut pipeline = ActionPipeline::new(
        declared,
        &ActionSelection::new().skip(["test"]),
        recording_registry(&RELEASE, &calls, &[]),
        context(),
    )
    .unwrap();

    let result = pipeline.execute().await.expect("pipeline failed");

    assert_eq!(names(&result), vec!["clobber", "checkout", "build", "upload"]);
    assert!(result.outcomes.iter().all(|o| o.severity == Severity::Info));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.exit_code(), EXIT_SUCCESS);
    assert_eq!(pipeline.state(), &PipelineState::Completed);
    assert_eq!(*calls.lock().unwrap(), vec!["clobber", "checkout", "build", "upload"]);
}

/// Test: a fatal action aborts and later actions are never invoked
#[tokio::test]
async fn test_fatal_aborts_remaining_actions() {
    let calls = Calls::default();
    let declared = ActionSpec::declare(&RELEASE, None).unwrap();
    let mut pipeline = ActionPipeline::new(
        declared,
        &ActionSelection::new(),
        recording_registry(
            &RELEASE,
            &calls,
            &[("build", ActionResult::Fatal("compiler crashed".to_string()))],
        ),
        context(),
    )
    .unwrap();

    let err = pipeline.execute().await.unwrap_err();
    let HarnessError::HandlerFatal {
        action,
        message,
        result,
    } = err
    else {
        panic!("expected HandlerFatal");
    };

    assert_eq!(action, "build");
    assert_eq!(message, "compiler crashed");
    assert_eq!(names(&result), vec!["clobber", "checkout", "build"]);
    assert_eq!(result.outcomes.last().map(|o| o.severity), Some(Severity::Fatal));
    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.exit_code(), EXIT_ABORTED);
    // The plan still lists what would have run.
    assert_eq!(result.plan.len(), 5);
    assert_eq!(*calls.lock().unwrap(), vec!["clobber", "checkout", "build"]);

    assert_eq!(pipeline.state(), &PipelineState::Aborted);
    assert_eq!(pipeline.result(), Some(result.as_ref()));

    let rendered = result.render();
    assert!(rendered.text.contains("FATAL\n- build: compiler crashed"));
    assert_eq!(rendered.worst, Some(Severity::Fatal));
}

/// Test: a recoverable failure is recorded and later actions still run
#[tokio::test]
async fn test_recoverable_failure_continues() {
    let calls = Calls::default();
    let declared = ActionSpec::declare(&RELEASE, None).unwrap();
    let mut pipeline = ActionPipeline::new(
        declared,
        &ActionSelection::new(),
        recording_registry(
            &RELEASE,
            &calls,
            &[("test", ActionResult::Recoverable("3 tests failed".to_string()))],
        ),
        context(),
    )
    .unwrap();

    let result = pipeline.execute().await.expect("recoverable failures are not raised");

    assert_eq!(names(&result), RELEASE.to_vec());
    assert_eq!(result.outcomes[3].severity, Severity::Error);
    assert_eq!(result.outcomes[3].message, "3 tests failed");
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.exit_code(), EXIT_FAILURE);
    assert_eq!(result.failed_count(), 1);
    assert!(calls.lock().unwrap().contains(&"upload".to_string()));
}

/// Test: execution order follows declaration, not request order
#[tokio::test]
async fn test_only_runs_in_declared_order() {
    let calls = Calls::default();
    let all = ["A", "B", "C", "D"];
    let declared = ActionSpec::declare(&all, None).unwrap();
    let mut pipeline = ActionPipeline::new(
        declared,
        &ActionSelection::new().only(["D", "B"]),
        recording_registry(&all, &calls, &[]),
        context(),
    )
    .unwrap();

    assert_eq!(pipeline.plan(), ["B".to_string(), "D".to_string()]);
    let result = pipeline.execute().await.unwrap();
    assert_eq!(names(&result), vec!["B", "D"]);
    assert_eq!(*calls.lock().unwrap(), vec!["B", "D"]);
}

/// Test: a pipeline runs exactly once
#[tokio::test]
async fn test_second_execute_fails_and_keeps_result() {
    let calls = Calls::default();
    let declared = ActionSpec::declare(&RELEASE, None).unwrap();
    let mut pipeline = ActionPipeline::new(
        declared,
        &ActionSelection::new(),
        recording_registry(&RELEASE, &calls, &[]),
        context(),
    )
    .unwrap();

    let first = pipeline.execute().await.unwrap();
    let err = pipeline.execute().await.unwrap_err();

    assert!(matches!(err, HarnessError::AlreadyExecuted));
    assert_eq!(pipeline.result(), Some(&first));
    assert_eq!(calls.lock().unwrap().len(), RELEASE.len());
}

/// Test: unknown selection names fail before anything runs
#[tokio::test]
async fn test_unknown_selection_fails_at_construction() {
    let calls = Calls::default();
    let declared = ActionSpec::declare(&RELEASE, None).unwrap();
    let err = ActionPipeline::new(
        declared,
        &ActionSelection::new().add(["deploy"]),
        recording_registry(&RELEASE, &calls, &[]),
        context(),
    )
    .err()
    .expect("construction should fail");

    assert!(matches!(err, HarnessError::UnknownAction { name } if name == "deploy"));
    assert!(calls.lock().unwrap().is_empty());
}

/// Test: digest is stable for the same plan and recorded in the result
#[tokio::test]
async fn test_digest_recorded_in_result() {
    let declared = ActionSpec::declare(&RELEASE, None).unwrap();
    let calls = Calls::default();
    let mut pipeline = ActionPipeline::new(
        declared.clone(),
        &ActionSelection::new(),
        recording_registry(&RELEASE, &calls, &[]),
        context(),
    )
    .unwrap();
    let other = ActionPipeline::new(
        declared,
        &ActionSelection::new().skip(["upload"]),
        recording_registry(&RELEASE, &calls, &[]),
        context(),
    )
    .unwrap();

    let digest = pipeline.digest();
    assert_eq!(digest.len(), 64);
    assert_ne!(digest, other.digest());

    let result = pipeline.execute().await.unwrap();
    assert_eq!(result.plan_digest, digest);
    assert!(!result.run_id.is_empty());
}

/// Test: entries a handler adds land right after its own outcome
#[tokio::test]
async fn test_handler_summary_entries_follow_outcome() {
    let declared = ActionSpec::declare(&["build", "upload"], None).unwrap();
    let registry = HandlerRegistry::new()
        .with_fn("build", |ctx| {
            ctx.add_summary(Severity::Warning, "3 compiler warnings");
            ctx.add_summary(Severity::Info, "objdir reused");
            ActionResult::Success
        })
        .with_fn("upload", |_| ActionResult::Success);
    let mut pipeline =
        ActionPipeline::new(declared, &ActionSelection::new(), registry, context()).unwrap();

    let result = pipeline.execute().await.unwrap();

    let entries: Vec<(&str, Severity, &str)> = result
        .outcomes
        .iter()
        .map(|o| (o.action.as_str(), o.severity, o.message.as_str()))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("build", Severity::Info, "completed"),
            ("build", Severity::Warning, "3 compiler warnings"),
            ("build", Severity::Info, "objdir reused"),
            ("upload", Severity::Info, "completed"),
        ]
    );
    assert_eq!(result.exit_code(), EXIT_SUCCESS);
    assert_eq!(result.failed_count(), 0);

    let rendered = result.render();
    assert!(rendered
        .text
        .contains("WARNING\n- build: 3 compiler warnings\n"));
    assert_eq!(rendered.worst, Some(Severity::Warning));
}

/// Test: a handler-added error fails the run even though the action succeeded
#[tokio::test]
async fn test_handler_summary_error_sets_exit_code() {
    let declared = ActionSpec::declare(&["test"], None).unwrap();
    let registry = HandlerRegistry::new().with_fn("test", |ctx| {
        ctx.add_summary(Severity::Error, "2 tests marked as unexpected pass");
        ActionResult::Success
    });
    let mut pipeline =
        ActionPipeline::new(declared, &ActionSelection::new(), registry, context()).unwrap();

    let result = pipeline.execute().await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.exit_code(), EXIT_FAILURE);
    assert!(result
        .render()
        .text
        .contains("ERROR\n- test: 2 tests marked as unexpected pass"));
}

/// Test: a pipeline built entirely from configuration, including noop mode
#[tokio::test]
async fn test_config_driven_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("build");
    let marker = dir.path().join("built");
    std::fs::create_dir_all(work_dir.join("obj")).unwrap();

    let config_path = dir.path().join("release.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "all_actions": ["clobber", "build", "package"],
            "default_actions": ["clobber", "build"],
            "base_dir": dir.path(),
            "work_dir": "%(base_dir)s/build",
            "env": { "RELENG_TARGET": "linux64" },
            "actions": {
                "build": {
                    "command": "test \"$RELENG_TARGET\" = linux64 && touch %(base_dir)s/built",
                    "halt_on_failure": true,
                },
                "package": { "command": ["false"] },
            },
        })
        .to_string(),
    )
    .unwrap();

    let load = |overrides: &[&str]| {
        let config = ConfigStore::load(vec![
            ConfigLayer::defaults(),
            ConfigLayer::from_file(&config_path).unwrap(),
            ConfigLayer::from_overrides(overrides).unwrap(),
        ])
        .interpolate()
        .unwrap();
        let config = Arc::new(config);
        let declared = declared_from_config(&config).unwrap();
        let registry = registry_from_config(&config).unwrap();
        (declared, registry, PipelineContext::from_config(config).unwrap())
    };

    // Noop: nothing is removed or created, every action still succeeds.
    let (declared, registry, ctx) = load(&["noop=true"]);
    let mut pipeline = ActionPipeline::new(
        declared,
        &ActionSelection::new().add(["package"]),
        registry,
        ctx,
    )
    .unwrap();
    let result = pipeline.execute().await.unwrap();
    assert_eq!(result.exit_code(), EXIT_SUCCESS);
    assert!(work_dir.exists());
    assert!(!marker.exists());

    // Real run: clobber removes the interpolated work_dir, build sees the global env.
    let (declared, registry, ctx) = load(&[]);
    let mut pipeline =
        ActionPipeline::new(declared, &ActionSelection::new(), registry, ctx).unwrap();
    let result = pipeline.execute().await.unwrap();
    assert_eq!(names(&result), vec!["clobber", "build"]);
    assert_eq!(result.exit_code(), EXIT_SUCCESS);
    assert!(!work_dir.exists());
    assert!(marker.exists());

    // A failing command without halt_on_failure is recoverable.
    let (declared, registry, ctx) = load(&[]);
    let mut pipeline = ActionPipeline::new(
        declared,
        &ActionSelection::new().only(["package"]),
        registry,
        ctx,
    )
    .unwrap();
    let result = pipeline.execute().await.unwrap();
    assert_eq!(result.outcomes[0].severity, Severity::Error);
    assert!(result.outcomes[0].message.contains("exited with code 1"));
    assert_eq!(result.exit_code(), EXIT_FAILURE);
}

/// Test: a command action creates its cwd and copies artifacts out afterwards
#[tokio::test]
async fn test_command_action_cwd_and_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let objdir = dir.path().join("obj/firefox");
    let upload = dir.path().join("upload/linux64/firefox.tar");

    let config = |noop: bool| {
        let layer = ConfigLayer::from_overrides([
            "all_actions=[\"package\"]".to_string(),
            format!("noop={noop}"),
            format!(
                "actions={}",
                serde_json::json!({
                    "package": {
                        "command": "echo packaged > firefox.tar",
                        "cwd": objdir,
                        "artifacts": [{ "from": objdir.join("firefox.tar"), "to": upload }],
                    },
                })
            ),
        ])
        .unwrap();
        Arc::new(ConfigStore::load(vec![ConfigLayer::defaults(), layer]))
    };
    let run = |config: Arc<ConfigStore>| async move {
        let declared = declared_from_config(&config).unwrap();
        let registry = registry_from_config(&config).unwrap();
        let ctx = PipelineContext::from_config(config).unwrap();
        ActionPipeline::new(declared, &ActionSelection::new(), registry, ctx)
            .unwrap()
            .execute()
            .await
            .unwrap()
    };

    let result = run(config(true)).await;
    assert_eq!(result.exit_code(), EXIT_SUCCESS);
    assert!(!objdir.exists());

    let result = run(config(false)).await;
    assert_eq!(result.exit_code(), EXIT_SUCCESS, "{}", result.render().text);
    assert!(objdir.join("firefox.tar").is_file());
    assert_eq!(std::fs::read_to_string(&upload).unwrap(), "packaged\n");
}

/// Test: a failed artifact copy is reported against the action
#[tokio::test]
async fn test_missing_artifact_is_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let layer = ConfigLayer::from_overrides([
        "all_actions=[\"package\"]".to_string(),
        format!(
            "actions={}",
            serde_json::json!({
                "package": {
                    "command": ["true"],
                    "artifacts": [{
                        "from": dir.path().join("absent.tar"),
                        "to": dir.path().join("upload/absent.tar"),
                    }],
                },
            })
        ),
    ])
    .unwrap();
    let config = Arc::new(ConfigStore::load(vec![ConfigLayer::defaults(), layer]));
    let declared = declared_from_config(&config).unwrap();
    let registry = registry_from_config(&config).unwrap();
    let ctx = PipelineContext::from_config(config).unwrap();
    let mut pipeline =
        ActionPipeline::new(declared, &ActionSelection::new(), registry, ctx).unwrap();

    let result = pipeline.execute().await.unwrap();

    assert_eq!(result.outcomes[0].severity, Severity::Error);
    assert!(result.outcomes[0].message.starts_with("failed to copy"));
    assert_eq!(result.exit_code(), EXIT_FAILURE);
}
