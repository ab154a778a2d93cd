//! Pipeline Integration Tests
//!
//! Tests for YAML pipelines driven end to end through command steps.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use jobscout::core::{
    CallGovernor, CheckpointStore, FileCheckpointStore, JobStage, Orchestrator, Pipeline,
    PriceTable, UnitPrice,
};
use jobscout::domain::{BudgetLimits, FailureKind, RunConfig, RunStatus};

fn governor() -> Arc<CallGovernor> {
    Arc::new(CallGovernor::new(
        PriceTable::new().with_price("m", UnitPrice::flat(0.1)),
    ))
}

fn shell_pipeline(steps: &[(&str, &str)]) -> Pipeline {
    let mut yaml = String::from("name: shell\nsteps:\n");
    for (name, script) in steps {
        yaml.push_str(&format!(
            "  - name: {}\n    command: sh\n    args: [\"-c\", {:?}]\n    retry_policy:\n      max_attempts: 2\n      initial_delay_ms: 1\n      max_delay_ms: 1\n",
            name, script
        ));
    }
    Pipeline::from_yaml(&yaml).unwrap()
}

#[test]
fn test_bundled_job_search_pipeline() {
    let pipeline = Pipeline::from_file(Path::new("pipelines/job_search.yaml")).unwrap();

    assert!(pipeline.validate().is_ok());
    assert!(pipeline.job_search_order_warnings().is_empty());

    let names: Vec<_> = pipeline.steps.iter().map(|s| s.name.as_str()).collect();
    let canonical: Vec<_> = JobStage::ALL.iter().map(|s| s.as_str()).collect();
    assert_eq!(names, canonical);

    let scrape = pipeline.get_step("scrape_postings").unwrap();
    assert_eq!(scrape.timeout(), Some(Duration::from_secs(1800)));
    assert_eq!(scrape.retry_policy.max_attempts, 1);

    let registry = pipeline.to_registry(governor()).unwrap();
    assert_eq!(registry.len(), 8);
    assert_eq!(registry.position("notify"), Some(7));
}

#[test]
fn test_invalid_pipelines_rejected() {
    let empty = Pipeline::from_yaml("name: empty\nsteps: []\n").unwrap();
    assert!(empty.validate().is_err());
    assert!(empty.to_registry(governor()).is_err());

    let bad_name = Pipeline::from_yaml("name: p\nsteps:\n  - name: a--b\n    command: x\n").unwrap();
    assert!(bad_name.validate().is_err());

    let no_command = Pipeline::from_yaml("name: p\nsteps:\n  - name: a\n    command: \"\"\n").unwrap();
    assert!(no_command.validate().is_err());

    assert!(Pipeline::from_yaml("name: p\nsteps:\n  - command: x\n").is_err());
}

#[tokio::test]
async fn test_command_pipeline_runs_and_checkpoints() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(temp.path()));

    let pipeline = shell_pipeline(&[
        (
            "parse_resume",
            r#"cat >/dev/null; echo '{"output": {"skills": ["rust"]}, "usage": [{"kind": "m", "input_units": 1000, "output_units": 1000}]}'"#,
        ),
        (
            "score",
            r#"cat >/dev/null; echo '{"output": [{"company": "acme", "score": 0.9}], "failures": [{"message": "posting 12 had no salary", "target": "12"}]}'"#,
        ),
    ]);

    let orchestrator = Orchestrator::new(pipeline.to_registry(governor()).unwrap())
        .unwrap()
        .with_checkpoints(store.clone());

    let outcome = orchestrator
        .run(RunConfig::new("shell-1").with_pipeline("shell").with_input("resume", "cv.pdf"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    assert!((outcome.total_cost - 0.2).abs() < 1e-9);
    assert_eq!(outcome.total_units, 2000);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].kind, FailureKind::Other);
    assert_eq!(outcome.failures[0].origin, "score");

    let state = store
        .load_latest("shell-1")
        .await
        .unwrap()
        .unwrap()
        .restore()
        .unwrap();
    assert_eq!(state.last_completed(), Some("score"));
    assert_eq!(state.config.pipeline.as_deref(), Some("shell"));
    assert_eq!(state.output("parse_resume").unwrap()["skills"][0], "rust");
}

#[tokio::test]
async fn test_failing_command_is_retried_then_fails_run() {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("attempts");
    let script = format!(
        "cat >/dev/null; echo attempt >> '{}'; echo 'site unreachable' >&2; exit 7",
        counter.display()
    );
    let pipeline = shell_pipeline(&[("discover_companies", script.as_str())]);

    let outcome = Orchestrator::new(pipeline.to_registry(governor()).unwrap())
        .unwrap()
        .run(RunConfig::new("shell-2"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.halted_at.as_deref(), Some("discover_companies"));

    let attempts = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(attempts.lines().count(), 2);

    let fatal = outcome.fatal_failures().last().unwrap();
    assert!(fatal.message.contains("exit code 7"));
    assert!(fatal.message.contains("site unreachable"));
}

#[tokio::test]
async fn test_command_usage_can_exhaust_budget() {
    let pipeline = shell_pipeline(&[
        (
            "scrape_postings",
            r#"cat >/dev/null; echo '{"output": [], "usage": [{"kind": "m", "input_units": 3000}, {"kind": "m", "input_units": 3000}]}'"#,
        ),
        ("notify", "cat >/dev/null; echo '{}'"),
    ]);

    let config = RunConfig::new("shell-3").with_budget(BudgetLimits::with_ceiling(0.5));
    let outcome = Orchestrator::new(pipeline.to_registry(governor()).unwrap())
        .unwrap()
        .run(config)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Partial);
    assert_eq!(outcome.halted_at.as_deref(), Some("scrape_postings"));
    assert!((outcome.total_cost - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_fan_out_step_reports_unit_counts() {
    let pipeline = shell_pipeline(&[(
        "scrape_postings",
        r#"cat >/dev/null; echo '{"output": ["a", "b"], "units": {"attempted": 3, "succeeded": 2}, "failures": [{"kind": "unit_error", "message": "careers page timed out", "target": "acme"}]}'"#,
    )]);

    let outcome = Orchestrator::new(pipeline.to_registry(governor()).unwrap())
        .unwrap()
        .run(RunConfig::new("shell-4"))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.units_attempted, 3);
    assert_eq!(outcome.units_succeeded, 2);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].kind, FailureKind::UnitError);
    assert_eq!(outcome.failures[0].target.as_deref(), Some("acme"));
}
