// tests/workflow_engine.rs

mod common;
use crate::common::{FakeJobExecutor, expect_err, init_tracing, with_timeout};

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use bundlectl::context::Context;
use bundlectl::engine::{JobState, StageScheduler, WorkflowEngine};
use bundlectl::errors::ErrorKind;
use bundlectl::secrets::memory::MemorySecretStore;
use bundlectl::storage::memory::MemoryDocumentStore;
use bundlectl::storage::{InstallationSpec, Sanitizer, Storage};
use bundlectl::types::ResultStatus;
use bundlectl::workflow::{Job, Stage, Workflow, WorkflowSpec};
use proptest::prelude::*;

type TestResult = Result<(), Box<dyn Error>>;

fn triples(jobs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>, bool)> {
    jobs.iter()
        .map(|(k, deps)| {
            (
                k.to_string(),
                deps.iter().map(|d| d.to_string()).collect(),
                false,
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// StageScheduler
// ---------------------------------------------------------------------------

#[test]
fn diamond_is_handed_out_in_dependency_order() -> TestResult {
    init_tracing();
    let mut s = StageScheduler::from_jobs(
        triples(&[("d", &["b", "c"]), ("c", &["a"]), ("b", &["a"]), ("a", &[])]),
        &BTreeSet::new(),
    )?;
    assert_eq!(s.order(), ["a", "b", "c", "d"]);

    assert_eq!(s.collect_ready(10), vec!["a"]);
    assert_eq!(s.state("a"), Some(JobState::Running));
    assert!(s.collect_ready(10).is_empty());
    assert!(!s.is_finished());

    s.complete("a", true, "");
    assert_eq!(s.collect_ready(1), vec!["b"]);
    assert_eq!(s.collect_ready(1), vec!["c"]);
    assert_eq!(s.running(), 2);
    s.complete("c", true, "");
    assert!(s.collect_ready(10).is_empty());
    s.complete("b", true, "");
    assert_eq!(s.collect_ready(10), vec!["d"]);
    s.complete("d", true, "");

    assert!(s.all_succeeded());
    assert!(s.is_finished());
    assert!(s.first_failure().is_none());
    Ok(())
}

#[test]
fn first_failure_stops_new_work() -> TestResult {
    init_tracing();
    let mut s = StageScheduler::from_jobs(
        triples(&[("a", &[]), ("b", &[]), ("c", &["a"])]),
        &BTreeSet::new(),
    )?;
    assert_eq!(s.collect_ready(2), vec!["a", "b"]);
    s.complete("b", false, "disk full");
    assert!(s.collect_ready(10).is_empty());
    // "a" is still running and must drain first.
    assert!(!s.is_finished());
    s.complete("a", true, "");
    assert!(s.is_finished());
    assert_eq!(s.state("c"), Some(JobState::Pending));
    assert_eq!(
        s.first_failure(),
        Some(&("b".to_string(), "disk full".to_string()))
    );
    assert!(!s.all_succeeded());
    Ok(())
}

#[test]
fn succeeded_jobs_are_skipped() -> TestResult {
    init_tracing();
    let mut jobs = triples(&[("a", &[]), ("b", &["a"])]);
    jobs[0].2 = true;
    let mut s = StageScheduler::from_jobs(jobs, &BTreeSet::new())?;
    assert_eq!(s.state("a"), Some(JobState::Succeeded));
    assert_eq!(s.collect_ready(10), vec!["b"]);
    Ok(())
}

#[test]
fn dependencies_outside_the_stage_must_be_satisfied() {
    init_tracing();
    let jobs = triples(&[("b", &["a"])]);
    let err = expect_err(StageScheduler::from_jobs(jobs.clone(), &BTreeSet::new()));
    assert_eq!(err.kind(), ErrorKind::InvariantViolated);

    let satisfied: BTreeSet<String> = ["a".to_string()].into();
    let mut s = StageScheduler::from_jobs(jobs, &satisfied).unwrap();
    assert_eq!(s.collect_ready(1), vec!["b"]);
}

#[test]
fn cyclic_stages_are_rejected() {
    init_tracing();
    let err = expect_err(StageScheduler::from_jobs(
        triples(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]),
        &BTreeSet::new(),
    ));
    assert_eq!(err.kind(), ErrorKind::InvariantViolated);
    assert!(err.to_string().contains("a, b"), "{err}");
}

#[test]
fn job_state_terminality() {
    assert!(JobState::Succeeded.is_terminal());
    assert!(JobState::Failed.is_terminal());
    assert!(!JobState::Running.is_terminal());
    assert!(!JobState::Pending.is_terminal());
}

/// Job `i` may depend only on jobs with a lower index.
fn stage_graph() -> impl Strategy<Value = (Vec<Vec<usize>>, usize)> {
    (1usize..10, 1usize..4).prop_flat_map(|(n, cap)| {
        let deps = (0..n)
            .map(|i| proptest::collection::btree_set(0..i.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>()
            .prop_map(|sets| {
                sets.into_iter()
                    .enumerate()
                    .map(|(i, s)| s.into_iter().filter(|d| *d < i).collect::<Vec<usize>>())
                    .collect::<Vec<Vec<usize>>>()
            });
        (deps, Just(cap))
    })
}

proptest! {
    #[test]
    fn every_job_runs_once_after_its_dependencies((deps, cap) in stage_graph()) {
        let jobs: Vec<(String, Vec<String>, bool)> = deps
            .iter()
            .enumerate()
            .map(|(i, ds)| (format!("j{i}"), ds.iter().map(|d| format!("j{d}")).collect(), false))
            .collect();
        let mut s = StageScheduler::from_jobs(jobs, &BTreeSet::new()).unwrap();

        let mut finished: Vec<String> = Vec::new();
        let mut rounds = 0;
        while !s.is_finished() {
            let batch = s.collect_ready(cap);
            prop_assert!(!batch.is_empty());
            prop_assert!(batch.len() <= cap);
            prop_assert!(s.running() <= cap);
            for key in batch {
                s.complete(&key, true, "");
                finished.push(key);
            }
            rounds += 1;
            prop_assert!(rounds <= deps.len());
        }

        prop_assert!(s.all_succeeded());
        prop_assert_eq!(finished.len(), deps.len());
        let pos: BTreeMap<&str, usize> = finished
            .iter()
            .enumerate()
            .map(|(i, k)| (k.as_str(), i))
            .collect();
        for (i, ds) in deps.iter().enumerate() {
            for d in ds {
                let mine = format!("j{i}");
                let theirs = format!("j{d}");
                prop_assert!(pos[theirs.as_str()] < pos[mine.as_str()]);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

fn storage() -> Storage {
    Storage::new(
        Arc::new(MemoryDocumentStore::new()),
        Sanitizer::new(Arc::new(MemorySecretStore::default())),
    )
}

fn stage(jobs: &[(&str, &[&str])]) -> Stage {
    let jobs = jobs
        .iter()
        .map(|(key, deps)| {
            (
                key.to_string(),
                Job {
                    key: key.to_string(),
                    action: "install".to_string(),
                    installation: InstallationSpec::new("dev", *key),
                    depends: deps.iter().map(|d| d.to_string()).collect(),
                    ..Default::default()
                },
            )
        })
        .collect();
    Stage { jobs }
}

fn workflow(stages: Vec<Stage>, max_parallel: usize) -> Workflow {
    Workflow::new(
        "dev",
        "app",
        WorkflowSpec {
            max_parallel,
            stages,
            ..Default::default()
        },
    )
}

fn status(wf: &Workflow, key: &str) -> Option<ResultStatus> {
    wf.get_job(key).and_then(|j| j.status.status)
}

#[tokio::test]
async fn successful_workflow_records_every_job() -> TestResult {
    init_tracing();
    let store = storage();
    let exec = FakeJobExecutor::new();
    let engine = WorkflowEngine::new(store.clone(), Arc::new(exec.clone()), 0);
    let ctx = Context::default();

    let mut wf = workflow(
        vec![stage(&[("root", &["mysql", "redis"]), ("mysql", &[]), ("redis", &[])])],
        1,
    );
    engine.run_workflow(&ctx, &mut wf).await?;

    assert!(!wf.id.is_empty());
    assert_eq!(exec.executed(), vec!["mysql", "redis", "root"]);
    assert_eq!(wf.status.status, Some(ResultStatus::Succeeded));
    let root = wf.get_job("root").unwrap();
    assert_eq!(root.status.last_run_id, "run-root");
    assert_eq!(root.status.last_result_id, "result-root");
    assert_eq!(root.status.result_ids, vec!["result-root"]);

    let stored = store.get_workflow(&ctx, &wf.id).await?;
    assert_eq!(stored.status.status, Some(ResultStatus::Succeeded));
    assert!(stored.jobs().all(|j| j.status.is_succeeded()));
    Ok(())
}

#[tokio::test]
async fn later_stages_see_earlier_stages_as_done() -> TestResult {
    init_tracing();
    let exec = FakeJobExecutor::new();
    let engine = WorkflowEngine::new(storage(), Arc::new(exec.clone()), 0);
    let mut wf = workflow(vec![stage(&[("a", &[])]), stage(&[("b", &["a"])])], 0);
    engine.run_workflow(&Context::default(), &mut wf).await?;
    assert_eq!(exec.executed(), vec!["a", "b"]);
    Ok(())
}

#[tokio::test]
async fn parallelism_is_bounded() -> TestResult {
    init_tracing();
    let exec = FakeJobExecutor::new().with_delay(Duration::from_millis(50));
    let engine = WorkflowEngine::new(storage(), Arc::new(exec.clone()), 0);
    let jobs: &[(&str, &[&str])] = &[("a", &[]), ("b", &[]), ("c", &[]), ("d", &[])];

    let mut wf = workflow(vec![stage(jobs)], 2);
    with_timeout(engine.run_workflow(&Context::default(), &mut wf)).await?;
    assert_eq!(exec.peak(), 2);

    let serial = FakeJobExecutor::new().with_delay(Duration::from_millis(10));
    let engine = WorkflowEngine::new(storage(), Arc::new(serial.clone()), 0);
    let mut wf = workflow(vec![stage(jobs)], 4);
    wf.spec.debug_mode = true;
    with_timeout(engine.run_workflow(&Context::default(), &mut wf)).await?;
    assert_eq!(serial.peak(), 1);
    assert_eq!(serial.executed(), vec!["a", "b", "c", "d"]);
    Ok(())
}

#[test]
fn parallelism_falls_back_to_engine_default() {
    let engine = WorkflowEngine::new(storage(), Arc::new(FakeJobExecutor::new()), 3);
    let mut wf = workflow(vec![], 0);
    assert_eq!(engine.max_parallel(&wf), 3);
    wf.spec.max_parallel = 5;
    assert_eq!(engine.max_parallel(&wf), 5);
    wf.spec.debug_mode = true;
    assert_eq!(engine.max_parallel(&wf), 1);

    let cpus = WorkflowEngine::new(storage(), Arc::new(FakeJobExecutor::new()), 0);
    assert!(cpus.max_parallel(&workflow(vec![], 0)) >= 1);
}

#[tokio::test]
async fn failed_job_stops_dependents_and_fails_the_workflow() -> TestResult {
    init_tracing();
    let store = storage();
    let exec = FakeJobExecutor::new().fail("a");
    let engine = WorkflowEngine::new(store.clone(), Arc::new(exec.clone()), 0);
    let ctx = Context::default();

    let mut wf = workflow(vec![stage(&[("a", &[]), ("b", &["a"]), ("c", &[])])], 1);
    let err = expect_err(engine.run_workflow(&ctx, &mut wf).await);
    assert!(err.to_string().contains("job a failed: boom"), "{err}");

    assert_eq!(exec.executed(), vec!["a"]);
    assert_eq!(wf.status.status, Some(ResultStatus::Failed));
    assert_eq!(status(&wf, "a"), Some(ResultStatus::Failed));
    assert_eq!(status(&wf, "b"), None);
    assert_eq!(status(&wf, "c"), None);

    let stored = store.get_workflow(&ctx, &wf.id).await?;
    assert_eq!(stored.status.status, Some(ResultStatus::Failed));
    assert_eq!(stored.get_job("a").unwrap().status.message, "boom");
    Ok(())
}

#[tokio::test]
async fn executor_errors_abort_the_workflow() {
    init_tracing();
    let exec = FakeJobExecutor::new().error("a");
    let engine = WorkflowEngine::new(storage(), Arc::new(exec.clone()), 0);
    let mut wf = workflow(vec![stage(&[("a", &[]), ("b", &["a"])])], 1);
    let err = expect_err(engine.run_workflow(&Context::default(), &mut wf).await);
    assert_eq!(err.kind(), ErrorKind::InvariantViolated);
    assert_eq!(status(&wf, "a"), Some(ResultStatus::Failed));
    assert_eq!(wf.status.status, Some(ResultStatus::Failed));
    assert_eq!(exec.executed(), vec!["a"]);
}

#[tokio::test]
async fn canceled_job_cancels_the_workflow() {
    init_tracing();
    let exec = FakeJobExecutor::new().cancel("a");
    let engine = WorkflowEngine::new(storage(), Arc::new(exec), 0);
    let mut wf = workflow(vec![stage(&[("a", &[])])], 1);
    let err = expect_err(engine.run_workflow(&Context::default(), &mut wf).await);
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert_eq!(wf.status.status, Some(ResultStatus::Canceled));
    assert_eq!(status(&wf, "a"), Some(ResultStatus::Canceled));
}

#[tokio::test]
async fn interrupting_the_context_cancels_running_jobs() -> TestResult {
    init_tracing();
    let store = storage();
    let exec = FakeJobExecutor::new().with_delay(Duration::from_secs(30));
    let engine = WorkflowEngine::new(store.clone(), Arc::new(exec.clone()), 0);
    let ctx = Context::default();

    let trigger = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut wf = workflow(vec![stage(&[("a", &[]), ("b", &["a"])])], 1);
    let err = expect_err(with_timeout(engine.run_workflow(&ctx, &mut wf)).await);
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert_eq!(exec.executed(), vec!["a"]);

    // The outcome was saved despite the cancelled context.
    let stored = store.get_workflow(&Context::default(), &wf.id).await?;
    assert_eq!(stored.status.status, Some(ResultStatus::Canceled));
    assert_eq!(
        stored.get_job("a").unwrap().status.status,
        Some(ResultStatus::Canceled)
    );
    Ok(())
}

#[tokio::test]
async fn retry_reruns_only_unfinished_jobs() -> TestResult {
    init_tracing();
    let store = storage();
    let ctx = Context::default();
    let failing = FakeJobExecutor::new().fail("b");
    let engine = WorkflowEngine::new(store.clone(), Arc::new(failing), 0);
    let mut wf = workflow(vec![stage(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])], 1);
    expect_err(engine.run_workflow(&ctx, &mut wf).await);

    let healthy = FakeJobExecutor::new();
    let engine = WorkflowEngine::new(store.clone(), Arc::new(healthy.clone()), 0);
    let retried = engine.retry_workflow(&ctx, &wf.id).await?;
    assert_eq!(healthy.executed(), vec!["b", "c"]);
    assert_eq!(retried.status.status, Some(ResultStatus::Succeeded));
    assert!(retried.status.message.is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelled_workflows_refuse_to_run_until_retried() -> TestResult {
    init_tracing();
    let store = storage();
    let ctx = Context::default();
    let exec = FakeJobExecutor::new();
    let engine = WorkflowEngine::new(store.clone(), Arc::new(exec.clone()), 0);

    let mut wf = workflow(vec![stage(&[("a", &[])])], 1);
    store.upsert_workflow(&ctx, &mut wf).await?;
    let cancelled = engine.cancel_workflow(&ctx, &wf.id).await?;
    assert!(cancelled.status.cancel_requested);
    assert_eq!(cancelled.status.status, Some(ResultStatus::Canceled));

    let err = expect_err(engine.run_workflow_id(&ctx, &wf.id).await);
    assert_eq!(err.kind(), ErrorKind::Canceled);
    let err = expect_err(engine.step_through(&ctx, &wf.id, "a").await);
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(exec.executed().is_empty());

    let retried = engine.retry_workflow(&ctx, &wf.id).await?;
    assert!(!retried.status.cancel_requested);
    assert_eq!(retried.status.status, Some(ResultStatus::Succeeded));
    assert_eq!(exec.executed(), vec!["a"]);
    Ok(())
}

#[tokio::test]
async fn cancel_stored_mid_run_survives_job_completion() -> TestResult {
    init_tracing();
    let store = storage();
    let ctx = Context::default();
    let exec = FakeJobExecutor::new().with_delay(Duration::from_millis(150));
    let engine = WorkflowEngine::new(store.clone(), Arc::new(exec.clone()), 0);

    let mut wf = workflow(vec![stage(&[("a", &[]), ("b", &["a"])])], 1);
    store.upsert_workflow(&ctx, &mut wf).await?;

    // Another process cancels while "a" is still running.
    let other = store.clone();
    let id = wf.id.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let ctx = Context::default();
        let mut stored = other.get_workflow(&ctx, &id).await?;
        stored.status.cancel_requested = true;
        other.upsert_workflow(&ctx, &mut stored).await
    });

    let err = expect_err(with_timeout(engine.run_workflow(&ctx, &mut wf)).await);
    canceller.await??;
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert_eq!(exec.executed(), vec!["a"]);

    let stored = store.get_workflow(&ctx, &wf.id).await?;
    assert!(stored.status.cancel_requested);
    assert_eq!(stored.status.status, Some(ResultStatus::Canceled));
    assert_eq!(status(&stored, "a"), Some(ResultStatus::Succeeded));
    assert_eq!(status(&stored, "b"), None);
    Ok(())
}

#[tokio::test]
async fn stepping_runs_one_job_at_a_time() -> TestResult {
    init_tracing();
    let store = storage();
    let ctx = Context::default();
    let exec = FakeJobExecutor::new();
    let engine = WorkflowEngine::new(store.clone(), Arc::new(exec.clone()), 0);

    let mut wf = workflow(vec![stage(&[("a", &[]), ("b", &["a"])])], 1);
    store.upsert_workflow(&ctx, &mut wf).await?;

    let err = expect_err(engine.step_through(&ctx, &wf.id, "b").await);
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = expect_err(engine.step_through(&ctx, &wf.id, "z").await);
    assert!(err.is_not_found());

    let after_a = engine.step_through(&ctx, &wf.id, "a").await?;
    assert_eq!(status(&after_a, "a"), Some(ResultStatus::Succeeded));
    assert_eq!(after_a.status.status, None);

    let after_b = engine.step_through(&ctx, &wf.id, "b").await?;
    assert_eq!(after_b.status.status, Some(ResultStatus::Succeeded));
    assert_eq!(exec.executed(), vec!["a", "b"]);
    Ok(())
}

#[tokio::test]
async fn failed_steps_are_recorded() -> TestResult {
    init_tracing();
    let store = storage();
    let ctx = Context::default();
    let engine = WorkflowEngine::new(store.clone(), Arc::new(FakeJobExecutor::new().fail("a")), 0);
    let mut wf = workflow(vec![stage(&[("a", &[])])], 1);
    store.upsert_workflow(&ctx, &mut wf).await?;

    let err = expect_err(engine.step_through(&ctx, &wf.id, "a").await);
    assert!(err.to_string().contains("job a failed: boom"), "{err}");
    let stored = store.get_workflow(&ctx, &wf.id).await?;
    assert_eq!(status(&stored, "a"), Some(ResultStatus::Failed));
    Ok(())
}
