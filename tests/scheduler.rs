//! End-to-end scheduler scenarios driving `run_jobs` against small
//! synthetic DAGs built entirely from Function stages, so these tests have
//! no dependency on any external command.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use jobgraph::{EngineConfig, EventSink, FunctionStage, Job, StageLogger};

fn config() -> EngineConfig {
    EngineConfig {
        max_jobs: NonZeroUsize::new(4).unwrap(),
        gnu_make_enabled: false,
        ..EngineConfig::default()
    }
}

fn ok_stage(label: &'static str) -> FunctionStage {
    FunctionStage::new(label, Arc::new(|_: &StageLogger, _: &EventSink| 0))
}

fn failing_stage(label: &'static str) -> FunctionStage {
    FunctionStage::new(label, Arc::new(|_: &StageLogger, _: &EventSink| 1))
}

#[tokio::test]
async fn empty_input_succeeds_trivially() {
    let summary = jobgraph::run_jobs(vec![], config()).await.unwrap();
    assert!(summary.succeeded());
    assert!(summary.completed.is_empty());
    assert!(summary.abandoned.is_empty());
}

#[tokio::test]
async fn linear_chain_all_succeed() {
    let jobs = vec![
        Job::new("A", vec![], vec![ok_stage("s").into()]).unwrap(),
        Job::new("B", vec!["A".into()], vec![ok_stage("s").into()]).unwrap(),
        Job::new("C", vec!["B".into()], vec![ok_stage("s").into()]).unwrap(),
    ];

    let summary = jobgraph::run_jobs(jobs, config()).await.unwrap();
    assert!(summary.succeeded());
    assert_eq!(summary.completed.len(), 3);
    assert!(summary.completed.values().all(|&ok| ok));
}

#[tokio::test]
async fn diamond_middle_fails_default_policy_abandons_siblings() {
    let jobs = vec![
        Job::new("A", vec![], vec![ok_stage("s").into()]).unwrap(),
        Job::new("B", vec!["A".into()], vec![failing_stage("s").into()]).unwrap(),
        Job::new("C", vec!["A".into()], vec![ok_stage("s").into()]).unwrap(),
        Job::new("D", vec!["B".into(), "C".into()], vec![ok_stage("s").into()]).unwrap(),
    ];

    let mut cfg = config();
    cfg.continue_on_failure = false;

    let summary = jobgraph::run_jobs(jobs, cfg).await.unwrap();
    assert!(!summary.succeeded());
    assert_eq!(summary.completed.get("A"), Some(&true));
    assert_eq!(summary.completed.get("B"), Some(&false));
    assert!(summary.abandoned.contains_key("C"));
    assert!(summary.abandoned.contains_key("D"));
}

#[tokio::test]
async fn diamond_middle_fails_continue_on_failure_abandons_only_dependents() {
    let jobs = vec![
        Job::new("A", vec![], vec![ok_stage("s").into()]).unwrap(),
        Job::new("B", vec!["A".into()], vec![failing_stage("s").into()]).unwrap(),
        Job::new("C", vec!["A".into()], vec![ok_stage("s").into()]).unwrap(),
        Job::new("D", vec!["B".into(), "C".into()], vec![ok_stage("s").into()]).unwrap(),
    ];

    let mut cfg = config();
    cfg.continue_on_failure = true;
    cfg.continue_without_deps = false;

    let summary = jobgraph::run_jobs(jobs, cfg).await.unwrap();
    assert!(!summary.succeeded());
    assert_eq!(summary.completed.get("A"), Some(&true));
    assert_eq!(summary.completed.get("B"), Some(&false));
    assert_eq!(summary.completed.get("C"), Some(&true));
    assert!(summary.abandoned.contains_key("D"));
    assert!(!summary.completed.contains_key("D"));
}

#[tokio::test]
async fn continue_without_deps_runs_jobs_past_a_failed_dependency() {
    let jobs = vec![
        Job::new("A", vec![], vec![ok_stage("s").into()]).unwrap(),
        Job::new("B", vec!["A".into()], vec![failing_stage("s").into()]).unwrap(),
        Job::new("C", vec!["B".into()], vec![ok_stage("s").into()]).unwrap(),
    ];

    let mut cfg = config();
    cfg.continue_on_failure = true;
    cfg.continue_without_deps = true;

    let summary = jobgraph::run_jobs(jobs, cfg).await.unwrap();
    assert!(!summary.succeeded());
    assert_eq!(summary.completed.get("A"), Some(&true));
    assert_eq!(summary.completed.get("B"), Some(&false));
    assert_eq!(
        summary.completed.get("C"),
        Some(&true),
        "C must still be promoted and run even though its dependency B failed, \
         since continue_without_deps=true"
    );
    assert!(summary.abandoned.is_empty());
}

#[tokio::test]
async fn missing_dep_abandons_without_ever_starting() {
    let started = Arc::new(AtomicI32::new(0));
    let started_clone = started.clone();

    let stage = FunctionStage::new(
        "s",
        Arc::new(move |_: &StageLogger, _: &EventSink| {
            started_clone.fetch_add(1, Ordering::SeqCst);
            0
        }),
    );

    let jobs = vec![Job::new("X", vec!["Y".into()], vec![stage.into()]).unwrap()];

    let summary = jobgraph::run_jobs(jobs, config()).await.unwrap();
    assert!(!summary.succeeded());
    assert_eq!(started.load(Ordering::SeqCst), 0, "X must never have run");
    assert!(summary.abandoned.contains_key("X"));
    assert!(!summary.completed.contains_key("X"));
}

#[tokio::test]
async fn cyclic_deps_are_rejected_as_not_a_dag() {
    let jobs = vec![
        Job::new("A", vec!["B".into()], vec![ok_stage("s").into()]).unwrap(),
        Job::new("B", vec!["A".into()], vec![ok_stage("s").into()]).unwrap(),
    ];

    let err = jobgraph::run_jobs(jobs, config()).await.unwrap_err();
    assert!(matches!(err, jobgraph::EngineError::NotADag));
}

#[tokio::test]
async fn token_saturation_never_exceeds_max_jobs() {
    let sleepy = FunctionStage::new(
        "sleep",
        Arc::new(|_: &StageLogger, _: &EventSink| {
            std::thread::sleep(std::time::Duration::from_millis(100));
            0
        }),
    );

    let jobs: Vec<Job> = (0..10)
        .map(|i| Job::new(format!("job-{i}"), vec![], vec![sleepy.clone().into()]).unwrap())
        .collect();

    let mut cfg = config();
    cfg.max_jobs = NonZeroUsize::new(2).unwrap();

    let start = std::time::Instant::now();
    let summary = jobgraph::run_jobs(jobs, cfg).await.unwrap();
    let elapsed = start.elapsed();

    assert!(summary.succeeded());
    assert!(
        elapsed >= std::time::Duration::from_millis(450),
        "10 jobs at max_jobs=2, 100ms each, should take at least ~500ms; took {elapsed:?}"
    );
}
