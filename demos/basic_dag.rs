//! Manual smoke test: runs a small synthetic DAG through the engine with
//! the interactive Status observer enabled.
//!
//! `A` and `B` run concurrently, `C` waits on both, `D` waits on `C`.

use std::sync::Arc;

use jobgraph::{EventSink, FunctionStage, Job, StageLogger};

fn sleepy(label: &'static str, millis: u64) -> FunctionStage {
    FunctionStage::new(
        label,
        Arc::new(move |logger: &StageLogger, _sink: &EventSink| {
            logger.out(&format!("{label} starting"));
            std::thread::sleep(std::time::Duration::from_millis(millis));
            logger.out(&format!("{label} done"));
            0
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let jobs = vec![
        Job::new("A", vec![], vec![sleepy("build", 150).into()])?,
        Job::new("B", vec![], vec![sleepy("build", 150).into()])?,
        Job::new("C", vec!["A".into(), "B".into()], vec![sleepy("link", 100).into()])?,
        Job::new("D", vec!["C".into()], vec![sleepy("package", 50).into()])?,
    ];

    let mut config = jobgraph::EngineConfig::default();
    config.status = Some(jobgraph::StatusConfig {
        label: "basic-dag".to_owned(),
        show_stage_events: true,
        ..jobgraph::StatusConfig::default()
    });

    let summary = jobgraph::run_jobs(jobs, config).await?;

    println!(
        "ran to completion: succeeded={} completed={} abandoned={}",
        summary.succeeded(),
        summary.completed.len(),
        summary.abandoned.len()
    );

    Ok(())
}
