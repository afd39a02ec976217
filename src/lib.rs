//! A GNU-make-compatible parallel job execution engine.
//!
//! This crate schedules a set of dependent, multi-stage [`Job`]s across a
//! bounded pool of concurrency tokens ([`jobserver::Jobserver`]), the same
//! token-pipe protocol GNU `make` uses to coordinate parallelism across
//! process boundaries (`--jobserver-fds=R,W -j`), so a spawned `make` child
//! shares this engine's own concurrency budget instead of oversubscribing
//! the host.
//!
//! Jobs are scheduled as a DAG: a Job only becomes eligible to run once
//! every Job it depends on has completed, and a failure propagates to
//! dependents according to [`config::EngineConfig::continue_on_failure`]/
//! [`config::EngineConfig::continue_without_deps`]. Every state transition
//! is published as a typed [`Event`] on an MPSC channel, which a caller (or
//! this crate's own built-in Status observer) can consume to render
//! progress.
//!
//! The single entrypoint is [`run_jobs`].

#![deny(missing_docs, missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod event;
pub mod io;
pub mod jobserver;
mod observer;
mod runtime;
mod scheduler;
pub mod stage;

use std::collections::BTreeMap;

pub use config::{EngineConfig, MemLimit, StatusConfig};
pub use error::{EngineError, EngineResult};
pub use event::{AbandonReason, Event, EventSink, Jid, JobStatusSnapshot};
pub use io::StageLogger;
pub use jobserver::{Jobserver, Token};
pub use stage::{CommandStage, FunctionStage, Job, ProtocolFactory, Stage, StageFn};

/// The terminal outcome of a [`run_jobs`] call.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Every Job that reached a terminal runtime state, and whether it
    /// succeeded.
    pub completed: BTreeMap<Jid, bool>,
    /// Every Job abandoned without ever running, and why.
    pub abandoned: BTreeMap<Jid, AbandonReason>,
    /// Whether any submitted Job finished with `succeeded = false`.
    pub any_failed: bool,
}

impl RunSummary {
    /// The overall run succeeded iff every completed Job succeeded and
    /// nothing was abandoned.
    pub fn succeeded(&self) -> bool {
        !self.any_failed && self.abandoned.is_empty()
    }
}

/// Runs every Job in `jobs` to completion or abandonment, respecting
/// dependency order and `config`'s concurrency/failure-propagation policy.
///
/// Constructs a [`jobserver::Jobserver`] sized `config.max_jobs`, wires the
/// scheduler's event stream to the built-in Status observer when
/// `config.status` is set, and drives both to completion. Returns a typed
/// [`RunSummary`]; see [`error::EngineError`] for the conditions under which
/// this returns `Err` instead (jobserver construction failure, GNU make
/// probe I/O failure — never an individual Job or stage failure, which is
/// carried in-band on the returned summary).
pub async fn run_jobs(jobs: Vec<Job>, config: EngineConfig) -> EngineResult<RunSummary> {
    let mut seen = std::collections::HashSet::with_capacity(jobs.len());
    for job in &jobs {
        if !seen.insert(job.jid.clone()) {
            return Err(EngineError::DuplicateJobId(job.jid.clone()));
        }
    }

    let jobserver = Jobserver::new(&config)?;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let observer_task = config.status.clone().map(|status_cfg| {
        let max_jobs = jobserver.max_jobs();
        tokio::spawn(observer::run(rx, status_cfg, max_jobs))
    });

    let summary = scheduler::run_jobs(
        jobs,
        config.continue_on_failure,
        config.continue_without_deps,
        jobserver,
        tx,
    )
    .await?;

    if let Some(observer_task) = observer_task {
        let _ = observer_task.await;
    }

    Ok(summary)
}
