//! The scheduler: an admit/wait/promote loop moving Jobs through the five
//! partitions (pending, queued, active, completed, abandoned) until none
//! remain outside the terminal two.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use crate::error::{EngineError, EngineResult};
use crate::event::{AbandonReason, Event, EventSink, Jid, JobStatusSnapshot};
use crate::jobserver::Jobserver;
use crate::stage::Job;
use crate::RunSummary;

struct State {
    pending: BTreeSet<Jid>,
    queued: BTreeSet<Jid>,
    active: BTreeSet<Jid>,
    completed: BTreeMap<Jid, bool>,
    abandoned: BTreeMap<Jid, AbandonReason>,
}

impl State {
    fn snapshot(&self) -> JobStatusSnapshot {
        JobStatusSnapshot {
            pending: self.pending.iter().cloned().collect(),
            queued: self.queued.iter().cloned().collect(),
            active: self.active.iter().cloned().collect(),
            completed: self.completed.clone(),
            abandoned: self.abandoned.keys().cloned().collect(),
        }
    }

    fn done(&self) -> bool {
        self.pending.is_empty() && self.queued.is_empty() && self.active.is_empty()
    }
}

/// Runs every submitted Job to completion (or abandonment), respecting
/// dependency order and the jobserver's concurrency limit, and returns a
/// summary of the final state.
///
/// Jobs whose `deps` name an id not present in `jobs` are abandoned
/// immediately with [`AbandonReason::MissingDeps`], per
/// `EngineConfig::continue_without_deps` — see [`crate::config::EngineConfig`].
pub async fn run_jobs(
    jobs: Vec<Job>,
    continue_on_failure_default: bool,
    continue_without_deps: bool,
    jobserver: Jobserver,
    sink: EventSink,
) -> EngineResult<RunSummary> {
    let start = Instant::now();
    let jobs: HashMap<Jid, Arc<Job>> = jobs
        .into_iter()
        .map(|j| (j.jid.clone(), Arc::new(j)))
        .collect();

    if has_cycle(&jobs) {
        return Err(EngineError::NotADag);
    }

    // Reverse-dependency index: job id -> jobs that depend on it.
    let mut dependents: HashMap<Jid, Vec<Jid>> = HashMap::new();
    for job in jobs.values() {
        for dep in &job.deps {
            dependents.entry(dep.clone()).or_default().push(job.jid.clone());
        }
    }

    let mut state = State {
        pending: jobs.keys().cloned().collect(),
        queued: BTreeSet::new(),
        active: BTreeSet::new(),
        completed: BTreeMap::new(),
        abandoned: BTreeMap::new(),
    };

    // Jobs naming a dependency that was never submitted are unsatisfiable
    // and abandoned up front, regardless of `continue_without_deps` (that
    // flag governs transitive abandonment once a dep *runs and fails*, not
    // the case where a dep was never submitted at all).
    let mut missing_deps_jobs = Vec::new();
    for job in jobs.values() {
        let missing: Vec<Jid> = job.deps.iter().filter(|d| !jobs.contains_key(*d)).cloned().collect();
        if !missing.is_empty() {
            missing_deps_jobs.push((job.jid.clone(), missing));
        }
    }
    for (jid, dep_ids) in missing_deps_jobs {
        abandon(&mut state, &sink, start, &jid, AbandonReason::MissingDeps { dep_ids });
    }

    promote_ready(&jobs, &mut state, &sink, start);

    let mut tasks: JoinSet<(Jid, bool)> = JoinSet::new();
    let mut task_jids: HashMap<tokio::task::Id, Jid> = HashMap::new();
    let mut failure_seen = false;

    loop {
        // Admit as many queued jobs as the jobserver currently allows.
        while let Some(jid) = state.queued.iter().next().cloned() {
            match jobserver.try_acquire()? {
                Some(token) => {
                    state.queued.remove(&jid);
                    state.active.insert(jid.clone());
                    let _ = sink.send(Event::StartedJob {
                        time: start.elapsed(),
                        job_id: jid.clone(),
                    });
                    let job = jobs[&jid].clone();
                    let job_sink = sink.clone();
                    let job_jobserver = jobserver.clone();
                    let abort_handle = tasks.spawn(async move {
                        let result = crate::runtime::run_job(job, job_sink, start, job_jobserver).await;
                        drop(token);
                        result
                    });
                    task_jids.insert(abort_handle.id(), jid.clone());
                }
                None => break,
            }
        }

        if state.done() {
            break;
        }

        // No queued job could be admitted and nothing active: the run is
        // stuck (should be unreachable given a correct dependency graph,
        // but guards against starvation rather than looping forever).
        if state.active.is_empty() && tasks.is_empty() {
            break;
        }

        emit_status(&state, &sink, start);

        let Some(join_result) = tasks.join_next_with_id().await else {
            break;
        };

        let (jid, succeeded) = match join_result {
            Ok((task_id, result)) => {
                task_jids.remove(&task_id);
                result
            }
            Err(join_error) => {
                let failed_jid = task_jids
                    .remove(&join_error.id())
                    .unwrap_or_else(|| "<unknown>".to_owned());
                tracing::error!(error = %join_error, jid = %failed_jid, "job runtime task panicked or was cancelled");
                return Err(EngineError::JobRuntimePanicked(failed_jid));
            }
        };

        state.active.remove(&jid);
        state.completed.insert(jid.clone(), succeeded);
        let _ = sink.send(Event::FinishedJob {
            time: start.elapsed(),
            job_id: jid.clone(),
            succeeded,
        });

        if !succeeded {
            failure_seen = true;
            if !continue_on_failure_default {
                abandon_all_pending_and_queued(&mut state, &sink, start, &jid);
            } else {
                propagate_dep_failure(&dependents, &mut state, &sink, start, &jid, continue_without_deps);
            }
        }

        promote_ready(&jobs, &mut state, &sink, start);
    }

    emit_status(&state, &sink, start);

    Ok(RunSummary {
        completed: state.completed,
        abandoned: state.abandoned,
        any_failed: failure_seen,
    })
}

/// Moves every `pending` job whose dependencies are all `completed` (whether
/// they succeeded or not — failure propagation has already abandoned the
/// ones that need to be, per the active policy; anything still `pending`
/// once its deps are all `completed` is meant to run) into `queued`.
fn promote_ready(jobs: &HashMap<Jid, Arc<Job>>, state: &mut State, sink: &EventSink, start: Instant) {
    loop {
        let ready: Vec<Jid> = state
            .pending
            .iter()
            .filter(|jid| {
                jobs[*jid]
                    .deps
                    .iter()
                    .all(|dep| state.completed.contains_key(dep))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            break;
        }

        for jid in ready {
            state.pending.remove(&jid);
            state.queued.insert(jid.clone());
            let _ = sink.send(Event::QueuedJob {
                time: start.elapsed(),
                job_id: jid,
            });
        }
    }
}

/// `continue_on_failure == false`: abandon every not-yet-started job as
/// `PeerFailed`.
fn abandon_all_pending_and_queued(state: &mut State, sink: &EventSink, start: Instant, failed_jid: &str) {
    let victims: Vec<Jid> = state.pending.iter().chain(state.queued.iter()).cloned().collect();
    for jid in victims {
        state.pending.remove(&jid);
        state.queued.remove(&jid);
        abandon(
            state,
            sink,
            start,
            &jid,
            AbandonReason::PeerFailed {
                peer_job_id: failed_jid.to_owned(),
            },
        );
    }
}

/// `continue_on_failure == true, continue_without_deps == false`: abandon
/// only the failed job's transitive dependents, breadth-first.
///
/// `dep_job_id` stays fixed at `failed_jid` for the whole traversal;
/// `direct_dep_job_id` is the current BFS-frontier job, the immediate
/// ancestor each newly-discovered pending dependent chains through.
fn propagate_dep_failure(
    dependents: &HashMap<Jid, Vec<Jid>>,
    state: &mut State,
    sink: &EventSink,
    start: Instant,
    failed_jid: &str,
    continue_without_deps: bool,
) {
    if continue_without_deps {
        return;
    }

    // `ancestor` starts at the job that actually failed, then walks
    // outward through each newly-abandoned job's own dependents.
    let mut queue: VecDeque<Jid> = VecDeque::new();
    queue.push_back(failed_jid.to_owned());

    while let Some(ancestor) = queue.pop_front() {
        let Some(children) = dependents.get(&ancestor) else {
            continue;
        };

        for dependent in children.clone() {
            if !state.pending.contains(&dependent) {
                continue;
            }
            state.pending.remove(&dependent);
            abandon(
                state,
                sink,
                start,
                &dependent,
                AbandonReason::DepFailed {
                    dep_job_id: failed_jid.to_owned(),
                    direct_dep_job_id: ancestor.clone(),
                },
            );
            queue.push_back(dependent);
        }
    }
}

fn abandon(state: &mut State, sink: &EventSink, start: Instant, jid: &str, reason: AbandonReason) {
    state.abandoned.insert(jid.to_owned(), reason.clone());
    let _ = sink.send(Event::AbandonedJob {
        time: start.elapsed(),
        job_id: jid.to_owned(),
        reason,
    });
}

/// Detects a dependency cycle among the submitted jobs, ignoring `deps`
/// entries that name a job outside this set (those are reported separately
/// as [`AbandonReason::MissingDeps`], not a cycle).
fn has_cycle(jobs: &HashMap<Jid, Arc<Job>>) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(jid: &str, jobs: &HashMap<Jid, Arc<Job>>, marks: &mut HashMap<Jid, Mark>) -> bool {
        match marks.get(jid) {
            Some(Mark::Done) => return false,
            Some(Mark::Visiting) => return true,
            None => {}
        }
        marks.insert(jid.to_owned(), Mark::Visiting);
        if let Some(job) = jobs.get(jid) {
            for dep in &job.deps {
                if jobs.contains_key(dep) && visit(dep, jobs, marks) {
                    return true;
                }
            }
        }
        marks.insert(jid.to_owned(), Mark::Done);
        false
    }

    let mut marks = HashMap::new();
    jobs.keys().any(|jid| visit(jid, jobs, &mut marks))
}

fn emit_status(state: &State, sink: &EventSink, start: Instant) {
    let _ = sink.send(Event::JobStatus {
        time: start.elapsed(),
        status: state.snapshot(),
    });
}
