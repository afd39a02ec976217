use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A Job's identifier, unique within one scheduler run.
pub type Jid = String;

/// Why a Job was abandoned instead of ever being started.
///
/// Mirrors the three reasons a Job can leave `pending`/`queued` without
/// ever becoming `active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    /// One or more of this Job's `deps` do not name a submitted Job.
    MissingDeps {
        /// The unknown ids this Job depended on.
        dep_ids: Vec<Jid>,
    },
    /// An unrelated Job failed and `continue_on_failure` is false.
    PeerFailed {
        /// The Job whose failure triggered this abandonment.
        peer_job_id: Jid,
    },
    /// A dependency (directly or transitively) failed and
    /// `continue_without_deps` is false.
    DepFailed {
        /// The Job whose failure is the ultimate cause of this abandonment.
        dep_job_id: Jid,
        /// The immediate, directly-depended-upon ancestor in the chain from
        /// `dep_job_id` to this Job. Equal to `dep_job_id` when the failure
        /// is a direct dependency rather than a transitive one.
        direct_dep_job_id: Jid,
    },
}

/// A consistent snapshot of the five scheduler partitions at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusSnapshot {
    /// Jobs not yet ready: some dependency is incomplete.
    pub pending: Vec<Jid>,
    /// Jobs whose dependencies are all satisfied, awaiting a token.
    pub queued: Vec<Jid>,
    /// Jobs currently running, each holding one jobserver token.
    pub active: Vec<Jid>,
    /// Terminal: jid -> whether the job succeeded.
    pub completed: BTreeMap<Jid, bool>,
    /// Terminal: jobs that never ran.
    pub abandoned: Vec<Jid>,
}

/// An immutable event emitted by a Job, a Stage, or the Scheduler.
///
/// Every variant carries `time`, the duration elapsed since the engine's
/// run started; this is the "monotonic time" of the data model, not a wall
/// clock timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A consistent snapshot of the five scheduler partitions.
    JobStatus {
        /// Time elapsed since the run started.
        time: Duration,
        /// The snapshot itself.
        status: JobStatusSnapshot,
    },
    /// A Job's dependencies are all satisfied; it moved from `pending` to
    /// `queued`.
    QueuedJob {
        /// Time elapsed since the run started.
        time: Duration,
        /// The Job that was queued.
        job_id: Jid,
    },
    /// A Job acquired a token and began running.
    StartedJob {
        /// Time elapsed since the run started.
        time: Duration,
        /// The Job that started.
        job_id: Jid,
    },
    /// A Job's runtime finished executing all attempted stages.
    FinishedJob {
        /// Time elapsed since the run started.
        time: Duration,
        /// The Job that finished.
        job_id: Jid,
        /// Whether every attempted stage succeeded.
        succeeded: bool,
    },
    /// A Job was moved to the terminal `abandoned` partition without ever
    /// running.
    AbandonedJob {
        /// Time elapsed since the run started.
        time: Duration,
        /// The Job that was abandoned.
        job_id: Jid,
        /// Why.
        reason: AbandonReason,
    },
    /// A stage within a running Job started.
    StartedStage {
        /// Time elapsed since the run started.
        time: Duration,
        /// The owning Job.
        job_id: Jid,
        /// The stage's label.
        label: String,
    },
    /// A stage within a running Job finished.
    FinishedStage {
        /// Time elapsed since the run started.
        time: Duration,
        /// The owning Job.
        job_id: Jid,
        /// The stage's label.
        label: String,
        /// Whether the stage's exit code was zero.
        succeeded: bool,
        /// The stage's exit code (or 1 if it panicked/raised during dispatch).
        retcode: i32,
        /// The stage's buffered stdout.
        stdout: Vec<u8>,
        /// The stage's buffered stderr.
        stderr: Vec<u8>,
        /// The stage's buffered stdout and stderr, interleaved in receipt
        /// order.
        interleaved: Vec<u8>,
    },
    /// A raw chunk of stdout as it was produced.
    Stdout {
        /// Time elapsed since the run started.
        time: Duration,
        /// The owning Job.
        job_id: Jid,
        /// The stage's label.
        label: String,
        /// The raw bytes received.
        data: Vec<u8>,
    },
    /// A raw chunk of stderr as it was produced.
    Stderr {
        /// Time elapsed since the run started.
        time: Duration,
        /// The owning Job.
        job_id: Jid,
        /// The stage's label.
        label: String,
        /// The raw bytes received.
        data: Vec<u8>,
    },
}

impl Event {
    /// The duration elapsed since the run started, common to every variant.
    pub fn time(&self) -> Duration {
        match self {
            Event::JobStatus { time, .. }
            | Event::QueuedJob { time, .. }
            | Event::StartedJob { time, .. }
            | Event::FinishedJob { time, .. }
            | Event::AbandonedJob { time, .. }
            | Event::StartedStage { time, .. }
            | Event::FinishedStage { time, .. }
            | Event::Stdout { time, .. }
            | Event::Stderr { time, .. } => *time,
        }
    }
}

/// Sending half of the event stream; cloned freely by the scheduler driver
/// and every spawned Job runtime task.
pub type EventSink = tokio::sync::mpsc::UnboundedSender<Event>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::AbandonedJob {
            time: Duration::from_millis(42),
            job_id: "b".to_owned(),
            reason: AbandonReason::DepFailed {
                dep_job_id: "a".to_owned(),
                direct_dep_job_id: "a".to_owned(),
            },
        };

        let json = serde_json::to_string(&event).expect("event should serialize");
        let round_tripped: Event = serde_json::from_str(&json).expect("event should deserialize");
        assert_eq!(round_tripped.time(), event.time());
    }
}
