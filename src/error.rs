use std::io;

/// Errors that cross the `Result` boundary of this crate.
///
/// In-band job and stage failure are never represented here: they are carried
/// as `succeeded: bool` fields on [`crate::Event::FinishedJob`] and
/// [`crate::Event::FinishedStage`]. An `EngineError` means the engine itself
/// could not run at all, not that a job it ran failed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The jobserver's token pipe (or platform equivalent) could not be
    /// created, opened, or operated on.
    #[error("jobserver I/O error: {0}")]
    Jobserver(#[from] io::Error),

    /// The submitted jobs do not form a DAG under the caller's topological
    /// ordering invariant (a Job references itself, directly or transitively,
    /// among its own `deps` in a way the scheduler cannot resolve).
    #[error("submitted jobs are not a directed acyclic graph")]
    NotADag,

    /// Two or more submitted Jobs share a `jid`.
    #[error("duplicate job id: {0}")]
    DuplicateJobId(String),

    /// A Job was constructed with an empty `stages` list.
    #[error("job {0} has no stages")]
    EmptyJob(String),

    /// The probe for `make`'s jobserver protocol support failed to run at
    /// all (as opposed to running and reporting "unsupported", which is not
    /// an error — see [`crate::jobserver::Jobserver::make_args`]).
    #[error("failed to probe GNU make jobserver support: {0}")]
    GnuMakeProbeFailed(io::Error),

    /// A command stage was constructed with an empty argv.
    #[error("command stage {0} has an empty argv")]
    EmptyArgv(String),

    /// A Job runtime task panicked or was cancelled outside of the
    /// `catch_unwind` boundary each stage dispatch is wrapped in. This
    /// should only be reachable via a bug in the engine itself, never from a
    /// caller-supplied stage (those panics are converted to `retcode = 1`).
    #[error("job runtime task for {0} panicked unexpectedly")]
    JobRuntimePanicked(String),
}

/// Convenience alias used throughout the crate's fallible APIs.
pub type EngineResult<T> = Result<T, EngineError>;
