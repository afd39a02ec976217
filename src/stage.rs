//! The Stage and Job model: the unit of work a Job runs one of ([`Stage`])
//! and the unit of scheduling ([`Job`]).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::event::{EventSink, Jid};
use crate::io::StageLogger;

/// A function a `Command`'s raw output chunk is passed through before it is
/// buffered/emitted, e.g. to strip a build tool's own line-buffering
/// artifacts.
pub type ProtocolFactory = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// A stage that spawns and awaits a child process.
#[derive(Clone)]
pub struct CommandStage {
    pub(crate) label: String,
    pub(crate) argv: Vec<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: Option<Vec<(String, String)>>,
    pub(crate) emulate_tty: bool,
    pub(crate) stderr_to_stdout: bool,
    pub(crate) protocol_factory: Option<ProtocolFactory>,
}

impl fmt::Debug for CommandStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStage")
            .field("label", &self.label)
            .field("argv", &self.argv)
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("emulate_tty", &self.emulate_tty)
            .field("stderr_to_stdout", &self.stderr_to_stdout)
            .field("protocol_factory", &self.protocol_factory.is_some())
            .finish()
    }
}

impl CommandStage {
    /// Builds a new command stage. `argv` must be non-empty; its first
    /// element is the program to execute.
    pub fn new(label: impl Into<String>, argv: Vec<String>) -> EngineResult<Self> {
        let label = label.into();
        if argv.is_empty() {
            return Err(EngineError::EmptyArgv(label));
        }
        Ok(Self {
            label,
            argv,
            cwd: None,
            env: None,
            emulate_tty: false,
            stderr_to_stdout: false,
            protocol_factory: None,
        })
    }

    /// Sets the working directory the child process is spawned in.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets extra environment variables the child process is spawned with,
    /// on top of this process's own environment.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = Some(env);
        self
    }

    /// Requests the child be spawned against a pseudo-terminal rather than
    /// plain pipes, so tools that only colorize/line-buffer when attached
    /// to a tty behave as they would run interactively. If the host
    /// platform has no pty support compiled in, this degrades silently to
    /// plain pipes (see the crate's Non-goals).
    pub fn with_emulate_tty(mut self, emulate_tty: bool) -> Self {
        self.emulate_tty = emulate_tty;
        self
    }

    /// Routes the child's stderr through the stdout buffer/event path
    /// instead of its own. The stage's `stderr` buffer on
    /// [`crate::Event::FinishedStage`] is empty when this is set.
    pub fn with_stderr_to_stdout(mut self, stderr_to_stdout: bool) -> Self {
        self.stderr_to_stdout = stderr_to_stdout;
        self
    }

    /// Sets a chunk transform applied to raw output before it is buffered
    /// or emitted.
    pub fn with_protocol_factory(mut self, factory: ProtocolFactory) -> Self {
        self.protocol_factory = Some(factory);
        self
    }
}

/// A caller-supplied function run in place of a child process.
///
/// Takes the owning stage's [`StageLogger`] (to record output) and the
/// run's raw [`EventSink`] (for callers that need to emit events of their
/// own devising), and returns a process-style exit code: `0` for success,
/// anything else for failure.
pub type StageFn = Arc<dyn Fn(&StageLogger, &EventSink) -> i32 + Send + Sync>;

/// A stage that runs a caller-supplied function instead of spawning a
/// process.
#[derive(Clone)]
pub struct FunctionStage {
    pub(crate) label: String,
    pub(crate) function: StageFn,
}

impl fmt::Debug for FunctionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionStage")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl FunctionStage {
    /// Builds a new function stage.
    pub fn new(label: impl Into<String>, function: StageFn) -> Self {
        Self {
            label: label.into(),
            function,
        }
    }
}

/// One stage of a Job: either a spawned command or a caller-supplied
/// function.
#[derive(Debug, Clone)]
pub enum Stage {
    /// See [`CommandStage`].
    Command(CommandStage),
    /// See [`FunctionStage`].
    Function(FunctionStage),
}

impl Stage {
    /// The stage's label, as shown in status output and events.
    pub fn label(&self) -> &str {
        match self {
            Stage::Command(c) => &c.label,
            Stage::Function(f) => &f.label,
        }
    }
}

impl From<CommandStage> for Stage {
    fn from(c: CommandStage) -> Self {
        Stage::Command(c)
    }
}

impl From<FunctionStage> for Stage {
    fn from(f: FunctionStage) -> Self {
        Stage::Function(f)
    }
}

/// A unit of scheduling: an ordered list of stages run sequentially, gated
/// on a set of dependency job ids.
#[derive(Debug, Clone)]
pub struct Job {
    pub(crate) jid: Jid,
    pub(crate) deps: Vec<Jid>,
    pub(crate) stages: Vec<Stage>,
    pub(crate) continue_on_failure: bool,
}

impl Job {
    /// Builds a new Job. `stages` must be non-empty.
    pub fn new(jid: impl Into<Jid>, deps: Vec<Jid>, stages: Vec<Stage>) -> EngineResult<Self> {
        let jid = jid.into();
        if stages.is_empty() {
            return Err(EngineError::EmptyJob(jid));
        }
        Ok(Self {
            jid,
            deps,
            stages,
            continue_on_failure: false,
        })
    }

    /// If true, a failing stage within this Job does not abort its
    /// remaining stages (each still runs); the Job as a whole is still
    /// reported failed if any stage failed. Defaults to false: the first
    /// failing stage aborts the Job's remaining stages.
    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    /// This Job's identifier.
    pub fn jid(&self) -> &str {
        &self.jid
    }

    /// The ids of the Jobs this Job depends on.
    pub fn deps(&self) -> &[Jid] {
        &self.deps
    }
}
