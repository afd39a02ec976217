//! Per-Job execution: running a Job's stages in order, stopping at the
//! first failure unless the Job was built with `continue_on_failure`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tracing::{info_span, Instrument};

use crate::event::{Event, EventSink, Jid};
use crate::io::StageLogger;
use crate::jobserver::Jobserver;
use crate::stage::{CommandStage, FunctionStage, Job, ProtocolFactory, Stage};

/// Runs every stage of `job` in order, returning the Job's id and whether
/// it as a whole succeeded (every attempted stage exited zero).
///
/// `jobserver` is threaded through only so command stages can un-CLOEXEC its
/// token-store descriptors before `exec`, in case their argv embeds
/// [`Jobserver::make_args`]; the scheduler continues to hold the token for
/// this job's entire lifetime, this handle is not used to acquire one.
pub(crate) async fn run_job(job: Arc<Job>, sink: EventSink, start: Instant, jobserver: Jobserver) -> (Jid, bool) {
    let span = info_span!("job", jid = %job.jid);
    async move {
        let mut job_succeeded = true;

        for stage in &job.stages {
            let label = stage.label().to_owned();
            let _ = sink.send(Event::StartedStage {
                time: start.elapsed(),
                job_id: job.jid.clone(),
                label: label.clone(),
            });

            let stage_span = info_span!("stage", label = %label);
            let logger = StageLogger::new(job.jid.clone(), label.clone(), sink.clone(), start);
            let retcode = run_stage(stage, logger.clone(), sink.clone(), &jobserver)
                .instrument(stage_span)
                .await;

            let succeeded = retcode == 0;
            let output = logger.finish();
            let _ = sink.send(Event::FinishedStage {
                time: start.elapsed(),
                job_id: job.jid.clone(),
                label,
                succeeded,
                retcode,
                stdout: output.stdout,
                stderr: output.stderr,
                interleaved: output.interleaved,
            });

            if !succeeded {
                job_succeeded = false;
                if !job.continue_on_failure {
                    break;
                }
            }
        }

        (job.jid.clone(), job_succeeded)
    }
    .instrument(span)
    .await
}

async fn run_stage(stage: &Stage, logger: StageLogger, sink: EventSink, jobserver: &Jobserver) -> i32 {
    match stage {
        Stage::Command(cmd) => run_command_stage(cmd, logger, jobserver).await,
        Stage::Function(func) => run_function_stage(func, logger, sink).await,
    }
}

async fn run_command_stage(cmd: &CommandStage, logger: StageLogger, jobserver: &Jobserver) -> i32 {
    if cmd.emulate_tty {
        tracing::debug!(
            label = %cmd.label,
            "emulate_tty requested but no pty backend is compiled in; degrading to plain pipes"
        );
    }

    let mut command = TokioCommand::new(&cmd.argv[0]);
    command.args(&cmd.argv[1..]);
    if let Some(cwd) = &cmd.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = &cmd.env {
        for (k, v) in env {
            command.env(k, v);
        }
    }
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());
    command.stdin(std::process::Stdio::null());

    // So a child that embeds `jobserver.make_args()` in its own argv (a
    // spawned `make -j`, say) can actually see the token-store descriptors:
    // they are created CLOEXEC (see `src/jobserver/unix.rs`) and otherwise
    // would already be closed by the time the child execs.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let jobserver = jobserver.clone();
        unsafe {
            command.pre_exec(move || jobserver.allow_inherit());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = jobserver;
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            logger.err(&format!("failed to spawn {:?}: {e}", cmd.argv[0]));
            return 1;
        }
    };

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let stderr_to_stdout = cmd.stderr_to_stdout;
    let factory = cmd.protocol_factory.clone();

    let out_logger = logger.clone();
    let out_factory = factory.clone();
    let stdout_task = tokio::spawn(async move {
        pump_raw(stdout, |chunk| {
            out_logger.raw_out(&apply_factory(&out_factory, chunk));
        })
        .await;
    });

    let err_logger = logger.clone();
    let stderr_task = tokio::spawn(async move {
        pump_raw(stderr, |chunk| {
            let chunk = apply_factory(&factory, chunk);
            if stderr_to_stdout {
                err_logger.raw_err_as_out(&chunk);
            } else {
                err_logger.raw_err(&chunk);
            }
        })
        .await;
    });

    let _ = tokio::join!(stdout_task, stderr_task);

    match child.wait().await {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            logger.err(&format!("failed to wait on child: {e}"));
            1
        }
    }
}

/// Reads raw byte chunks from `reader` exactly as the OS delivers them,
/// invoking `on_chunk` once per non-empty read, until EOF or an I/O error.
/// No line-buffering, no UTF-8 assumption: a stage emitting non-UTF-8 bytes
/// (stray bytes, a non-UTF-8 locale) still has every byte captured.
async fn pump_raw<R>(mut reader: R, mut on_chunk: impl FnMut(&[u8]))
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => on_chunk(&buf[..n]),
        }
    }
}

fn apply_factory(factory: &Option<ProtocolFactory>, chunk: &[u8]) -> Vec<u8> {
    match factory {
        Some(f) => f(chunk),
        None => chunk.to_vec(),
    }
}

async fn run_function_stage(func: &FunctionStage, logger: StageLogger, sink: EventSink) -> i32 {
    let function = func.function.clone();
    let task_logger = logger.clone();
    let result = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(AssertUnwindSafe(|| function(&task_logger, &sink)))
    })
    .await;

    match result {
        Ok(Ok(retcode)) => retcode,
        Ok(Err(panic)) => {
            let message = panic_message(&panic);
            logger.err(&format!("function stage panicked: {message}"));
            1
        }
        Err(join_error) => {
            logger.err(&format!("function stage task failed: {join_error}"));
            1
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
