//! Per-stage output capture: buffering stdout/stderr/interleaved bytes and
//! emitting [`crate::Event::Stdout`]/[`crate::Event::Stderr`] as they arrive.
//!
//! Two variants share this one buffering/emission implementation but differ
//! in how a chunk is shaped before it lands in the buffers: the subprocess
//! protocol (command stages, see `src/runtime.rs`) buffers and emits raw
//! bytes exactly as the OS delivered them, via [`StageLogger::raw_out`]/
//! [`StageLogger::raw_err`]; the in-process logger (function stages) is
//! line-oriented — [`StageLogger::out`]/[`StageLogger::err`] right-trim the
//! given text and append a single `\n` before buffering or emitting it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::event::{EventSink, Jid};

#[derive(Debug, Default)]
struct Buffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    interleaved: Vec<u8>,
}

/// A handle a running stage uses to record its own output.
///
/// Cheaply cloneable: shared between the task pumping a child process's
/// stdout and the task pumping its stderr, so both can append to the same
/// `interleaved` buffer in receipt order.
#[derive(Clone)]
pub struct StageLogger {
    job_id: Jid,
    label: String,
    sink: EventSink,
    start: Instant,
    buffers: Arc<Mutex<Buffers>>,
}

impl fmt::Debug for StageLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageLogger")
            .field("job_id", &self.job_id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// The three buffers accumulated over a stage's lifetime, handed back to
/// the caller on [`crate::Event::FinishedStage`].
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Everything written via [`StageLogger::out`].
    pub stdout: Vec<u8>,
    /// Everything written via [`StageLogger::err`].
    pub stderr: Vec<u8>,
    /// `stdout` and `stderr` content, interleaved in the order each chunk
    /// was recorded.
    pub interleaved: Vec<u8>,
}

impl StageLogger {
    pub(crate) fn new(job_id: Jid, label: String, sink: EventSink, start: Instant) -> Self {
        Self {
            job_id,
            label,
            sink,
            start,
            buffers: Arc::new(Mutex::new(Buffers::default())),
        }
    }

    /// Records and emits a chunk of stdout. Trailing whitespace is
    /// stripped and a single newline appended, matching the line-logging
    /// behavior of the system this engine's stage protocol is modeled on.
    pub fn out(&self, text: &str) {
        let line = normalize_line(text);
        {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.stdout.extend_from_slice(line.as_bytes());
            buffers.interleaved.extend_from_slice(line.as_bytes());
        }
        let _ = self.sink.send(crate::event::Event::Stdout {
            time: self.start.elapsed(),
            job_id: self.job_id.clone(),
            label: self.label.clone(),
            data: line.into_bytes(),
        });
    }

    /// Records and emits a chunk of stderr. See [`StageLogger::out`].
    pub fn err(&self, text: &str) {
        let line = normalize_line(text);
        {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.stderr.extend_from_slice(line.as_bytes());
            buffers.interleaved.extend_from_slice(line.as_bytes());
        }
        let _ = self.sink.send(crate::event::Event::Stderr {
            time: self.start.elapsed(),
            job_id: self.job_id.clone(),
            label: self.label.clone(),
            data: line.into_bytes(),
        });
    }

    /// Routes a chunk of stderr through the stdout buffer/event path
    /// instead, for stages constructed with `stderr_to_stdout`. The
    /// stderr buffer is left empty for the lifetime of the stage.
    pub(crate) fn err_as_out(&self, text: &str) {
        self.out(text);
    }

    /// Records and emits a raw chunk of stdout exactly as the OS delivered
    /// it: no trimming, no newline normalization, no UTF-8 assumption. Used
    /// by the subprocess protocol (`§4.2`'s "Subprocess protocol" variant);
    /// [`StageLogger::out`] is the "In-process logger" variant, which does
    /// normalize, and is for function stages only.
    pub(crate) fn raw_out(&self, data: &[u8]) {
        {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.stdout.extend_from_slice(data);
            buffers.interleaved.extend_from_slice(data);
        }
        let _ = self.sink.send(crate::event::Event::Stdout {
            time: self.start.elapsed(),
            job_id: self.job_id.clone(),
            label: self.label.clone(),
            data: data.to_vec(),
        });
    }

    /// Records and emits a raw chunk of stderr. See [`StageLogger::raw_out`].
    pub(crate) fn raw_err(&self, data: &[u8]) {
        {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.stderr.extend_from_slice(data);
            buffers.interleaved.extend_from_slice(data);
        }
        let _ = self.sink.send(crate::event::Event::Stderr {
            time: self.start.elapsed(),
            job_id: self.job_id.clone(),
            label: self.label.clone(),
            data: data.to_vec(),
        });
    }

    /// Raw-chunk counterpart to [`StageLogger::err_as_out`].
    pub(crate) fn raw_err_as_out(&self, data: &[u8]) {
        self.raw_out(data);
    }

    /// Snapshots the three buffers accumulated so far.
    pub(crate) fn finish(&self) -> StageOutput {
        let buffers = self.buffers.lock().unwrap();
        StageOutput {
            stdout: buffers.stdout.clone(),
            stderr: buffers.stderr.clone(),
            interleaved: buffers.interleaved.clone(),
        }
    }
}

fn normalize_line(text: &str) -> String {
    format!("{}\n", text.trim_end_matches(['\r', '\n']))
}
