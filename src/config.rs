use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// A memory admission limit, parsed from the same shapes the originating
/// tool's `--mem-limit` flag accepted: a bare percentage of physical memory,
/// or an absolute byte count (optionally suffixed `k`/`m`/`g`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MemLimit {
    /// A percentage of total physical memory, in `0.0..=100.0`.
    Percent(f64),
    /// An absolute number of bytes.
    Bytes(u64),
}

impl MemLimit {
    /// Parses a limit string: `"80%"`, `"512m"`, `"2g"`, `"1048576"`, etc.
    /// Suffixes `k`/`m`/`g` (case-insensitive) are binary multiples (1024).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            return pct.trim().parse().ok().map(MemLimit::Percent);
        }

        let (digits, mult) = match s.as_bytes().last()?.to_ascii_lowercase() {
            b'k' => (&s[..s.len() - 1], 1024),
            b'm' => (&s[..s.len() - 1], 1024 * 1024),
            b'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
            _ => (s, 1),
        };

        digits.trim().parse::<u64>().ok().map(|n| MemLimit::Bytes(n * mult))
    }
}

/// Typed construction parameters for the Jobserver and Scheduler.
///
/// Immutable once built; a caller embedding this engine in a larger tool is
/// expected to parse its own CLI/config file and construct one of these,
/// since CLI argument parsing is explicitly out of this crate's scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of concurrently active Jobs (jobserver token count).
    /// Defaults to the host's available parallelism.
    pub max_jobs: NonZeroUsize,
    /// Optional 5-minute load-average admission ceiling.
    pub max_load: Option<f64>,
    /// Optional physical-memory-usage admission ceiling.
    pub max_mem: Option<MemLimit>,
    /// If false, the first Job to fail abandons every not-yet-started Job.
    pub continue_on_failure: bool,
    /// If false, a Job whose dependency failed is transitively abandoned
    /// rather than run. Ignored (has no effect) when a Job's dependency
    /// failure would already cause abandonment under `continue_on_failure`.
    pub continue_without_deps: bool,
    /// Whether to probe for and advertise GNU make jobserver support to
    /// spawned `make` children. When false, `make_args()` always returns an
    /// empty argv and children serialize on `-j1`.
    pub gnu_make_enabled: bool,
    /// If present, a Status observer task is spawned alongside the
    /// scheduler, rendering progress per these settings. If absent, events
    /// are still produced but nothing consumes them beyond `run_jobs`
    /// itself.
    pub status: Option<StatusConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let max_jobs = std::thread::available_parallelism()
            .unwrap_or_else(|_| NonZeroUsize::new(1).unwrap());

        Self {
            max_jobs,
            max_load: None,
            max_mem: None,
            continue_on_failure: false,
            continue_without_deps: false,
            gnu_make_enabled: true,
            status: None,
        }
    }
}

/// Typed construction parameters for the Status observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// A short label prefixed to the status line and summary (e.g. the
    /// containing tool's name).
    pub label: String,
    /// Render `STARTED_STAGE`/`FINISHED_STAGE` lines.
    pub show_stage_events: bool,
    /// Render a stage's buffered stdout/interleaved output on completion.
    pub show_buffered_stdout: bool,
    /// Render a stage's buffered stderr on completion.
    pub show_buffered_stderr: bool,
    /// Render `STDOUT` chunks as they arrive.
    pub show_live_stdout: bool,
    /// Render `STDERR` chunks as they arrive.
    pub show_live_stderr: bool,
    /// Use the interactive, single-line-rewriting renderer. When false, use
    /// the quiet, newline-terminated renderer.
    pub show_active_status: bool,
    /// Print the full jid list per category in the final summary, not just
    /// counts.
    pub show_full_summary: bool,
    /// Interactive status line refresh rate in Hz. Clamped to a minimum of
    /// 0.1 Hz.
    pub active_status_rate: f64,
}

impl StatusConfig {
    /// Clamps `active_status_rate` to the documented minimum of 0.1 Hz.
    pub fn normalized_rate(&self) -> f64 {
        self.active_status_rate.max(0.1)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            label: "jobgraph".to_owned(),
            show_stage_events: false,
            show_buffered_stdout: true,
            show_buffered_stderr: true,
            show_live_stdout: false,
            show_live_stderr: false,
            show_active_status: true,
            show_full_summary: false,
            active_status_rate: 20.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_limit_parses_percent() {
        assert_eq!(MemLimit::parse("80%"), Some(MemLimit::Percent(80.0)));
    }

    #[test]
    fn mem_limit_parses_suffixes() {
        assert_eq!(MemLimit::parse("2g"), Some(MemLimit::Bytes(2 * 1024 * 1024 * 1024)));
        assert_eq!(MemLimit::parse("512m"), Some(MemLimit::Bytes(512 * 1024 * 1024)));
        assert_eq!(MemLimit::parse("4k"), Some(MemLimit::Bytes(4 * 1024)));
        assert_eq!(MemLimit::parse("1024"), Some(MemLimit::Bytes(1024)));
    }

    #[test]
    fn mem_limit_rejects_garbage() {
        assert_eq!(MemLimit::parse("not-a-number"), None);
    }

    #[test]
    fn status_rate_is_clamped() {
        let mut cfg = StatusConfig::default();
        cfg.active_status_rate = 0.0;
        assert_eq!(cfg.normalized_rate(), 0.1);
    }
}
