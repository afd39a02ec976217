//! The built-in Status observer: an Event consumer that renders progress to
//! stdout and a final summary.
//!
//! Interactive mode rewrites a single status line in place via `\r`; quiet
//! mode only prints discrete per-event lines and the final summary.

use std::collections::{BTreeSet, HashMap};
use std::io::Write as _;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::StatusConfig;
use crate::event::{AbandonReason, Event, Jid};

#[derive(Default)]
struct Summary {
    total: usize,
    succeeded: usize,
    failed: Vec<Jid>,
    abandoned: Vec<Jid>,
    warned: BTreeSet<Jid>,
}

/// Drives the Status observer until the event stream closes or a terminal
/// [`crate::event::JobStatusSnapshot`] (empty pending/queued/active) is
/// observed, then prints the final summary.
pub(crate) async fn run(mut rx: UnboundedReceiver<Event>, cfg: StatusConfig, max_jobs: usize) {
    let mut job_starts: HashMap<Jid, Instant> = HashMap::new();
    let mut active_stage: HashMap<Jid, (String, Instant)> = HashMap::new();
    let mut summary = Summary::default();
    let run_start = Instant::now();
    let mut last_active: usize = 0;

    loop {
        let event = if cfg.show_active_status {
            match tokio::time::timeout(
                Duration::from_secs_f64(1.0 / cfg.normalized_rate()),
                rx.recv(),
            )
            .await
            {
                Ok(event) => event,
                Err(_elapsed) => {
                    print_status_line(&cfg, run_start, last_active, max_jobs, &active_stage, &summary);
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        let Some(event) = event else {
            break;
        };

        let terminal = matches!(&event, Event::JobStatus { status, .. }
            if status.pending.is_empty() && status.queued.is_empty() && status.active.is_empty());

        render_event(&cfg, &event, &mut job_starts, &mut active_stage, &mut summary);

        if let Event::JobStatus { status, .. } = &event {
            last_active = status.active.len();
        }

        if terminal {
            break;
        }
    }

    print_summary(&cfg, run_start, &summary);
}

fn render_event(
    cfg: &StatusConfig,
    event: &Event,
    job_starts: &mut HashMap<Jid, Instant>,
    active_stage: &mut HashMap<Jid, (String, Instant)>,
    summary: &mut Summary,
) {
    match event {
        Event::JobStatus { status, .. } => {
            summary.total = status.pending.len()
                + status.queued.len()
                + status.active.len()
                + status.completed.len()
                + status.abandoned.len();
        }
        Event::QueuedJob { .. } => {}
        Event::StartedJob { job_id, .. } => {
            job_starts.insert(job_id.clone(), Instant::now());
            println(&format!("Starting >>> {job_id}"));
        }
        Event::FinishedJob { job_id, succeeded, .. } => {
            let elapsed = job_starts
                .get(job_id)
                .map(|s| format_duration(s.elapsed()))
                .unwrap_or_else(|| "?".to_owned());
            if *succeeded {
                summary.succeeded += 1;
                println(&format!("Finished <<< {job_id} [ {elapsed} ]"));
            } else {
                summary.failed.push(job_id.clone());
                println(&format!("Failed <<< {job_id} [ {elapsed} ]"));
            }
        }
        Event::AbandonedJob { job_id, reason, .. } => {
            summary.abandoned.push(job_id.clone());
            println(&format!("Abandoned <<< {job_id} [ {} ]", render_abandon_reason(reason)));
        }
        Event::StartedStage { job_id, label, .. } => {
            active_stage.insert(job_id.clone(), (label.clone(), Instant::now()));
            if cfg.show_stage_events {
                println(&format!("Starting >> {job_id}:{label}"));
            }
        }
        Event::FinishedStage {
            job_id,
            label,
            succeeded,
            retcode,
            stdout: _,
            stderr,
            interleaved,
        } => {
            active_stage.remove(job_id);

            if *succeeded {
                if cfg.show_stage_events {
                    println(&format!("Finished << {job_id}:{label}"));
                }
            } else {
                println(&format!("Failed << {job_id}:{label} [ Exited with code {retcode} ]"));
            }

            if !interleaved.is_empty() && cfg.show_buffered_stdout {
                println(&format!("Output << {job_id}:{label}"));
                print_buffer(interleaved);
            }

            if !stderr.is_empty() && cfg.show_buffered_stderr {
                if *succeeded {
                    summary.warned.insert(job_id.clone());
                    println(&format!("Warnings << {job_id}:{label}"));
                } else {
                    println(&format!("Errors << {job_id}:{label}"));
                }
                print_buffer(stderr);
            }
        }
        Event::Stdout { job_id, label, data } => {
            if cfg.show_live_stdout {
                print_prefixed(job_id, label, data);
            }
        }
        Event::Stderr { job_id, label, data } => {
            if cfg.show_live_stderr {
                print_prefixed(job_id, label, data);
            }
        }
    }
}

fn render_abandon_reason(reason: &AbandonReason) -> String {
    match reason {
        AbandonReason::PeerFailed { .. } => "Unrelated job failed".to_owned(),
        AbandonReason::MissingDeps { dep_ids } => {
            format!("Depends on unknown jobs: {}", dep_ids.join(", "))
        }
        AbandonReason::DepFailed {
            dep_job_id,
            direct_dep_job_id,
        } => {
            if dep_job_id == direct_dep_job_id {
                format!("Depends on failed job {dep_job_id}")
            } else {
                format!("Depends on failed job {dep_job_id} via {direct_dep_job_id}")
            }
        }
    }
}

fn print_status_line(
    cfg: &StatusConfig,
    run_start: Instant,
    active_count: usize,
    max_jobs: usize,
    active_stage: &HashMap<Jid, (String, Instant)>,
    summary: &Summary,
) {
    let done = summary.succeeded + summary.failed.len();
    let active_list: String = active_stage
        .iter()
        .map(|(jid, (label, start))| format!("[{jid}:{label} - {}]", format_duration(start.elapsed())))
        .collect::<Vec<_>>()
        .join(", ");

    print!(
        "\r[{} {}] [{}/{} complete] [{}/{} jobs] {}\x1b[K",
        cfg.label,
        format_duration(run_start.elapsed()),
        done,
        summary.total,
        active_count,
        max_jobs,
        active_list
    );
    let _ = std::io::stdout().flush();
}

fn print_summary(cfg: &StatusConfig, run_start: Instant, summary: &Summary) {
    if cfg.show_active_status {
        println("");
    }

    println(&format!("[{} Summary]", cfg.label));
    println(&format!("Runtime: {}", format_duration(run_start.elapsed())));

    if summary.failed.is_empty() && summary.abandoned.is_empty() {
        println(&format!("Summary: All {} jobs completed successfully!", summary.total));
    } else {
        println(&format!(
            "Summary: {} of {} jobs completed successfully.",
            summary.succeeded, summary.total
        ));
    }

    if summary.failed.is_empty() {
        println("Failed: No jobs failed.");
    } else {
        println(&format!("Failed: {} jobs failed.", summary.failed.len()));
        if cfg.show_full_summary {
            println(&format!("  {}", summary.failed.join(", ")));
        }
    }

    if summary.abandoned.is_empty() {
        println("Abandoned: No jobs were abandoned.");
    } else {
        println(&format!("Abandoned: {} jobs were abandoned.", summary.abandoned.len()));
        if cfg.show_full_summary {
            println(&format!("  {}", summary.abandoned.join(", ")));
        }
    }
}

fn print_buffer(buf: &[u8]) {
    for line in String::from_utf8_lossy(buf).lines() {
        println(&format!("  {line}"));
    }
}

fn print_prefixed(job_id: &str, label: &str, data: &[u8]) {
    for line in String::from_utf8_lossy(data).lines() {
        println(&format!("[{job_id}:{label}] {line}"));
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    format!("{secs:.1}s")
}

fn println(line: &str) {
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{line}");
}
