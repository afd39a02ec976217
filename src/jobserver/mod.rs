//! The jobserver: a bounded pool of tokens gating how many Jobs may be
//! `active` at once, plus the admission predicates (`max_load`, `max_mem`)
//! layered on top of the raw token count.
//!
//! The token store itself is split into a platform-specific backend
//! (pipe on unix, anonymous semaphore on Windows, mutex-counter elsewhere,
//! selected by `cfg_if!`) behind a common, platform-independent
//! [`Jobserver`]/[`Token`] shell.

use std::fmt;
use std::io;
use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cfg_if::cfg_if;
use tracing::{debug, warn};

use crate::config::{EngineConfig, MemLimit};
use crate::error::{EngineError, EngineResult};

cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as imp;
    } else {
        mod wasm;
        use wasm as imp;
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Inner {
    imp: imp::Client,
    max_jobs: usize,
    max_load: Option<f64>,
    max_mem: Option<MemLimit>,
    running: AtomicUsize,
    gnu_make_supported: bool,
    sys: Mutex<sysinfo::System>,
}

/// A bounded pool of run slots ("tokens"), one per concurrently active Job.
///
/// Cheaply cloneable: internally an `Arc`, shared between the scheduler
/// driver and every Job runtime task it spawns.
#[derive(Clone)]
pub struct Jobserver(Arc<Inner>);

impl fmt::Debug for Jobserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jobserver")
            .field("max_jobs", &self.0.max_jobs)
            .field("max_load", &self.0.max_load)
            .field("max_mem", &self.0.max_mem)
            .field("running", &self.running_jobs())
            .field("gnu_make_supported", &self.0.gnu_make_supported)
            .finish()
    }
}

impl Jobserver {
    /// Builds a new token pool sized `config.max_jobs`, probing for GNU
    /// make jobserver protocol support if `config.gnu_make_enabled`.
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let max_jobs = config.max_jobs.get();
        let imp = imp::Client::new(max_jobs).map_err(EngineError::Jobserver)?;

        let gnu_make_supported = if config.gnu_make_enabled {
            probe_gnu_make_support()?
        } else {
            false
        };

        Ok(Self(Arc::new(Inner {
            imp,
            max_jobs,
            max_load: config.max_load,
            max_mem: config.max_mem,
            running: AtomicUsize::new(0),
            gnu_make_supported,
            sys: Mutex::new(sysinfo::System::new()),
        })))
    }

    /// The configured token ceiling (`EngineConfig::max_jobs`).
    pub fn max_jobs(&self) -> usize {
        self.0.max_jobs
    }

    /// The number of tokens currently checked out. Resolves Open Question 1:
    /// this is the atomic "checked-out" counter, not the pipe's remaining
    /// byte count (which briefly needles down around a `try_acquire` without
    /// the caller having started a Job yet).
    pub fn running_jobs(&self) -> usize {
        self.0.running.load(Ordering::SeqCst)
    }

    /// Attempts to acquire one token without blocking. Returns `Ok(None)`
    /// when no token is available or an admission predicate (`max_load`,
    /// `max_mem`) currently forbids starting another Job.
    pub fn try_acquire(&self) -> EngineResult<Option<Token>> {
        if !self.admission_ok() {
            return Ok(None);
        }

        let acquired = self.0.imp.try_acquire().map_err(EngineError::Jobserver)?;
        match acquired {
            Some(acquired) => {
                self.0.running.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Token {
                    jobserver: self.clone(),
                    acquired: Some(acquired),
                }))
            }
            None => Ok(None),
        }
    }

    /// Polls `try_acquire` at a fixed interval until a token is available.
    ///
    /// There is no portable readiness primitive across the pipe/semaphore/
    /// mutex-counter backends this module dispatches to, so this is plain
    /// polling rather than a true wakeup; 10ms is short enough not to
    /// visibly delay job starts.
    pub async fn wait_acquire(&self) -> EngineResult<Token> {
        loop {
            if let Some(token) = self.try_acquire()? {
                return Ok(token);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// The `--jobserver-fds=R,W -j` argv fragment to append to a spawned
    /// `make` invocation's command line, or an empty `Vec` if GNU make
    /// jobserver support was not probed or not detected.
    pub fn make_args(&self) -> Vec<String> {
        if !self.0.gnu_make_supported {
            return Vec::new();
        }
        let (r, w) = self.0.imp.fd_pair();
        vec![format!("--jobserver-fds={r},{w}"), "-j".to_owned()]
    }

    /// Clears `FD_CLOEXEC` on the token store's descriptors so a spawned
    /// `make` child inherits them across `exec`. No-op on platforms without
    /// fd inheritance (everything but unix).
    ///
    /// # Safety
    /// Only safe to call between `fork` and `exec` in a child process.
    pub unsafe fn allow_inherit(&self) -> io::Result<()> {
        self.0.imp.allow_inherit()
    }

    fn admission_ok(&self) -> bool {
        // These predicates only ever gate *additional* jobs beyond the
        // first; a lone running job is never blocked on load or memory,
        // matching jobs.py's `running_jobs() > 0` guard.
        if self.running_jobs() == 0 {
            return true;
        }
        self.load_ok() && self.mem_ok()
    }

    fn load_ok(&self) -> bool {
        let Some(max_load) = self.0.max_load else {
            return true;
        };
        match sysinfo::System::load_average() {
            load if load.five >= 0.0 => load.five <= max_load,
            _ => true,
        }
    }

    fn mem_ok(&self) -> bool {
        let Some(max_mem) = self.0.max_mem else {
            return true;
        };
        let mut sys = self.0.sys.lock().unwrap();
        sys.refresh_memory();
        let total = sys.total_memory();
        let used = sys.used_memory();
        if total == 0 {
            return true;
        }
        match max_mem {
            MemLimit::Percent(pct) => (used as f64 / total as f64) * 100.0 <= pct,
            MemLimit::Bytes(limit) => used <= limit,
        }
    }
}

/// A single checked-out run slot. Dropping it (or calling [`Token::release`]
/// explicitly) returns the token to the pool.
pub struct Token {
    jobserver: Jobserver,
    acquired: Option<imp::Acquired>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token").finish_non_exhaustive()
    }
}

impl Token {
    /// Releases the token back to the pool. Equivalent to dropping it, but
    /// lets a caller observe and log a release failure instead of silently
    /// discarding it in a `Drop` impl.
    pub fn release(mut self) -> io::Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let jobserver = &self.jobserver;
        let result = jobserver.0.imp.release(self.acquired.as_ref());
        jobserver.0.running.fetch_sub(1, Ordering::SeqCst);
        self.acquired = None;
        result
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        if self.acquired.is_some() {
            if let Err(e) = self.release_inner() {
                warn!(error = %e, "failed to release jobserver token");
            }
        }
    }
}

/// Writes a minimal Makefile to a fresh temp file whose sole rule greps its
/// own `$(MAKEFLAGS)` for `--jobserver-fds`/`--jobserver-auth`, and runs
/// `make -f <path> -j2` against it — deliberately without passing any
/// jobserver flags of our own: a `make` that itself supports the protocol
/// will, given `-j2` and no inherited jobserver, create its own internal
/// token pool and advertise it to the rule's recipe via `$(MAKEFLAGS)`,
/// under whichever flag spelling this `make` uses. `ret == 0` (the rule's
/// `grep` found a match) is exactly the original tool's own
/// `_test_gnu_make_support` check. Returns `Ok(false)` (not an error) if
/// `make` ran and the grep didn't match, or `make` isn't installed at all;
/// returns `Err` only if writing the probe file itself failed.
fn probe_gnu_make_support() -> EngineResult<bool> {
    if !cfg!(unix) {
        return Ok(false);
    }

    let path = temp_probe_path();
    let write_result = std::fs::File::create(&path).and_then(|mut f| {
        f.write_all(
            b"all:\n\t@echo $(MAKEFLAGS) | grep -E -- '--jobserver-(fds|auth)'\n",
        )
    });

    if let Err(e) = write_result {
        return Err(EngineError::GnuMakeProbeFailed(e));
    }

    let output = std::process::Command::new("make")
        .arg("-f")
        .arg(&path)
        .arg("-j2")
        .output();

    let _ = std::fs::remove_file(&path);

    let supported = match output {
        Ok(out) => out.status.success(),
        Err(e) => {
            debug!(error = %e, "make not runnable; disabling --jobserver-fds");
            false
        }
    };

    if !supported {
        warn!(
            "host make does not advertise GNU make jobserver protocol support \
             (--jobserver-fds/--jobserver-auth); spawned make children will serialize on -j1"
        );
    }

    Ok(supported)
}

fn temp_probe_path() -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("jobgraph-probe-{}-{nanos}.mk", std::process::id()))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use crate::config::EngineConfig;

    use super::*;

    #[test]
    fn pool_respects_max_jobs() {
        let config = EngineConfig {
            max_jobs: NonZeroUsize::new(3).unwrap(),
            gnu_make_enabled: false,
            ..EngineConfig::default()
        };
        let js = Jobserver::new(&config).expect("jobserver should build");

        let tokens: Vec<_> = (0..3).map(|_| js.try_acquire().unwrap().unwrap()).collect();
        assert!(js.try_acquire().unwrap().is_none());
        assert_eq!(js.running_jobs(), 3);
        drop(tokens);
        assert_eq!(js.running_jobs(), 0);
    }

    #[test]
    fn gnu_make_probe_against_a_real_make_binary() {
        // `probe_gnu_make_support` owns its own temp file and writes the
        // grep-`$(MAKEFLAGS)` Makefile itself, so there's no separate
        // fixture to drive here; this just runs the real probe end to end.
        // Whether the host's `make` happens to advertise the protocol
        // depends on the environment running this test, so only the `Ok`
        // is asserted, not which boolean it carries.
        let result = probe_gnu_make_support();
        assert!(result.is_ok(), "probing host make should not itself error: {result:?}");
    }
}
