use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use vgate_core::{Result, VerifyError, EXIT_TIMEOUT};

use crate::signals;

/// Time a timed-out process group gets between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub code: i32,
    pub timed_out: bool,
}

impl ProcessOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            code,
            timed_out: false,
        }
    }
}

/// Append-only log shared between the engine and the child processes it
/// spawns. Cloned descriptors share one file offset, so engine lines and child
/// output interleave in write order.
#[derive(Debug)]
pub struct GateLog {
    file: File,
    path: PathBuf,
}

impl GateLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| VerifyError::io(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, message: &str) -> Result<()> {
        writeln!(self.file, "{}", message).map_err(|e| VerifyError::io(&self.path, e))
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .map_err(|e| VerifyError::io(&self.path, e))
    }

    pub fn stdio(&self) -> Result<Stdio> {
        let clone = self
            .file
            .try_clone()
            .map_err(|e| VerifyError::io(&self.path, e))?;
        Ok(Stdio::from(clone))
    }
}

/// Builds a command that runs in its own process group so a timeout can take
/// down everything the gate started.
pub fn group_command(argv: &[String], cwd: &Path) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.current_dir(cwd);
    cmd.stdin(Stdio::null());
    cmd.process_group(0);
    cmd
}

/// Spawns `cmd` with stdout and stderr sent to `log` and waits for it under
/// `timeout`. A spawn failure is written to the log and reported as `spawn_code`.
pub fn run_logged(
    mut cmd: Command,
    log: &mut GateLog,
    timeout: Duration,
    spawn_code: i32,
) -> Result<ProcessOutcome> {
    cmd.stdout(log.stdio()?);
    supervise_logged(cmd, log, timeout, spawn_code)
}

/// Like [`run_logged`] but stdout goes to `stdout`; only stderr reaches the log.
pub fn run_captured(
    mut cmd: Command,
    stdout: File,
    log: &mut GateLog,
    timeout: Duration,
    spawn_code: i32,
) -> Result<ProcessOutcome> {
    cmd.stdout(Stdio::from(stdout));
    supervise_logged(cmd, log, timeout, spawn_code)
}

fn supervise_logged(
    mut cmd: Command,
    log: &mut GateLog,
    timeout: Duration,
    spawn_code: i32,
) -> Result<ProcessOutcome> {
    cmd.stderr(log.stdio()?);
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            log.line(&format!(
                "ERROR: failed to spawn {:?}: {}",
                cmd.get_program(),
                e
            ))?;
            return Ok(ProcessOutcome::exited(spawn_code));
        }
    };
    let outcome = supervise(&mut child, timeout).map_err(|e| VerifyError::io(log.path(), e))?;
    if outcome.timed_out {
        log.line(&format!(
            "ERROR: timed out after {}s; process group terminated",
            timeout.as_secs()
        ))?;
    }
    Ok(outcome)
}

/// Polls `child` until it exits or `timeout` elapses. On timeout the whole
/// process group gets SIGTERM, then SIGKILL after `TERM_GRACE`. The group is
/// tracked for shutdown until the leader has been reaped.
pub fn supervise(child: &mut Child, timeout: Duration) -> std::io::Result<ProcessOutcome> {
    let pgid = Pid::from_raw(child.id() as i32);
    let _tracked = signals::track(pgid);
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ProcessOutcome::exited(exit_code_of(status)));
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(
        pid = child.id(),
        timeout_secs = timeout.as_secs(),
        "timeout reached, terminating process group"
    );
    signal_group(pgid, Signal::SIGTERM);
    let grace_deadline = Instant::now() + TERM_GRACE;
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if Instant::now() >= grace_deadline {
            signal_group(pgid, Signal::SIGKILL);
            child.wait()?;
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    // Stragglers that ignored SIGTERM after the leader exited.
    signal_group(pgid, Signal::SIGKILL);
    Ok(ProcessOutcome {
        code: EXIT_TIMEOUT,
        timed_out: true,
    })
}

pub(crate) fn signal_group(pgid: Pid, signal: Signal) {
    if let Err(e) = killpg(pgid, signal) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!(pgid = pgid.as_raw(), ?signal, "killpg failed: {}", e);
        }
    }
}

/// Exit code for a finished process; death by signal N maps to 128 + N.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => status.signal().map(|s| 128 + s).unwrap_or(1),
    }
}
