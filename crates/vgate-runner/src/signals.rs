//! Engine shutdown on SIGINT and SIGTERM.
//!
//! Gates run in their own process groups, so a signal aimed at the engine
//! never reaches them. Every supervised group is tracked here and an
//! interrupted engine takes them all down before it exits.

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use vgate_core::{Result, VerifyError};

use crate::process::{signal_group, TERM_GRACE};

const SETTLE_POLL: Duration = Duration::from_millis(20);

struct Registry {
    groups: BTreeSet<i32>,
    draining: bool,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    groups: BTreeSet::new(),
    draining: false,
});

static INSTALLED: AtomicBool = AtomicBool::new(false);

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A process group in the live set. Dropping it removes the group again.
#[derive(Debug)]
pub struct TrackedGroup {
    pgid: Pid,
}

impl Drop for TrackedGroup {
    fn drop(&mut self) {
        registry().groups.remove(&self.pgid.as_raw());
    }
}

/// Adds `pgid` to the live set. A group registered after shutdown began is
/// killed on the spot.
pub fn track(pgid: Pid) -> TrackedGroup {
    let mut reg = registry();
    if reg.draining {
        signal_group(pgid, Signal::SIGKILL);
    }
    reg.groups.insert(pgid.as_raw());
    TrackedGroup { pgid }
}

pub fn live_groups() -> Vec<Pid> {
    registry()
        .groups
        .iter()
        .map(|&raw| Pid::from_raw(raw))
        .collect()
}

fn any_tracked(groups: &[Pid]) -> bool {
    let reg = registry();
    groups.iter().any(|pgid| reg.groups.contains(&pgid.as_raw()))
}

/// Sends SIGTERM to each group and waits up to `TERM_GRACE` for their
/// supervisors to reap them. Whatever is left then gets SIGKILL.
pub fn terminate_groups(groups: &[Pid]) {
    for &pgid in groups {
        signal_group(pgid, Signal::SIGTERM);
    }
    let deadline = Instant::now() + TERM_GRACE;
    while any_tracked(groups) && Instant::now() < deadline {
        thread::sleep(SETTLE_POLL);
    }
    for &pgid in groups {
        signal_group(pgid, Signal::SIGKILL);
    }
}

/// Terminates every live group and refuses new ones. Returns how many groups
/// were running.
pub fn terminate_live_groups() -> usize {
    let groups = {
        let mut reg = registry();
        reg.draining = true;
        reg.groups
            .iter()
            .map(|&raw| Pid::from_raw(raw))
            .collect::<Vec<_>>()
    };
    terminate_groups(&groups);
    groups.len()
}

/// Blocks SIGINT and SIGTERM in the calling thread and waits for them on a
/// dedicated thread. Must run before the engine starts any other thread so
/// that all of them inherit the mask. On delivery the live gate groups are
/// terminated and the process exits with 128 + the signal number.
pub fn install_shutdown_handler() -> Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()
        .map_err(|e| VerifyError::config(format!("failed to block shutdown signals: {}", e)))?;
    thread::Builder::new()
        .name("vgate-signals".to_string())
        .spawn(move || watch(set))
        .map_err(|e| VerifyError::config(format!("failed to start signal watcher: {}", e)))?;
    Ok(())
}

fn watch(set: SigSet) {
    let signal = loop {
        match set.wait() {
            Ok(signal) => break signal,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!("waiting for shutdown signals failed: {}", e);
                return;
            }
        }
    };
    eprintln!("vgate: received {}, terminating running gates", signal.as_str());
    tracing::warn!(signal = signal.as_str(), "shutdown requested");
    let groups = terminate_live_groups();
    tracing::warn!(groups, "gate process groups terminated");
    std::process::exit(128 + signal as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{group_command, supervise, ProcessOutcome};
    use nix::sys::signal::killpg;
    use std::path::Path;

    fn spawn_tracked(script: &str) -> (Pid, thread::JoinHandle<ProcessOutcome>) {
        let argv = ["sh".to_string(), "-c".to_string(), script.to_string()];
        let mut child = group_command(&argv, Path::new("/")).spawn().expect("spawn");
        let pgid = Pid::from_raw(child.id() as i32);
        let handle = thread::spawn(move || {
            supervise(&mut child, Duration::from_secs(60)).expect("supervise")
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        while !live_groups().contains(&pgid) {
            assert!(Instant::now() < deadline, "group {} never tracked", pgid);
            thread::sleep(SETTLE_POLL);
        }
        (pgid, handle)
    }

    #[test]
    fn terminated_group_is_reaped_and_untracked() {
        let (pgid, handle) = spawn_tracked("exec sleep 30");
        let started = Instant::now();
        terminate_groups(&[pgid]);
        let outcome = handle.join().expect("supervisor");
        assert_eq!(outcome, ProcessOutcome::exited(128 + 15));
        assert!(started.elapsed() < TERM_GRACE);
        assert!(!live_groups().contains(&pgid));
        assert_eq!(killpg(pgid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn group_ignoring_sigterm_is_killed_after_grace() {
        let (pgid, handle) = spawn_tracked("trap '' TERM; exec sleep 30");
        let started = Instant::now();
        terminate_groups(&[pgid]);
        let outcome = handle.join().expect("supervisor");
        assert_eq!(outcome, ProcessOutcome::exited(128 + 9));
        assert!(started.elapsed() >= TERM_GRACE);
        assert_eq!(killpg(pgid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn dropping_the_guard_untracks_the_group() {
        let pgid = Pid::from_raw(i32::MAX - 7);
        let guard = track(pgid);
        assert!(live_groups().contains(&pgid));
        drop(guard);
        assert!(!live_groups().contains(&pgid));
    }
}
