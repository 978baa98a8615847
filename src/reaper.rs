//! PID-1 init/reaper (component A).
//!
//! Sidecar containers frequently inherit PID 1. Without a real init, exited
//! subprocesses of subprocesses (e.g. a credential helper that forks) become
//! zombies nothing ever reaps, and signals sent to the container (docker
//! stop, a Kubernetes preStop) land on PID 1 but are never delivered to the
//! actual worker process, because the kernel's default disposition for
//! SIGTERM on PID 1 is "do nothing" unless a handler is installed.
//!
//! When gitsync discovers it's running as PID 1 it re-execs itself as a
//! child, then sits in a minimal init loop: forward every signal except
//! child-terminated to the child verbatim, and after every wakeup drain
//! reapable children with non-blocking `waitpid`. This must tolerate
//! spurious wakeups and `EINTR` - the reap loop runs unconditionally on
//! every signal, not just `SIGCHLD`.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::iterator::Signals;

/// Exit code used when the init loop itself fails in some unrecoverable way
/// (spawn failure, inability to register signal handlers). Distinct from any
/// code the child could plausibly produce itself.
pub const INIT_ERROR_EXIT_CODE: i32 = 127;

pub fn is_pid1() -> bool {
    nix::unistd::getpid() == Pid::from_raw(1)
}

/// All signals we can legally catch, forwarding everything except
/// `SIGCHLD` to the child. `SIGKILL` and `SIGSTOP` cannot be caught, so
/// they're never in this list - the kernel handles them directly regardless
/// of what PID 1 does.
fn catchable_signals() -> Vec<libc::c_int> {
    (1..=31)
        .filter(|&s| s != Signal::SIGKILL as i32 && s != Signal::SIGSTOP as i32)
        .collect()
}

/// Re-exec the current binary with the original argv as a child, then act as
/// init until that child exits: forward signals, reap everything reapable.
/// Never returns - terminates the process with the translated exit status.
pub fn run_as_init() -> ! {
    match run_as_init_inner() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("gitsync: fatal error in pid-1 reaper: {e:#}");
            std::process::exit(INIT_ERROR_EXIT_CODE);
        }
    }
}

fn run_as_init_inner() -> Result<i32> {
    let exe = std::env::current_exe().context("resolving own executable path")?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();

    let mut signals =
        Signals::new(catchable_signals()).context("registering signal handlers")?;

    let child = std::process::Command::new(&exe)
        .args(&args)
        .spawn()
        .with_context(|| format!("spawning child {exe:?}"))?;
    let child_pid = Pid::from_raw(child.id() as i32);
    info!("running as pid 1, forwarding to child {child_pid}");

    // Drop the std::process::Child without letting its Drop impl matter -
    // we reap exclusively via waitpid below, since we also need to reap
    // any other orphans that get re-parented to us.
    std::mem::forget(child);

    loop {
        for raw_signal in signals.wait() {
            if let Ok(signal) = Signal::try_from(raw_signal) {
                if signal != Signal::SIGCHLD {
                    if let Err(e) = kill(child_pid, signal) {
                        debug!("failed to forward {signal:?} to child: {e}");
                    }
                }
            }
        }

        // Always attempt non-blocking reaps after any wakeup - this is what
        // makes the loop robust against spurious wakeups and EINTR, and is
        // how we actually reap grandchildren that got reparented to us.
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        if pid == child_pid {
                            return Ok(translate_exit_status(status));
                        }
                        debug!("reaped orphan pid {pid}");
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid failed: {e}");
                    break;
                }
            }
        }
    }
}

fn translate_exit_status(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        other => {
            warn!("child terminated with unexpected status {other:?}");
            INIT_ERROR_EXIT_CODE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catchable_signals_excludes_unblockable() {
        let signals = catchable_signals();
        assert!(!signals.contains(&(Signal::SIGKILL as i32)));
        assert!(!signals.contains(&(Signal::SIGSTOP as i32)));
        assert!(signals.contains(&(Signal::SIGTERM as i32)));
        assert!(signals.contains(&(Signal::SIGCHLD as i32)));
    }
}
