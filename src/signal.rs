//! Raw per-process signal counters for worker processes.
//!
//! A forked worker has no event loop, so the only thing its OS-level signal
//! handler does is bump a static atomic counter. Callback fan-out, logging
//! and every other non-trivial reaction happen later, from normal code, via
//! [`ProcessHandle::poll_signals`](crate::ProcessHandle::poll_signals) or
//! [`ProcessHandle::end_count`](crate::ProcessHandle::end_count).
//!
//! Counters exist for the default signal set only: SIGHUP (reload request),
//! SIGINT (user interrupt), SIGTERM (terminate request) and SIGCHLD (a child
//! exited).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::process::ProcessError;

static HANGUPS: AtomicU64 = AtomicU64::new(0);
static INTERRUPTS: AtomicU64 = AtomicU64::new(0);
static TERMINATES: AtomicU64 = AtomicU64::new(0);
static CHILD_EXITS: AtomicU64 = AtomicU64::new(0);

static HANGUPS_INSTALLED: AtomicBool = AtomicBool::new(false);
static INTERRUPTS_INSTALLED: AtomicBool = AtomicBool::new(false);
static TERMINATES_INSTALLED: AtomicBool = AtomicBool::new(false);
static CHILD_EXITS_INSTALLED: AtomicBool = AtomicBool::new(false);

fn counter(signal: Signal) -> Option<&'static AtomicU64> {
    match signal {
        Signal::SIGHUP => Some(&HANGUPS),
        Signal::SIGINT => Some(&INTERRUPTS),
        Signal::SIGTERM => Some(&TERMINATES),
        Signal::SIGCHLD => Some(&CHILD_EXITS),
        _ => None,
    }
}

fn installed(signal: Signal) -> Option<&'static AtomicBool> {
    match signal {
        Signal::SIGHUP => Some(&HANGUPS_INSTALLED),
        Signal::SIGINT => Some(&INTERRUPTS_INSTALLED),
        Signal::SIGTERM => Some(&TERMINATES_INSTALLED),
        Signal::SIGCHLD => Some(&CHILD_EXITS_INSTALLED),
        _ => None,
    }
}

/// The only code that runs in signal context: one atomic increment.
extern "C" fn bump(signo: libc::c_int) {
    let counter = match signo {
        libc::SIGHUP => &HANGUPS,
        libc::SIGINT => &INTERRUPTS,
        libc::SIGTERM => &TERMINATES,
        libc::SIGCHLD => &CHILD_EXITS,
        _ => return,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Installs the counting handler for `signal`, once per process.
///
/// Idempotent: later calls for an already-installed signal are no-ops. A
/// process forked from one that already installed handlers inherits both the
/// disposition and the installed flag, so nothing is re-done there either.
pub(crate) fn install(signal: Signal) -> Result<(), ProcessError> {
    let Some(flag) = installed(signal) else {
        return Err(ProcessError::UnsupportedSignal(signal));
    };
    if flag.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::Handler(bump),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: `bump` is async-signal-safe (a single relaxed atomic add on a
    // static) and replaces the previous disposition wholesale, which is the
    // intent: a freshly forked worker must not keep running its parent's
    // handlers.
    if let Err(source) = unsafe { sigaction(signal, &action) } {
        flag.store(false, Ordering::Release);
        return Err(ProcessError::HandlerInstall { signal, source });
    }
    Ok(())
}

/// How many times `signal` has been delivered to this process.
///
/// Zero for signals outside the default set and for processes that never
/// installed a handler.
pub(crate) fn count(signal: Signal) -> u64 {
    counter(signal).map_or(0, |c| c.load(Ordering::Relaxed))
}

/// Zeroes every counter. Called in the child branch of a fork so that counts
/// are per-process, not inherited.
pub(crate) fn reset_counts() {
    HANGUPS.store(0, Ordering::Relaxed);
    INTERRUPTS.store(0, Ordering::Relaxed);
    TERMINATES.store(0, Ordering::Relaxed);
    CHILD_EXITS.store(0, Ordering::Relaxed);
}
