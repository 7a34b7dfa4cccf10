//! Process handles: identity, parent/child bookkeeping and signal dispatch.

use std::collections::HashMap;
use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, warn};

use crate::signal;

/// Errors from process-level operations.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// `fork(2)` itself failed; the spawn attempt produced no child.
    #[error("fork failed: {0}")]
    ForkFailed(#[source] Errno),

    /// Installing the OS-level handler for a signal failed.
    #[error("failed to install handler for {signal}: {source}")]
    HandlerInstall {
        /// The signal whose handler could not be installed.
        signal: Signal,
        #[source]
        source: Errno,
    },

    /// The signal is outside the default set and has no counter backing it.
    #[error("{0} is outside the watchable signal set")]
    UnsupportedSignal(Signal),

    /// Sending a signal to this handle's pid failed.
    #[error("failed to send {signal} to pid {pid}: {source}")]
    SignalSend {
        /// The signal that could not be delivered.
        signal: Signal,
        /// The target pid.
        pid: Pid,
        #[source]
        source: Errno,
    },
}

/// Whether a handle describes the supervising process or a forked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The process that owns the pool; has no parent reference.
    Root,
    /// A forked process; always carries its parent's pid.
    Child,
}

/// One delivery of a signal, as seen by the callbacks registered on a handle.
#[derive(Debug, Clone, Copy)]
pub struct SignalEvent {
    /// The delivered signal.
    pub signal: Signal,
    /// Occurrence count for this signal on this process, after this delivery.
    pub count: u64,
    /// Pid of the process the handle describes.
    pub pid: Pid,
    /// For child-exit deliveries: the pid of the exited child, when known.
    pub child: Option<Pid>,
    /// For child-exit deliveries: the raw exit status, when known.
    pub status: Option<i32>,
}

type SignalCallback = Box<dyn FnMut(&SignalEvent) + Send>;

/// Wraps one OS process: the current one (root) or a tracked child.
///
/// A handle owns the handles of the children it forked, keyed by pid; a
/// child entry lives exactly as long as the child is believed alive, from
/// fork to reap. Each handle also carries a per-signal callback registry and
/// per-signal occurrence counts, fed through [`dispatch`](Self::dispatch).
///
/// How a signal reaches `dispatch` depends on the role: a worker process
/// (`Role::Child`) installs raw counting handlers when a signal is watched
/// and drains the counters through [`poll_signals`](Self::poll_signals); the
/// root handle inside a running supervisor is fed synthetically from the
/// supervisor's event loop, which owns the process-wide signal streams.
pub struct ProcessHandle {
    pid: Pid,
    role: Role,
    parent_pid: Option<Pid>,
    children: HashMap<Pid, ProcessHandle>,
    callbacks: HashMap<Signal, Vec<SignalCallback>>,
    counts: HashMap<Signal, u64>,
}

impl ProcessHandle {
    /// A root handle for the calling process.
    pub fn root() -> Self {
        Self::new(getpid(), Role::Root, None)
    }

    fn new(pid: Pid, role: Role, parent_pid: Option<Pid>) -> Self {
        Self {
            pid,
            role,
            parent_pid,
            children: HashMap::new(),
            callbacks: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    /// Pid of the process this handle describes. Fixed at construction.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// After a daemonizing fork the surviving process keeps the old handle;
    /// its identity has to catch up.
    pub(crate) fn adopt_current_pid(&mut self) {
        self.pid = getpid();
    }

    /// This handle's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True for the supervising process's own handle.
    pub fn is_root(&self) -> bool {
        self.role == Role::Root
    }

    /// True for a forked worker's handle.
    pub fn is_child(&self) -> bool {
        self.role == Role::Child
    }

    /// Pid of the parent process, for child handles.
    pub fn parent_pid(&self) -> Option<Pid> {
        self.parent_pid
    }

    /// Starts counting `signal` on this handle without attaching a callback.
    ///
    /// On the first call for a given signal this installs the OS-level
    /// handler (worker processes only; see the type-level docs). Returns the
    /// handle for chaining.
    pub fn watch(&mut self, signal: Signal) -> Result<&mut Self, ProcessError> {
        if !self.callbacks.contains_key(&signal) {
            debug!(%signal, pid = %self.pid, "watching signal");
            if self.role == Role::Child {
                crate::signal::install(signal)?;
            }
            self.callbacks.insert(signal, Vec::new());
            self.counts.entry(signal).or_insert(0);
        }
        Ok(self)
    }

    /// Appends `callback` to the signal's callback list, watching the signal
    /// first if needed. Callbacks run in registration order on every
    /// dispatch and never from signal context.
    pub fn register<F>(&mut self, signal: Signal, callback: F) -> Result<&mut Self, ProcessError>
    where
        F: FnMut(&SignalEvent) + Send + 'static,
    {
        self.watch(signal)?;
        self.callbacks.entry(signal).or_default().push(Box::new(callback));
        Ok(self)
    }

    /// Watches the default signal set: reload request (SIGHUP), user
    /// interrupt (SIGINT), terminate request (SIGTERM) and child exit
    /// (SIGCHLD).
    pub fn register_default_signals(&mut self) -> Result<&mut Self, ProcessError> {
        self.watch(Signal::SIGHUP)?;
        self.watch(Signal::SIGINT)?;
        self.watch(Signal::SIGTERM)?;
        self.watch(Signal::SIGCHLD)?;
        Ok(self)
    }

    /// Records one delivery of `signal` and fans it out to every registered
    /// callback, in registration order. Returns the new occurrence count.
    ///
    /// `child` and `status` carry reap details for synthetic child-exit
    /// deliveries; plain OS deliveries pass `None`.
    pub fn dispatch(&mut self, signal: Signal, child: Option<Pid>, status: Option<i32>) -> u64 {
        let entry = self.counts.entry(signal).or_insert(0);
        *entry += 1;
        let count = *entry;
        debug!(%signal, count, pid = %self.pid, "dispatching signal");

        let event = SignalEvent {
            signal,
            count,
            pid: self.pid,
            child,
            status,
        };
        if let Some(callbacks) = self.callbacks.get_mut(&signal) {
            for callback in callbacks.iter_mut() {
                callback(&event);
            }
        }
        count
    }

    /// Drains raw handler counts through [`dispatch`](Self::dispatch), so
    /// callbacks fire from normal code. Workers call this from their run
    /// loop; on a root handle it is a no-op.
    pub fn poll_signals(&mut self) {
        let watched: Vec<Signal> = self.counts.keys().copied().collect();
        for sig in watched {
            while self.counts.get(&sig).copied().unwrap_or(0) < signal::count(sig) {
                self.dispatch(sig, None, None);
            }
        }
    }

    /// Occurrence count for `signal` on this process.
    ///
    /// For a worker the raw handler counters are authoritative even when the
    /// worker never polls; dispatched counts only ever trail them.
    pub fn signal_count(&self, signal: Signal) -> u64 {
        let dispatched = self.counts.get(&signal).copied().unwrap_or(0);
        match self.role {
            Role::Child => dispatched.max(crate::signal::count(signal)),
            Role::Root => dispatched,
        }
    }

    /// Reload requests seen so far.
    pub fn hangup_count(&self) -> u64 {
        self.signal_count(Signal::SIGHUP)
    }

    /// User interrupts seen so far.
    pub fn interrupt_count(&self) -> u64 {
        self.signal_count(Signal::SIGINT)
    }

    /// Terminate requests seen so far.
    pub fn terminate_count(&self) -> u64 {
        self.signal_count(Signal::SIGTERM)
    }

    /// Child-exit notifications seen so far.
    pub fn child_exit_count(&self) -> u64 {
        self.signal_count(Signal::SIGCHLD)
    }

    /// Interrupts plus terminate requests: non-zero means this process has
    /// been asked to stop. Long-running workers poll this to exit
    /// cooperatively.
    pub fn end_count(&self) -> u64 {
        self.interrupt_count() + self.terminate_count()
    }

    /// Creates a new worker process running `child_main`.
    ///
    /// In the parent this registers a child handle under the new pid and
    /// returns it immediately. In the new process it resets the per-process
    /// signal counters, watches the default signal set on a fresh child
    /// handle, runs `child_main` with it, and exits with status 0 when the
    /// closure returns. A closure that never returns (for example one that
    /// exits the process itself) is also valid.
    pub fn fork<F>(&mut self, child_main: F) -> Result<Pid, ProcessError>
    where
        F: FnOnce(&mut ProcessHandle),
    {
        // SAFETY: the child branch only runs the worker body on a fresh
        // handle and then exits; it never returns into the caller's stack or
        // resumes the parent's event loop.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(worker = %child, parent = %self.pid, "forked worker");
                self.add_child(ProcessHandle::new(child, Role::Child, Some(self.pid)));
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                let mut me = ProcessHandle::new(getpid(), Role::Child, Some(self.pid));
                signal::reset_counts();
                if let Err(error) = me.register_default_signals() {
                    warn!(%error, "worker could not register default signals");
                }
                child_main(&mut me);
                std::process::exit(0);
            }
            Err(errno) => Err(ProcessError::ForkFailed(errno)),
        }
    }

    /// Registers a handle for a child created outside [`fork`](Self::fork).
    pub fn create_child(&mut self, pid: Pid) -> &ProcessHandle {
        let parent = self.pid;
        self.children
            .entry(pid)
            .or_insert_with(|| ProcessHandle::new(pid, Role::Child, Some(parent)))
    }

    /// Tracks `child` under its pid. A pid is never tracked twice without
    /// being removed first.
    pub fn add_child(&mut self, child: ProcessHandle) {
        debug_assert!(
            !self.children.contains_key(&child.pid),
            "pid tracked twice without removal"
        );
        self.children.insert(child.pid, child);
    }

    /// Stops tracking a child, by pid or by handle reference. Returns the
    /// owned handle if it was tracked.
    pub fn remove_child(&mut self, child: impl Into<Pid>) -> Option<ProcessHandle> {
        let pid = child.into();
        debug!(%pid, "removing child");
        self.children.remove(&pid)
    }

    /// The tracked child with this pid, if still alive.
    pub fn child(&self, pid: Pid) -> Option<&ProcessHandle> {
        self.children.get(&pid)
    }

    /// All currently tracked children, keyed by pid.
    pub fn children(&self) -> &HashMap<Pid, ProcessHandle> {
        &self.children
    }

    /// Sends SIGKILL to this handle's process.
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.send_signal(Signal::SIGKILL)
    }

    /// Sends an arbitrary signal to this handle's process.
    pub fn send_signal(&self, signal: Signal) -> Result<(), ProcessError> {
        debug!(%signal, pid = %self.pid, "sending signal");
        kill(self.pid, signal).map_err(|source| ProcessError::SignalSend {
            signal,
            pid: self.pid,
            source,
        })
    }
}

impl From<&ProcessHandle> for Pid {
    fn from(handle: &ProcessHandle) -> Self {
        handle.pid
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("role", &self.role)
            .field("parent_pid", &self.parent_pid)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
