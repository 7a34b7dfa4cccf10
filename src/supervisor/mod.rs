pub(crate) mod builder;
pub(crate) mod handle;

use std::collections::HashMap;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tokio::signal::unix::{signal as unix_signal, Signal as SignalStream, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::process::{ProcessError, ProcessHandle};
use crate::supervisor::handle::SupervisorHandle;
use crate::task::{Task, Worker};

/// Interval between control-loop ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Abnormal exits and failed spawns tolerated before the pool drains.
pub const DEFAULT_MAX_BAD_COUNT: u32 = 5;

/// User interrupts tolerated before every worker is force-killed.
pub const DEFAULT_MAX_INTERRUPTS: u64 = 3;

/// Errors that stop a supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A Unix signal stream could not be installed at startup.
    #[error("failed to install {signal} stream: {source}")]
    SignalStream {
        /// Name of the signal whose stream failed.
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The user interrupted too many times; every tracked worker was
    /// force-killed. Entry points should map this to exit status 1.
    #[error("interrupted {count} times, force-killed {killed} workers")]
    InterruptEscalation {
        /// Interrupts observed when escalation fired.
        count: u64,
        /// Workers successfully sent SIGKILL.
        killed: usize,
    },

    /// A process-level failure outside the recoverable fork path.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The supervision task itself failed to join.
    #[error("supervision loop failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Commands sent from a [`SupervisorHandle`] into the control loop.
#[derive(Debug)]
pub(crate) enum SupervisorMessage {
    /// Synthetic delivery of a signal, as if the OS had sent it.
    Deliver(Signal),
    /// Request a graceful drain: stop spawning, let workers finish.
    Shutdown,
    /// Snapshot the pool state.
    Status(oneshot::Sender<PoolStatus>),
}

/// Point-in-time view of the pool, from [`SupervisorHandle::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Workers currently believed alive.
    pub running: usize,
    /// Total forks performed so far.
    pub spawned: u64,
    /// Abnormal exits and failed spawns since the last clean spawn.
    pub bad_count: u32,
    /// Whether the pool is draining.
    pub exiting: bool,
    /// User interrupts observed so far.
    pub interrupts: u64,
}

/// Keeps a pool of forked worker processes at a target size.
///
/// The supervisor forks one worker per tick while below target, reaps worker
/// exits, and respawns replacements. Abnormal exits and failed spawns count
/// against a failure budget; exceeding it latches the pool into a drain
/// (existing workers finish, nothing new spawns). A user interrupt also
/// starts a drain, and repeated interrupts force-kill every worker.
///
/// All asynchronous OS notifications (child exit, interrupt, terminate,
/// reload) are turned into events consumed by one `select!` loop; pool state
/// is only ever touched from that loop, never from signal context.
pub struct Supervisor {
    pub(crate) parallelism: usize,
    pub(crate) worker: Box<dyn Worker>,
    pub(crate) root: ProcessHandle,
    /// Exit statuses reaped before their fork bookkeeping completed.
    pub(crate) pending: HashMap<Pid, i32>,
    pub(crate) spawned: u64,
    pub(crate) bad_count: u32,
    pub(crate) exiting: bool,
    pub(crate) is_daemon: bool,
    pub(crate) tick_interval: Duration,
    pub(crate) max_bad_count: u32,
    pub(crate) max_interrupts: u64,
    pub(crate) external_tx: mpsc::UnboundedSender<SupervisorMessage>,
    pub(crate) external_rx: mpsc::UnboundedReceiver<SupervisorMessage>,
}

impl Supervisor {
    /// Runs the supervisor, consuming it and returning a handle for external
    /// control.
    pub fn run(self) -> SupervisorHandle {
        let external_tx = self.external_tx.clone();
        let join_handle = tokio::spawn(self.run_and_supervise());
        SupervisorHandle::new(join_handle, external_tx)
    }

    /// Forks once so the pool outlives the invoking foreground process. The
    /// original process exits with status 0; the forked process becomes the
    /// daemon instance and should then be [`run`](Self::run).
    ///
    /// This is a single fork, not a full detach: no new session, no stream
    /// redirection, no working-directory change. Callers that need those
    /// must layer them themselves. Call from a synchronous context, before
    /// the async runtime starts.
    pub fn daemonize(mut self) -> Result<Self, SupervisorError> {
        debug!("forking daemon instance");
        // SAFETY: runs before the runtime exists; the parent branch only
        // exits, and the child continues as the sole owner of this state.
        match unsafe { fork() }.map_err(ProcessError::ForkFailed)? {
            ForkResult::Parent { child } => {
                info!(daemon = %child, "daemon created, foreground process exiting");
                std::process::exit(0);
            }
            ForkResult::Child => {
                self.is_daemon = true;
                self.root.adopt_current_pid();
                info!(pid = %self.root.pid(), "daemon process running");
                Ok(self)
            }
        }
    }

    /// The main supervision loop: signal streams, handle commands and the
    /// periodic tick, all consumed in one place.
    async fn run_and_supervise(mut self) -> Result<(), SupervisorError> {
        let mut sigchld = stream(SignalKind::child(), "SIGCHLD")?;
        let mut sigint = stream(SignalKind::interrupt(), "SIGINT")?;
        let mut sigterm = stream(SignalKind::terminate(), "SIGTERM")?;
        let mut sighup = stream(SignalKind::hangup(), "SIGHUP")?;

        self.root.register_default_signals()?;

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            parallelism = self.parallelism,
            pid = %self.root.pid(),
            "starting worker pool"
        );

        let result = loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.tick() {
                        break Ok(());
                    }
                }
                _ = sigchld.recv() => {
                    self.root.dispatch(Signal::SIGCHLD, None, None);
                    self.reap_exited();
                }
                _ = sigint.recv() => {
                    let count = self.root.dispatch(Signal::SIGINT, None, None);
                    if let Err(e) = self.on_interrupt(count) {
                        break Err(e);
                    }
                }
                _ = sigterm.recv() => {
                    let count = self.root.dispatch(Signal::SIGTERM, None, None);
                    debug!(count, "terminate requested");
                }
                _ = sighup.recv() => {
                    self.root.dispatch(Signal::SIGHUP, None, None);
                    self.on_hangup();
                }
                Some(message) = self.external_rx.recv() => {
                    if let Err(e) = self.handle_message(message) {
                        break Err(e);
                    }
                }
            }
        };

        match &result {
            Ok(()) => info!("worker pool drained"),
            Err(error) => error!(%error, "worker pool stopped"),
        }
        result
    }

    /// One control-loop tick. Returns true once the pool has fully drained.
    fn tick(&mut self) -> bool {
        let running = self.root.children().len();
        debug!(
            running,
            parallelism = self.parallelism,
            bad_count = self.bad_count,
            "tick"
        );

        if !self.exiting && self.bad_count >= self.max_bad_count {
            info!(bad_count = self.bad_count, "failure budget exhausted, entering drain");
            self.exiting = true;
        }

        if self.exiting {
            if running == 0 {
                return true;
            }
            info!(running, "draining, waiting for workers to finish");
        } else if running < self.parallelism {
            self.spawn_one();
        }
        false
    }

    /// One spawn attempt. A fork failure is recoverable and counted against
    /// the failure budget; any other error is fatal to the pool and forces a
    /// drain.
    fn spawn_one(&mut self) {
        let worker = self.worker.as_mut();
        let forked = self.root.fork(|process| {
            std::process::exit(Task::new(process, worker).execute());
        });
        match forked {
            Ok(pid) => {
                self.spawned += 1;
                self.absorb_pending(pid);
                self.bad_count = 0;
            }
            Err(error @ ProcessError::ForkFailed(_)) => {
                warn!(%error, "spawn attempt failed");
                self.bad_count += 1;
            }
            Err(error) => {
                error!(%error, "unexpected spawn failure, draining pool");
                self.exiting = true;
            }
        }
    }

    /// Replays a buffered exit for a worker that finished before its fork
    /// bookkeeping completed.
    fn absorb_pending(&mut self, pid: Pid) {
        if let Some(status) = self.pending.remove(&pid) {
            debug!(%pid, status, "replaying buffered exit");
            self.root.dispatch(Signal::SIGCHLD, Some(pid), Some(status));
            self.record_exit(pid, status);
        }
    }

    /// Books one reaped (pid, status) pair. Untracked pids go to the race
    /// buffer until their fork bookkeeping catches up.
    fn record_exit(&mut self, pid: Pid, status: i32) {
        if self.root.child(pid).is_some() {
            if status != 0 {
                warn!(%pid, status, "worker exited abnormally");
                self.bad_count += 1;
            } else {
                debug!(%pid, "worker exited cleanly");
            }
            self.root.remove_child(pid);
        } else {
            debug!(%pid, status, "exit for unregistered worker, buffering");
            self.pending.insert(pid, status);
        }
    }

    /// Reaps every currently-exited child. Multiple exits can coalesce into
    /// one SIGCHLD delivery, so poll non-blockingly until the kernel reports
    /// nothing left.
    fn reap_exited(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => self.record_exit(pid, status),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    // Shell convention for deaths by signal; always abnormal.
                    self.record_exit(pid, 128 + signal as i32);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(other) => debug!(?other, "ignoring wait status"),
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    warn!(%errno, "waitpid failed");
                    break;
                }
            }
        }
    }

    /// Every interrupt starts a drain; too many force-kills the pool.
    fn on_interrupt(&mut self, count: u64) -> Result<(), SupervisorError> {
        info!(count, "interrupt received, draining");
        self.exiting = true;

        if count >= self.max_interrupts {
            error!(count, "interrupted too many times, force-killing workers");
            let mut killed = 0;
            for child in self.root.children().values() {
                match child.kill() {
                    Ok(()) => killed += 1,
                    Err(error) => warn!(%error, "could not kill worker"),
                }
            }
            return Err(SupervisorError::InterruptEscalation { count, killed });
        }
        Ok(())
    }

    /// Reload requests are observed and counted only; there is no restart
    /// implementation behind them.
    fn on_hangup(&mut self) {
        debug!("reload requested");
        if !self.is_daemon {
            error!("cannot restart, not running as a daemon");
        }
    }

    /// Processes one command from the handle.
    fn handle_message(&mut self, message: SupervisorMessage) -> Result<(), SupervisorError> {
        match message {
            SupervisorMessage::Deliver(Signal::SIGCHLD) => {
                self.root.dispatch(Signal::SIGCHLD, None, None);
                self.reap_exited();
            }
            SupervisorMessage::Deliver(Signal::SIGINT) => {
                let count = self.root.dispatch(Signal::SIGINT, None, None);
                self.on_interrupt(count)?;
            }
            SupervisorMessage::Deliver(Signal::SIGHUP) => {
                self.root.dispatch(Signal::SIGHUP, None, None);
                self.on_hangup();
            }
            SupervisorMessage::Deliver(signal) => {
                let count = self.root.dispatch(signal, None, None);
                debug!(%signal, count, "signal delivered");
            }
            SupervisorMessage::Shutdown => {
                info!("shutdown requested, draining");
                self.exiting = true;
            }
            SupervisorMessage::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
        Ok(())
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            running: self.root.children().len(),
            spawned: self.spawned,
            bad_count: self.bad_count,
            exiting: self.exiting,
            interrupts: self.root.interrupt_count(),
        }
    }
}

fn stream(kind: SignalKind, name: &'static str) -> Result<SignalStream, SupervisorError> {
    unix_signal(kind).map_err(|source| SupervisorError::SignalStream {
        signal: name,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SupervisorBuilder, WorkerResult};

    fn pool(parallelism: usize) -> Supervisor {
        SupervisorBuilder::new(|_: &mut ProcessHandle| -> WorkerResult { Ok(()) })
            .with_parallelism(parallelism)
            .build()
    }

    // A pid no real process on the test host will have.
    fn fake_pid(offset: i32) -> Pid {
        Pid::from_raw(i32::MAX - offset)
    }

    #[test]
    fn bad_count_tracks_abnormal_exits_only() {
        let mut sup = pool(4);
        for i in 0..4 {
            sup.root.create_child(fake_pid(i));
        }

        sup.record_exit(fake_pid(0), 0);
        assert_eq!(sup.bad_count, 0);

        sup.record_exit(fake_pid(1), 1);
        sup.record_exit(fake_pid(2), 137);
        assert_eq!(sup.bad_count, 2);
        assert_eq!(sup.root.children().len(), 1);
    }

    #[test]
    fn untracked_exit_is_buffered_and_replayed_exactly_once() {
        let mut sup = pool(1);
        let pid = fake_pid(0);

        // Exit notification lands before fork bookkeeping: buffered.
        sup.record_exit(pid, 1);
        assert_eq!(sup.bad_count, 0);
        assert_eq!(sup.pending.get(&pid), Some(&1));

        // Bookkeeping catches up; the replay books the failure and frees the
        // child slot.
        sup.root.create_child(pid);
        sup.absorb_pending(pid);
        assert_eq!(sup.bad_count, 1);
        assert!(sup.pending.is_empty());
        assert!(sup.root.children().is_empty());

        // No second replay, no double count.
        sup.absorb_pending(pid);
        assert_eq!(sup.bad_count, 1);
    }

    #[test]
    fn failure_budget_latches_the_drain() {
        let mut sup = pool(4);
        for i in 0..DEFAULT_MAX_BAD_COUNT as i32 {
            sup.root.create_child(fake_pid(i));
        }
        // Five abnormal exits between ticks, nothing respawned in between.
        for i in 0..DEFAULT_MAX_BAD_COUNT as i32 {
            sup.record_exit(fake_pid(i), 1);
        }
        assert_eq!(sup.bad_count, DEFAULT_MAX_BAD_COUNT);
        assert!(!sup.exiting);

        // Pool is empty, so the same tick that latches the drain also
        // observes it complete.
        assert!(sup.tick());
        assert!(sup.exiting);
    }

    #[test]
    fn draining_pool_waits_for_workers() {
        let mut sup = pool(4);
        sup.root.create_child(fake_pid(0));
        sup.bad_count = DEFAULT_MAX_BAD_COUNT;

        assert!(!sup.tick()); // drain latched, worker still running
        assert!(sup.exiting);
        assert_eq!(sup.root.children().len(), 1);

        sup.record_exit(fake_pid(0), 0);
        assert!(sup.tick()); // drained
    }

    #[test]
    fn pool_at_target_does_not_spawn() {
        let mut sup = pool(1);
        sup.root.create_child(fake_pid(0));
        assert!(!sup.tick());
        assert_eq!(sup.spawned, 0);
        assert!(!sup.exiting);
    }

    #[test]
    fn interrupts_below_threshold_drain_without_killing() {
        let mut sup = pool(2);
        sup.root.create_child(fake_pid(0));

        for count in 1..DEFAULT_MAX_INTERRUPTS {
            assert!(sup.on_interrupt(count).is_ok());
            assert!(sup.exiting);
            assert_eq!(sup.root.children().len(), 1);
        }
    }

    #[test]
    fn interrupt_threshold_escalates() {
        let mut sup = pool(2);
        sup.root.create_child(fake_pid(0));

        let err = sup.on_interrupt(DEFAULT_MAX_INTERRUPTS).unwrap_err();
        match err {
            SupervisorError::InterruptEscalation { count, .. } => {
                assert_eq!(count, DEFAULT_MAX_INTERRUPTS);
            }
            other => panic!("expected escalation, got {other}"),
        }
    }

    #[test]
    fn shutdown_message_requests_drain() {
        let mut sup = pool(2);
        assert!(!sup.exiting);
        sup.handle_message(SupervisorMessage::Shutdown).unwrap();
        assert!(sup.exiting);
    }

    #[test]
    fn hangup_is_counted_but_harmless() {
        let mut sup = pool(2);
        sup.root.register_default_signals().unwrap();
        sup.handle_message(SupervisorMessage::Deliver(Signal::SIGHUP))
            .unwrap();
        assert_eq!(sup.root.hangup_count(), 1);
        assert!(!sup.exiting);
    }

    #[test]
    fn status_snapshots_the_pool() {
        let mut sup = pool(3);
        sup.root.create_child(fake_pid(0));
        sup.bad_count = 2;

        let status = sup.status();
        assert_eq!(status.running, 1);
        assert_eq!(status.bad_count, 2);
        assert!(!status.exiting);
        assert_eq!(status.interrupts, 0);
    }
}
