use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::supervisor::{PoolStatus, SupervisorError, SupervisorMessage};

/// Errors from driving a running supervisor through its handle.
#[derive(Debug, Error)]
pub enum SupervisorHandleError {
    /// The control loop is no longer running.
    #[error("supervisor is not running: {0}")]
    SendError(String),

    /// The loop stopped before answering a status query.
    #[error("supervisor dropped the status reply")]
    NoReply,
}

/// Controls a running [`Supervisor`](crate::Supervisor) from outside its
/// loop: inject signals, request a drain, snapshot the pool, wait for it to
/// stop.
#[derive(Debug)]
pub struct SupervisorHandle {
    join_handle: JoinHandle<Result<(), SupervisorError>>,
    tx: mpsc::UnboundedSender<SupervisorMessage>,
}

impl SupervisorHandle {
    pub(crate) fn new(
        join_handle: JoinHandle<Result<(), SupervisorError>>,
        tx: mpsc::UnboundedSender<SupervisorMessage>,
    ) -> Self {
        Self { join_handle, tx }
    }

    /// Delivers a synthetic user interrupt, as if SIGINT had been received.
    pub fn interrupt(&self) -> Result<(), SupervisorHandleError> {
        self.deliver(Signal::SIGINT)
    }

    /// Delivers a synthetic terminate request.
    pub fn terminate(&self) -> Result<(), SupervisorHandleError> {
        self.deliver(Signal::SIGTERM)
    }

    /// Delivers a synthetic reload request.
    pub fn hangup(&self) -> Result<(), SupervisorHandleError> {
        self.deliver(Signal::SIGHUP)
    }

    /// Delivers any synthetic signal to the supervisor's root handle.
    pub fn deliver(&self, signal: Signal) -> Result<(), SupervisorHandleError> {
        self.send(SupervisorMessage::Deliver(signal))
    }

    /// Requests a graceful drain: no new workers, running ones may finish.
    pub fn shutdown(&self) -> Result<(), SupervisorHandleError> {
        self.send(SupervisorMessage::Shutdown)
    }

    /// Snapshots the pool state.
    pub async fn status(&self) -> Result<PoolStatus, SupervisorHandleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SupervisorMessage::Status(reply_tx))?;
        reply_rx.await.map_err(|_| SupervisorHandleError::NoReply)
    }

    /// Waits for the supervisor to stop: `Ok` after a graceful drain, `Err`
    /// after interrupt escalation or a startup failure.
    pub async fn wait(self) -> Result<(), SupervisorError> {
        self.join_handle.await?
    }

    fn send(&self, message: SupervisorMessage) -> Result<(), SupervisorHandleError> {
        self.tx
            .send(message)
            .map_err(|e| SupervisorHandleError::SendError(e.to_string()))
    }
}
