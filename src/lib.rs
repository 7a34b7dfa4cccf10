//! # forkpool
//!
//! `forkpool` keeps a pool of forked worker processes alive on a single Unix
//! host. A supervising process forks workers up to a target parallelism,
//! reaps their exits, respawns them while the pool is healthy, and drains or
//! escalates when things go wrong.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use forkpool::{ProcessHandle, SupervisorBuilder, WorkerResult};
//!
//! fn unit_of_work(process: &mut ProcessHandle) -> WorkerResult {
//!     // Runs in its own forked process. Poll `end_count` so a pending
//!     // interrupt or terminate request stops the loop cooperatively.
//!     while process.end_count() == 0 {
//!         std::thread::sleep(Duration::from_millis(500));
//!     }
//!     Ok(())
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = SupervisorBuilder::new(unit_of_work)
//!         .with_parallelism(4)
//!         .build();
//!
//!     supervisor.run().wait().await?; // until drained or escalated
//!     Ok(())
//! }
//! ```
//!
//! ## What you get
//!
//! * **Automatic respawns** – a worker that exits is replaced on the next
//!   control-loop tick, as long as the pool is not draining.
//! * **Failure budget** – abnormal exits and failed spawns count against a
//!   budget; exceeding it drains the pool gracefully.
//! * **Interrupt escalation** – the first interrupt starts a drain, repeated
//!   interrupts force-kill every worker.
//! * **Dynamic control** – inject signals, request a drain, or snapshot pool
//!   state through a [`SupervisorHandle`].
//!
//! Workers are OS processes, not threads: the only channels between the
//! supervisor and its workers are `fork(2)` and signal delivery, so a
//! misbehaving worker cannot corrupt pool state. Unix only.

pub use process::{ProcessError, ProcessHandle, Role, SignalEvent};
pub use supervisor::{
    builder::SupervisorBuilder,
    handle::{SupervisorHandle, SupervisorHandleError},
    PoolStatus, Supervisor, SupervisorError, DEFAULT_MAX_BAD_COUNT, DEFAULT_MAX_INTERRUPTS,
    DEFAULT_TICK_INTERVAL,
};
pub use task::{Task, Worker, WorkerError, WorkerResult};

/// Signal numbers, re-exported from `nix`.
pub use nix::sys::signal::Signal;

mod process;
mod signal;
mod supervisor;
mod task;
