//! The unit of work a worker process runs, and its adapter.

use tracing::error;

use crate::process::ProcessHandle;

/// Error type for a failed unit of work.
pub type WorkerError = anyhow::Error;

/// What a worker's unit of work returns.
pub type WorkerResult = Result<(), WorkerError>;

/// One worker's unit of work, run once per forked process.
///
/// The implementation receives the worker's own [`ProcessHandle`] and may
/// poll [`end_count`](ProcessHandle::end_count) to detect a pending stop
/// request and return cooperatively. It may also never return and terminate
/// the process itself; the exit status is what the supervisor sees either
/// way.
///
/// Any `FnMut(&mut ProcessHandle) -> WorkerResult` is a `Worker`:
///
/// ```rust
/// use forkpool::{ProcessHandle, Worker, WorkerResult};
///
/// fn count_to_ten(process: &mut ProcessHandle) -> WorkerResult {
///     for _ in 0..10 {
///         if process.end_count() > 0 {
///             break;
///         }
///     }
///     Ok(())
/// }
///
/// fn assert_worker(_: impl Worker) {}
/// assert_worker(count_to_ten);
/// ```
pub trait Worker: Send {
    /// Runs the unit of work to completion.
    fn run(&mut self, process: &mut ProcessHandle) -> WorkerResult;
}

impl<F> Worker for F
where
    F: FnMut(&mut ProcessHandle) -> WorkerResult + Send,
{
    fn run(&mut self, process: &mut ProcessHandle) -> WorkerResult {
        self(process)
    }
}

/// Pairs a worker with the process handle it runs under.
///
/// Purely a convenience boundary: worker code gets one stable object holding
/// the handle it should query for stop requests. [`execute`](Self::execute)
/// maps the worker's result to the process exit status the supervisor will
/// observe.
pub struct Task<'a> {
    process: &'a mut ProcessHandle,
    worker: &'a mut dyn Worker,
}

impl<'a> Task<'a> {
    /// Binds `worker` to the process it will run in.
    pub fn new(process: &'a mut ProcessHandle, worker: &'a mut dyn Worker) -> Self {
        Self { process, worker }
    }

    /// Runs the worker with its process handle. Returns the exit status to
    /// terminate with: 0 on success, 1 on error.
    pub fn execute(&mut self) -> i32 {
        match self.worker.run(self.process) {
            Ok(()) => 0,
            Err(error) => {
                error!(%error, "worker failed");
                1
            }
        }
    }
}
