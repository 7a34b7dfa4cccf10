use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use forkpool::{ProcessHandle, Supervisor, SupervisorBuilder, Worker, WorkerResult};

static POOL_LOCK: Mutex<()> = Mutex::new(());

/// Pools fork real processes and reap with `waitpid(-1)`, so only one pool
/// may run per test process at a time.
#[allow(unused)]
pub fn pool_guard() -> MutexGuard<'static, ()> {
    POOL_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a pool with fast ticks so scenarios finish quickly.
#[allow(unused)]
pub fn fast_pool(parallelism: usize, worker: impl Worker + 'static) -> Supervisor {
    SupervisorBuilder::new(worker)
        .with_parallelism(parallelism)
        .with_tick_interval(Duration::from_millis(20))
        .build()
}

/// Finishes immediately with a clean status.
#[allow(unused)]
pub fn clean_worker(_process: &mut ProcessHandle) -> WorkerResult {
    Ok(())
}

/// Dies with status 1.
#[allow(unused)]
pub fn failing_worker(_process: &mut ProcessHandle) -> WorkerResult {
    std::process::exit(1);
}

/// Looks long-running; relies on the pool to stop it.
#[allow(unused)]
pub fn sleepy_worker(_process: &mut ProcessHandle) -> WorkerResult {
    std::thread::sleep(Duration::from_secs(30));
    Ok(())
}
