use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::process::ProcessHandle;
use crate::supervisor::{
    Supervisor, DEFAULT_MAX_BAD_COUNT, DEFAULT_MAX_INTERRUPTS, DEFAULT_TICK_INTERVAL,
};
use crate::task::Worker;

/// Builds a [`Supervisor`] with configurable pool parameters.
///
/// Allows customization of the target parallelism, the control-loop tick
/// interval, the failure budget and the interrupt tolerance.
pub struct SupervisorBuilder {
    parallelism: usize,
    worker: Box<dyn Worker>,
    tick_interval: Duration,
    max_bad_count: u32,
    max_interrupts: u64,
}

impl SupervisorBuilder {
    /// Creates a builder around the unit of work each worker will run.
    pub fn new(worker: impl Worker + 'static) -> Self {
        Self {
            parallelism: 1,
            worker: Box::new(worker),
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_bad_count: DEFAULT_MAX_BAD_COUNT,
            max_interrupts: DEFAULT_MAX_INTERRUPTS,
        }
    }

    /// Sets the target number of concurrently running workers.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the interval between control-loop ticks.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets how many abnormal exits or failed spawns are tolerated before
    /// the pool drains.
    pub fn with_max_bad_count(mut self, count: u32) -> Self {
        self.max_bad_count = count;
        self
    }

    /// Sets how many user interrupts are tolerated before every worker is
    /// force-killed.
    pub fn with_max_interrupts(mut self, count: u64) -> Self {
        self.max_interrupts = count;
        self
    }

    /// Constructs the [`Supervisor`] with the configured settings.
    pub fn build(self) -> Supervisor {
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        Supervisor {
            parallelism: self.parallelism,
            worker: self.worker,
            root: ProcessHandle::root(),
            pending: HashMap::new(),
            spawned: 0,
            bad_count: 0,
            exiting: false,
            is_daemon: false,
            tick_interval: self.tick_interval,
            max_bad_count: self.max_bad_count,
            max_interrupts: self.max_interrupts,
            external_tx,
            external_rx,
        }
    }
}
