//! Ten workers that loop until the pool tells them to stop.
//!
//! Each worker polls its end count and exits cleanly once an interrupt or
//! terminate request has been seen. Press Ctrl+C once for a graceful drain,
//! three times to force-kill the pool.

use std::time::Duration;

use forkpool::{ProcessHandle, SupervisorBuilder, WorkerResult};

fn worker(process: &mut ProcessHandle) -> WorkerResult {
    loop {
        let ended = process.end_count();
        if ended > 0 {
            println!("[{}] told to end {} times, stopping", process.pid(), ended);
            return Ok(());
        }
        println!("[{}] working...", process.pid());
        std::thread::sleep(Duration::from_millis(500));
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let supervisor = SupervisorBuilder::new(worker).with_parallelism(10).build();

    match supervisor.run().wait().await {
        Ok(()) => println!("pool drained"),
        Err(error) => {
            eprintln!("pool stopped: {error}");
            std::process::exit(1);
        }
    }
}
