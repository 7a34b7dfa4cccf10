mod common;

use std::time::Duration;

use forkpool::SupervisorBuilder;

use common::{clean_worker, failing_worker, fast_pool, pool_guard};

#[tokio::test]
async fn pool_respawns_clean_workers() {
    let _guard = pool_guard();
    let handle = fast_pool(3, clean_worker).run();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = handle.status().await.unwrap();
    assert!(
        status.spawned >= 4,
        "expected the pool to reap and respawn, spawned only {}",
        status.spawned
    );
    assert_eq!(status.bad_count, 0);
    assert!(!status.exiting);

    handle.shutdown().unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("drain timed out")
        .expect("drain should end gracefully");
}

#[tokio::test]
async fn abnormal_exits_exhaust_the_budget_and_drain() {
    let _guard = pool_guard();
    let supervisor = SupervisorBuilder::new(failing_worker)
        .with_parallelism(1)
        .with_tick_interval(Duration::from_millis(20))
        .with_max_bad_count(1)
        .build();
    let handle = supervisor.run();

    // The worker dies with status 1, the budget is exhausted and the pool
    // drains by itself with a graceful result.
    let result = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("pool did not drain on its own");
    assert!(result.is_ok(), "expected a graceful drain, got {result:?}");
}

#[tokio::test]
async fn failing_workers_keep_respawning_while_budget_holds() {
    let _guard = pool_guard();
    // A fast-dying worker resets the budget on every successful respawn, so
    // a generous budget is never exhausted and the pool keeps churning.
    let supervisor = SupervisorBuilder::new(failing_worker)
        .with_parallelism(1)
        .with_tick_interval(Duration::from_millis(20))
        .with_max_bad_count(50)
        .build();
    let handle = supervisor.run();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = handle.status().await.unwrap();
    assert!(!status.exiting);
    assert!(
        status.spawned >= 3,
        "expected continued respawns, spawned only {}",
        status.spawned
    );

    handle.shutdown().unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("drain timed out")
        .expect("drain should end gracefully");
}
