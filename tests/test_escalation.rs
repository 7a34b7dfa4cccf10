mod common;

use std::time::Duration;

use forkpool::SupervisorError;

use common::{fast_pool, pool_guard, sleepy_worker};

#[tokio::test]
async fn interrupts_escalate_after_threshold() {
    let _guard = pool_guard();
    let handle = fast_pool(2, sleepy_worker).run();

    // Let the pool reach its target.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.running, 2);

    // Below the threshold: drain latched, nothing killed.
    handle.interrupt().unwrap();
    handle.interrupt().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = handle.status().await.unwrap();
    assert!(status.exiting);
    assert_eq!(status.interrupts, 2);
    assert_eq!(status.running, 2, "no worker may be killed below the threshold");

    // The third interrupt force-kills everything.
    handle.interrupt().unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("escalation timed out")
        .expect_err("escalation must not be a graceful stop");
    match err {
        SupervisorError::InterruptEscalation { count, killed } => {
            assert_eq!(count, 3);
            assert_eq!(killed, 2);
        }
        other => panic!("expected escalation, got {other}"),
    }
}

#[tokio::test]
async fn terminate_and_hangup_are_observed_only() {
    let _guard = pool_guard();
    let handle = fast_pool(1, sleepy_worker).run();
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle.terminate().unwrap();
    handle.hangup().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = handle.status().await.unwrap();
    assert!(!status.exiting, "neither signal may start a drain");
    assert_eq!(status.running, 1);

    // Escalate to stop quickly; the sleepy worker would stall a drain.
    for _ in 0..3 {
        handle.interrupt().unwrap();
    }
    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("escalation timed out");
    assert!(matches!(
        result,
        Err(SupervisorError::InterruptEscalation { .. })
    ));
}
