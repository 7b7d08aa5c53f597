mod helpers;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use helpers::*;
use uuid::Uuid;

use restraint_core::models::{ConsumerState, FacilitationMode, ReleaseEntity, StepState};
use restraint_core::RestraintError;
use restraint_services::AccountingConfig;
use restraint_worker::{ReleaseFailed, StepDriverConfig, StepTimedOut};

#[tokio::test]
async fn test_free_permit_runs_inline() {
    let worker = setup_worker(1, fast_accounting()).await;
    let run = worker.driver.run(params("exec-1", 1)).await.unwrap();

    assert_eq!(run.facilitation, FacilitationMode::Sync);
    assert_eq!(run.final_state, StepState::CompletedSync);
    assert_eq!(run.attempts, 1);
    assert_eq!(run.outcome.permits_used, 1);
    assert_eq!(worker.hub.pending().await, 0);
}

#[tokio::test]
async fn test_suspended_step_resumes_when_holder_finishes() {
    let worker = setup_worker(1, fast_accounting()).await;
    let holder = Uuid::new_v4();
    worker
        .accounting
        .register_consumer(CONSTRAINT_ID, UNIT, holder, 1, &ReleaseEntity::plan("holder"))
        .await
        .unwrap();

    let driver = worker.driver.clone();
    let handle = tokio::spawn(async move { driver.run(params("exec-1", 1)).await });

    let registry = worker.registry.clone();
    assert!(
        worker
            .eventually(|| {
                let registry = registry.clone();
                async move {
                    registry
                        .all_consumers()
                        .await
                        .iter()
                        .any(|c| c.state == ConsumerState::Blocked)
                }
            })
            .await,
        "step never registered a blocked consumer"
    );

    worker.accounting.finish_instance(holder, UNIT).await.unwrap();

    let run = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("driver did not resume")
        .unwrap()
        .unwrap();
    assert_eq!(run.facilitation, FacilitationMode::Async);
    assert_eq!(run.final_state, StepState::CompletedAsync);
    assert_eq!(worker.hub.pending().await, 0);
}

#[tokio::test]
async fn test_timeout_releases_the_consumer() {
    let worker = setup_worker(1, fast_accounting()).await;
    let holder = Uuid::new_v4();
    worker
        .accounting
        .register_consumer(CONSTRAINT_ID, UNIT, holder, 1, &ReleaseEntity::plan("holder"))
        .await
        .unwrap();

    let err = worker
        .driver
        .run(params("exec-1", 1).with_timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();

    assert!(!err.is_recoverable());
    assert!(err.inner().downcast_ref::<StepTimedOut>().is_some());

    let consumers = worker.unit_consumers().await;
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].id, holder);
    assert_eq!(worker.hub.pending().await, 0);
}

#[tokio::test]
async fn test_contention_is_retried_by_the_driver() {
    let config = AccountingConfig {
        max_register_attempts: 2,
        ..fast_accounting()
    };
    let worker = setup_worker(1, config).await;
    worker.registry.inject_conflicts(2).await;

    let run = worker.driver.run(params("exec-1", 1)).await.unwrap();
    assert_eq!(run.attempts, 2);
    assert_eq!(run.final_state, StepState::CompletedSync);
    assert_eq!(worker.unit_consumers().await.len(), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let worker = setup_worker(1, fast_accounting()).await;
    let err = worker.driver.run(params("exec-1", 2)).await.unwrap_err();

    assert!(!err.is_recoverable());
    assert!(matches!(
        err.restraint_error(),
        Some(RestraintError::InvalidPermits { .. })
    ));
    assert!(worker.unit_consumers().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_steps_share_capacity_fairly() {
    let worker = Arc::new(setup_worker(2, fast_accounting()).await);

    let handles = (0..8).map(|i| {
        let worker = worker.clone();
        tokio::spawn(async move {
            let run = worker
                .driver
                .run(params(&format!("exec-{i}"), 1))
                .await
                .unwrap();

            let active: i64 = worker
                .unit_consumers()
                .await
                .iter()
                .filter(|c| c.is_active())
                .map(|c| i64::from(c.permits))
                .sum();
            assert!(active <= 2);

            tokio::time::sleep(Duration::from_millis(10)).await;
            worker
                .accounting
                .finish_instance(run.consumer_id, UNIT)
                .await
                .unwrap();
            run
        })
    });

    let runs: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(runs.len(), 8);
    assert!(runs
        .iter()
        .any(|run| run.final_state == StepState::CompletedAsync));
    assert!(worker.unit_consumers().await.is_empty());
    assert_eq!(worker.hub.pending().await, 0);
}

async fn wait_until_blocked(worker: &TestWorker) {
    let registry = worker.registry.clone();
    assert!(
        worker
            .eventually(|| {
                let registry = registry.clone();
                async move {
                    registry
                        .all_consumers()
                        .await
                        .iter()
                        .any(|c| c.state == ConsumerState::Blocked)
                }
            })
            .await,
        "step never registered a blocked consumer"
    );
}

async fn hold_unit(worker: &TestWorker) -> Uuid {
    let holder = Uuid::new_v4();
    worker
        .accounting
        .register_consumer(CONSTRAINT_ID, UNIT, holder, 1, &ReleaseEntity::plan("holder"))
        .await
        .unwrap();
    holder
}

#[tokio::test]
async fn test_timeout_release_survives_contended_ledger() {
    let config = AccountingConfig {
        max_register_attempts: 3,
        ..fast_accounting()
    };
    let worker = setup_worker(1, config).await;
    let holder = hold_unit(&worker).await;

    let driver = worker.driver.clone();
    let handle = tokio::spawn(async move {
        driver
            .run(params("exec-1", 1).with_timeout(Duration::from_secs(1)))
            .await
    });
    wait_until_blocked(&worker).await;

    // Every write of the first finish attempt conflicts.
    worker.registry.inject_conflicts(3).await;

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.inner().downcast_ref::<StepTimedOut>().is_some());

    let consumers = worker.unit_consumers().await;
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].id, holder);
    assert_eq!(worker.hub.pending().await, 0);
}

#[tokio::test]
async fn test_unreleasable_consumer_is_reported() {
    let config = AccountingConfig {
        max_register_attempts: 2,
        ..fast_accounting()
    };
    let worker = setup_worker(1, config).await;
    hold_unit(&worker).await;

    let driver = worker.driver.clone();
    let handle = tokio::spawn(async move {
        driver
            .run(params("exec-1", 1).with_timeout(Duration::from_secs(1)))
            .await
    });
    wait_until_blocked(&worker).await;
    worker.registry.inject_conflicts(1_000).await;

    let err = handle.await.unwrap().unwrap_err();
    assert!(!err.is_recoverable());
    let leaked = err
        .inner()
        .downcast_ref::<ReleaseFailed>()
        .expect("release failure should be reported");
    assert_eq!(leaked.attempts, fast_driver().max_release_attempts);
    assert!(leaked.step_error.contains("timed out"));

    // The consumer is still there and can be cleaned up through its owner.
    assert!(worker
        .accounting
        .find_consumer(leaked.consumer_id)
        .await
        .unwrap()
        .is_some());
    worker.registry.inject_conflicts(0).await;
    let finished = worker
        .accounting
        .finish_release_entity(&ReleaseEntity::plan("exec-1"))
        .await
        .unwrap();
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn test_lost_wake_up_is_recovered_by_recheck() {
    let driver_config = StepDriverConfig {
        recheck_interval: Duration::from_millis(50),
        ..fast_driver()
    };
    let worker = setup_worker_with(1, fast_accounting(), driver_config, true).await;
    let holder = hold_unit(&worker).await;

    let driver = worker.driver.clone();
    let handle = tokio::spawn(async move { driver.run(params("exec-1", 1)).await });
    wait_until_blocked(&worker).await;

    // The permit-ready event for the promoted step is never delivered.
    worker.accounting.finish_instance(holder, UNIT).await.unwrap();

    let run = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("driver did not notice its promotion")
        .unwrap()
        .unwrap();
    assert_eq!(run.final_state, StepState::CompletedAsync);
    assert_eq!(run.attempts, 1);
    assert_eq!(worker.hub.pending().await, 0);
}
