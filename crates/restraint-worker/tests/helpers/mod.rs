#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use restraint_core::models::{
    AcquireMode, Consumer, ConsumerContext, ConsumerState, HoldingScope, ReleaseEntity,
    ResourceRestraint, RestraintStepParameters,
};
use restraint_core::{NotifyChannel, NotifyEvent};
use restraint_db::{ConsumerRegistry, InMemoryConstraintRepository, InMemoryConsumerRegistry};
use restraint_services::{
    AccountingConfig, AdmissionFacilitator, RestraintAccountingService, RestraintStepExecutor,
};
use restraint_worker::{StepDriver, StepDriverConfig, WaitNotifyHub};

pub const CONSTRAINT_ID: &str = "deployments";
pub const UNIT: &str = "cluster-a";

pub struct TestWorker {
    pub registry: Arc<InMemoryConsumerRegistry>,
    pub accounting: Arc<RestraintAccountingService>,
    pub hub: Arc<WaitNotifyHub>,
    pub driver: Arc<StepDriver>,
}

impl TestWorker {
    pub async fn unit_consumers(&self) -> Vec<Consumer> {
        self.registry.load(CONSTRAINT_ID, UNIT).await.unwrap().consumers
    }

    pub async fn seed_consumer(&self, consumer: Consumer) {
        let snapshot = self.registry.load(CONSTRAINT_ID, UNIT).await.unwrap();
        let mut records = snapshot.consumers;
        records.push(consumer);
        assert!(self
            .registry
            .compare_and_swap(CONSTRAINT_ID, UNIT, snapshot.version, records)
            .await
            .unwrap()
            .is_committed());
    }

    /// Poll until `check` holds or two seconds pass.
    pub async fn eventually<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub fn fast_accounting() -> AccountingConfig {
    AccountingConfig {
        max_register_attempts: 50,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

pub fn fast_driver() -> StepDriverConfig {
    StepDriverConfig {
        default_timeout: Duration::from_secs(5),
        max_retries: 2,
        initial_retry_backoff: Duration::from_millis(1),
        max_retry_backoff: Duration::from_millis(5),
        max_release_attempts: 5,
        recheck_interval: Duration::ZERO,
    }
}

/// Forwards await announcements to the hub but never delivers readiness.
pub struct LossyNotifier {
    hub: Arc<WaitNotifyHub>,
}

#[async_trait]
impl NotifyChannel for LossyNotifier {
    async fn publish(&self, event: NotifyEvent) -> anyhow::Result<()> {
        match event {
            NotifyEvent::AwaitToken(_) => self.hub.publish(event).await,
            NotifyEvent::PermitReady(_) => Err(anyhow::anyhow!("notification transport unavailable")),
        }
    }
}

pub async fn setup_worker(capacity: i32, accounting_config: AccountingConfig) -> TestWorker {
    setup_worker_with(capacity, accounting_config, fast_driver(), false).await
}

/// `lossy` drops every permit-ready event on its way to the hub.
pub async fn setup_worker_with(
    capacity: i32,
    accounting_config: AccountingConfig,
    driver_config: StepDriverConfig,
    lossy: bool,
) -> TestWorker {
    let registry = Arc::new(InMemoryConsumerRegistry::new());
    let hub = Arc::new(WaitNotifyHub::new());
    let notifier: Arc<dyn NotifyChannel> = if lossy {
        Arc::new(LossyNotifier { hub: hub.clone() })
    } else {
        hub.clone()
    };

    let accounting = Arc::new(RestraintAccountingService::new(
        Arc::new(InMemoryConstraintRepository::new()),
        registry.clone(),
        notifier,
        accounting_config,
    ));
    accounting
        .create_constraint(ResourceRestraint::new(
            CONSTRAINT_ID,
            "Max concurrent deployments",
            capacity,
        ))
        .await
        .expect("Failed to create test restraint");

    let driver = Arc::new(StepDriver::new(
        AdmissionFacilitator::new(accounting.clone()),
        RestraintStepExecutor::new(accounting.clone()),
        hub.clone(),
        driver_config,
    ));

    TestWorker {
        registry,
        accounting,
        hub,
        driver,
    }
}

pub fn params(plan_execution_id: &str, permits: i32) -> RestraintStepParameters {
    RestraintStepParameters::new(
        CONSTRAINT_ID,
        UNIT,
        permits,
        AcquireMode::Accumulate,
        HoldingScope::Plan {
            plan_execution_id: plan_execution_id.to_string(),
        },
    )
}

pub fn consumer(permits: i32, state: ConsumerState, order: i64) -> Consumer {
    Consumer::new(
        Uuid::new_v4(),
        CONSTRAINT_ID,
        UNIT,
        permits,
        state,
        ConsumerContext::new(&ReleaseEntity::plan(format!("seeded-{order}")), order),
    )
}
