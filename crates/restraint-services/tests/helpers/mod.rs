//! Test helpers: in-memory registry, restraint repository and a captured
//! notification stream.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use restraint_core::models::{
    AcquireMode, Consumer, ConsumerContext, ConsumerState, HoldingScope, ReleaseEntity,
    ResourceRestraint, RestraintStepParameters,
};
use restraint_core::{MpscNotifyChannel, NotifyChannel, NotifyEvent};
use restraint_db::{ConsumerRegistry, InMemoryConstraintRepository, InMemoryConsumerRegistry};
use restraint_services::{
    AccountingConfig, AdmissionFacilitator, RestraintAccountingService, RestraintStepExecutor,
};

pub const CONSTRAINT_ID: &str = "deployments";
pub const UNIT: &str = "cluster-a";

pub struct TestApp {
    pub registry: Arc<InMemoryConsumerRegistry>,
    pub accounting: Arc<RestraintAccountingService>,
    pub facilitator: AdmissionFacilitator,
    pub executor: RestraintStepExecutor,
    pub events: mpsc::Receiver<NotifyEvent>,
}

impl TestApp {
    /// Events published since the last call.
    pub fn drain_events(&mut self) -> Vec<NotifyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn unit_consumers(&self) -> Vec<Consumer> {
        self.registry.load(CONSTRAINT_ID, UNIT).await.unwrap().consumers
    }

    pub async fn consumer(&self, consumer_id: Uuid) -> Option<Consumer> {
        self.registry.find_consumer(consumer_id).await.unwrap()
    }

    /// Write a consumer straight into the ledger, bypassing admission.
    pub async fn seed_consumer(&self, consumer: Consumer) {
        let snapshot = self
            .registry
            .load(&consumer.constraint_id, &consumer.resource_unit)
            .await
            .unwrap();
        let mut records = snapshot.consumers;
        let (constraint_id, unit) = (consumer.constraint_id.clone(), consumer.resource_unit.clone());
        records.push(consumer);
        let outcome = self
            .registry
            .compare_and_swap(&constraint_id, &unit, snapshot.version, records)
            .await
            .unwrap();
        assert!(outcome.is_committed());
    }
}

pub fn fast_config() -> AccountingConfig {
    AccountingConfig {
        max_register_attempts: 5,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

pub async fn setup_test_app(capacity: i32) -> TestApp {
    setup_test_app_with_config(capacity, fast_config()).await
}

/// Fails the first `failures` permit-ready publishes, then forwards everything.
pub struct FlakyNotifier {
    inner: MpscNotifyChannel,
    remaining_failures: AtomicU32,
}

#[async_trait]
impl NotifyChannel for FlakyNotifier {
    async fn publish(&self, event: NotifyEvent) -> anyhow::Result<()> {
        let fail = matches!(event, NotifyEvent::PermitReady(_))
            && self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(anyhow::anyhow!("notification transport unavailable"));
        }
        self.inner.publish(event).await
    }
}

pub async fn setup_test_app_with_config(capacity: i32, config: AccountingConfig) -> TestApp {
    setup_test_app_with_flaky_notifier(capacity, config, 0).await
}

/// Like [`setup_test_app_with_config`], but the first `failures` permit-ready
/// publishes fail.
pub async fn setup_test_app_with_flaky_notifier(
    capacity: i32,
    config: AccountingConfig,
    failures: u32,
) -> TestApp {
    let registry = Arc::new(InMemoryConsumerRegistry::new());
    let constraints = Arc::new(InMemoryConstraintRepository::new());
    let (channel, events) = MpscNotifyChannel::channel(1024);
    let notifier = FlakyNotifier {
        inner: channel,
        remaining_failures: AtomicU32::new(failures),
    };

    let accounting = Arc::new(RestraintAccountingService::new(
        constraints,
        registry.clone(),
        Arc::new(notifier),
        config,
    ));
    accounting
        .create_constraint(ResourceRestraint::new(
            CONSTRAINT_ID,
            "Max concurrent deployments",
            capacity,
        ))
        .await
        .expect("Failed to create test restraint");

    TestApp {
        registry,
        facilitator: AdmissionFacilitator::new(accounting.clone()),
        executor: RestraintStepExecutor::new(accounting.clone()),
        accounting,
        events,
    }
}

pub fn plan_params(plan_execution_id: &str, permits: i32, mode: AcquireMode) -> RestraintStepParameters {
    RestraintStepParameters::new(
        CONSTRAINT_ID,
        UNIT,
        permits,
        mode,
        HoldingScope::Plan {
            plan_execution_id: plan_execution_id.to_string(),
        },
    )
}

pub fn stage_params(plan_execution_id: &str, node_id: &str, permits: i32) -> RestraintStepParameters {
    RestraintStepParameters::new(
        CONSTRAINT_ID,
        UNIT,
        permits,
        AcquireMode::Accumulate,
        HoldingScope::Stage {
            plan_execution_id: plan_execution_id.to_string(),
            node_id: node_id.to_string(),
        },
    )
}

pub fn blocked_consumer(permits: i32, order: i64, owner: &str) -> Consumer {
    Consumer::new(
        Uuid::new_v4(),
        CONSTRAINT_ID,
        UNIT,
        permits,
        ConsumerState::Blocked,
        ConsumerContext::new(&ReleaseEntity::plan(owner), order),
    )
}

pub fn active_permits(consumers: &[Consumer]) -> i64 {
    consumers
        .iter()
        .filter(|c| c.is_active())
        .map(|c| i64::from(c.permits))
        .sum()
}
