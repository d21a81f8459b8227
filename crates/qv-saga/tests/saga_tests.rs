//! Saga orchestration tests: the order workflow with compensation on a
//! late failure, optimistic-concurrency retries, correlation fallback,
//! and stale-instance queries.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qv_common::{Event, Message, MessageHeader, QuiverError};
use qv_saga::{
    CompensationFn, InMemorySagaRepository, Saga, SagaOrchestrator, SagaOutcome, SagaRepository,
    StateContext, StateMachineDefinition, Transition, TransitionAction,
};

macro_rules! impl_event {
    ($ty:ident) => {
        impl Message for $ty {
            fn header(&self) -> &MessageHeader {
                &self.header
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
        impl Event for $ty {}
    };
}

struct OrderPlaced {
    header: MessageHeader,
}
impl_event!(OrderPlaced);

struct PaymentProcessed {
    header: MessageHeader,
}
impl_event!(PaymentProcessed);

struct InventoryReservationFailed {
    header: MessageHeader,
}
impl_event!(InventoryReservationFailed);

struct InventoryReserved {
    header: MessageHeader,
}
impl_event!(InventoryReserved);

fn correlated<F: FnOnce(MessageHeader) -> T, T>(correlation: &str, build: F) -> Arc<T> {
    Arc::new(build(MessageHeader::with_correlation(correlation)))
}

#[derive(Debug, Default, Clone)]
struct OrderData {
    payment_captured: bool,
}

/// Runs the whole compensation stack; used by failure transitions.
struct CompensateAll;

#[async_trait]
impl TransitionAction<OrderData> for CompensateAll {
    async fn run(&self, ctx: &mut StateContext<'_, OrderData>) -> qv_common::Result<()> {
        ctx.compensation.compensate(false).await
    }
}

fn refund_compensation(refunds: &Arc<AtomicU32>) -> CompensationFn {
    let refunds = refunds.clone();
    Arc::new(move || {
        let refunds = refunds.clone();
        Box::pin(async move {
            refunds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
}

fn order_machine(refunds: Arc<AtomicU32>) -> Arc<StateMachineDefinition<OrderData>> {
    StateMachineDefinition::builder("Placed")
        .transition(
            "Placed",
            Transition::on::<OrderPlaced>().to("AwaitingPayment"),
        )
        .transition(
            "AwaitingPayment",
            Transition::on::<PaymentProcessed>()
                .to("AwaitingInventory")
                .with_sync_action(move |ctx: &mut StateContext<'_, OrderData>| {
                    ctx.saga.data.payment_captured = true;
                    ctx.compensation
                        .add("RefundPayment", refund_compensation(&refunds));
                    Ok(())
                }),
        )
        .transition(
            "AwaitingInventory",
            Transition::on::<InventoryReserved>().to("Completed").finalize(),
        )
        .transition(
            "AwaitingInventory",
            Transition::on::<InventoryReservationFailed>()
                .to("Failed")
                .finalize()
                .with_action(CompensateAll),
        )
        .build()
}

#[tokio::test]
async fn compensation_runs_once_on_late_failure() {
    let refunds = Arc::new(AtomicU32::new(0));
    let repository = Arc::new(InMemorySagaRepository::<OrderData>::new());
    let orchestrator = SagaOrchestrator::new(order_machine(refunds.clone()), repository.clone());

    let outcome = orchestrator
        .handle_event(correlated("order-17", |header| OrderPlaced { header }))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SagaOutcome::Applied {
            state: "AwaitingPayment".into(),
            completed: false
        }
    );

    orchestrator
        .handle_event(correlated("order-17", |header| PaymentProcessed { header }))
        .await
        .unwrap();

    let outcome = orchestrator
        .handle_event(correlated("order-17", |header| InventoryReservationFailed {
            header,
        }))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SagaOutcome::Applied {
            state: "Failed".into(),
            completed: true
        }
    );

    assert_eq!(refunds.load(Ordering::SeqCst), 1);

    let saga = repository.find("order-17").await.unwrap().unwrap();
    assert_eq!(saga.current_state, "Failed");
    assert!(saga.is_completed);
    assert!(saga.data.payment_captured);
    // save, then two updates
    assert_eq!(saga.version, 3);
    assert_eq!(orchestrator.metrics().completed, 1);
}

#[tokio::test]
async fn happy_path_never_compensates() {
    let refunds = Arc::new(AtomicU32::new(0));
    let repository = Arc::new(InMemorySagaRepository::<OrderData>::new());
    let orchestrator = SagaOrchestrator::new(order_machine(refunds.clone()), repository.clone());

    for outcome in [
        orchestrator
            .handle_event(correlated("order-1", |header| OrderPlaced { header }))
            .await
            .unwrap(),
        orchestrator
            .handle_event(correlated("order-1", |header| PaymentProcessed { header }))
            .await
            .unwrap(),
        orchestrator
            .handle_event(correlated("order-1", |header| InventoryReserved { header }))
            .await
            .unwrap(),
    ] {
        assert!(matches!(outcome, SagaOutcome::Applied { .. }));
    }

    assert_eq!(refunds.load(Ordering::SeqCst), 0);
    let saga = repository.find("order-1").await.unwrap().unwrap();
    assert_eq!(saga.current_state, "Completed");
    assert!(saga.is_completed);
}

#[tokio::test]
async fn events_are_ignored_without_correlation_or_transition() {
    let refunds = Arc::new(AtomicU32::new(0));
    let repository = Arc::new(InMemorySagaRepository::<OrderData>::new());
    let orchestrator = SagaOrchestrator::new(order_machine(refunds), repository.clone());

    // No correlation id at all
    let outcome = orchestrator
        .handle_event(Arc::new(OrderPlaced {
            header: MessageHeader::new(),
        }))
        .await
        .unwrap();
    assert_eq!(outcome, SagaOutcome::IgnoredMissingCorrelation);

    // Wrong event for the initial state: a fresh instance in "Placed" has
    // no transition for PaymentProcessed
    let outcome = orchestrator
        .handle_event(correlated("order-2", |header| PaymentProcessed { header }))
        .await
        .unwrap();
    assert_eq!(outcome, SagaOutcome::IgnoredNoTransition);
    assert!(repository.find("order-2").await.unwrap().is_none());
}

#[tokio::test]
async fn correlation_extractor_is_the_fallback() {
    struct LabeledEvent {
        header: MessageHeader,
        order_ref: String,
    }
    impl Message for LabeledEvent {
        fn header(&self) -> &MessageHeader {
            &self.header
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }
    impl Event for LabeledEvent {}

    let machine = StateMachineDefinition::<OrderData>::builder("Placed")
        .transition("Placed", Transition::on::<LabeledEvent>().to("Tagged"))
        .build();
    let repository = Arc::new(InMemorySagaRepository::<OrderData>::new());
    let orchestrator = SagaOrchestrator::new(machine, repository.clone())
        .with_correlation_extractor(Arc::new(|message| {
            message
                .as_any()
                .downcast_ref::<LabeledEvent>()
                .map(|event| event.order_ref.clone())
        }));

    let outcome = orchestrator
        .handle_event(Arc::new(LabeledEvent {
            header: MessageHeader::new(),
            order_ref: "order-77".into(),
        }))
        .await
        .unwrap();

    assert!(matches!(outcome, SagaOutcome::Applied { .. }));
    assert!(repository.find("order-77").await.unwrap().is_some());
}

#[tokio::test]
async fn stale_update_fails_without_visible_mutation() {
    let repository = InMemorySagaRepository::<OrderData>::new();
    let saga = repository
        .save(Saga::new("order-9", "Placed"))
        .await
        .unwrap();
    assert_eq!(saga.version, 1);

    let mut fresh = saga.clone();
    fresh.current_state = "AwaitingPayment".into();
    let updated = repository.update(fresh).await.unwrap();
    assert_eq!(updated.version, 2);

    // A writer still holding version 1 must conflict
    let mut stale = saga;
    stale.current_state = "Hijacked".into();
    let error = repository.update(stale).await.unwrap_err();
    assert!(matches!(
        error,
        QuiverError::SagaConcurrency {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    let stored = repository.find("order-9").await.unwrap().unwrap();
    assert_eq!(stored.current_state, "AwaitingPayment");
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn version_conflict_retries_the_whole_dispatch() {
    #[derive(Debug, Default, Clone)]
    struct Data;

    /// Simulates a concurrent writer racing the first dispatch attempt.
    struct ConflictInjector {
        repository: Arc<InMemorySagaRepository<Data>>,
        injected: AtomicBool,
    }

    #[async_trait]
    impl TransitionAction<Data> for ConflictInjector {
        async fn run(&self, ctx: &mut StateContext<'_, Data>) -> qv_common::Result<()> {
            if !self.injected.swap(true, Ordering::SeqCst) {
                let racing = self
                    .repository
                    .find(&ctx.saga.correlation_id)
                    .await?
                    .expect("saga exists");
                self.repository.update(racing).await?;
            }
            Ok(())
        }
    }

    let repository = Arc::new(InMemorySagaRepository::<Data>::new());
    repository.save(Saga::new("order-42", "Open")).await.unwrap();

    let machine = StateMachineDefinition::<Data>::builder("Open")
        .transition(
            "Open",
            Transition::on::<OrderPlaced>()
                .to("Advanced")
                .with_action(ConflictInjector {
                    repository: repository.clone(),
                    injected: AtomicBool::new(false),
                }),
        )
        .build();

    let orchestrator = SagaOrchestrator::new(machine, repository.clone());
    let outcome = orchestrator
        .handle_event(correlated("order-42", |header| OrderPlaced { header }))
        .await
        .unwrap();

    assert!(matches!(outcome, SagaOutcome::Applied { .. }));
    assert_eq!(orchestrator.metrics().conflicts, 1);
    let stored = repository.find("order-42").await.unwrap().unwrap();
    assert_eq!(stored.current_state, "Advanced");
}

#[tokio::test]
async fn find_stale_skips_completed_instances() {
    let repository = InMemorySagaRepository::<OrderData>::new();
    repository
        .save(Saga::new("open-order", "Placed"))
        .await
        .unwrap();
    let mut done = Saga::new("done-order", "Completed");
    done.is_completed = true;
    repository.save(done).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    let stale = repository.find_stale(Duration::from_millis(1)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].correlation_id, "open-order");

    // Nothing is an hour old
    assert!(repository
        .find_stale(Duration::from_secs(3600))
        .await
        .unwrap()
        .is_empty());
}
