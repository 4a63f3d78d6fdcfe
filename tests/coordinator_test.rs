//! Integration tests for the coordinator: polling cycles, dispatch,
//! result application, timeout and panic recovery, stop semantics.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conveyor::coordinator::Coordinator;
use conveyor::model::{
    Condition, Create, FailedUpdate, State, SuccessUpdate, Work,
};
use conveyor::processor::{ProcessResult, ProcessingUpdater, Processor};
use conveyor::store::{MemoryStore, Store};
use serde_json::json;

const TYPE_A: &str = "org.example.test.a";
const TYPE_B: &str = "org.example.test.b";

const TICK: Duration = Duration::from_millis(20);

/// Processor returning a fixed result kind for every item.
struct FixedProcessor {
    work_type: String,
    kind: FixedOutcome,
    processed: AtomicUsize,
}

#[derive(Clone, Copy)]
enum FixedOutcome {
    Success,
    Delete,
    Failed,
}

impl FixedProcessor {
    fn new(work_type: &str, kind: FixedOutcome) -> Arc<Self> {
        Arc::new(Self {
            work_type: work_type.to_string(),
            kind,
            processed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Processor for FixedProcessor {
    fn work_type(&self) -> &str {
        &self.work_type
    }

    fn quantity(&self) -> usize {
        2
    }

    fn frequency(&self) -> Duration {
        TICK
    }

    async fn process(&self, _work: Work, _updater: Arc<dyn ProcessingUpdater>) -> ProcessResult {
        self.processed.fetch_add(1, Ordering::SeqCst);
        match self.kind {
            FixedOutcome::Success => ProcessResult::Success(SuccessUpdate::default()),
            FixedOutcome::Delete => ProcessResult::Delete,
            FixedOutcome::Failed => ProcessResult::Failed(FailedUpdate {
                error: "unrecoverable".to_string(),
            }),
        }
    }
}

/// Processor that never returns within its lease.
struct StuckProcessor;

#[async_trait]
impl Processor for StuckProcessor {
    fn work_type(&self) -> &str {
        TYPE_A
    }

    fn quantity(&self) -> usize {
        1
    }

    fn frequency(&self) -> Duration {
        TICK
    }

    async fn process(&self, _work: Work, _updater: Arc<dyn ProcessingUpdater>) -> ProcessResult {
        tokio::time::sleep(Duration::from_secs(30)).await;
        ProcessResult::Success(SuccessUpdate::default())
    }
}

/// Processor that panics on every item.
struct PanickingProcessor;

#[async_trait]
impl Processor for PanickingProcessor {
    fn work_type(&self) -> &str {
        TYPE_A
    }

    fn quantity(&self) -> usize {
        1
    }

    fn frequency(&self) -> Duration {
        TICK
    }

    async fn process(&self, _work: Work, _updater: Arc<dyn ProcessingUpdater>) -> ProcessResult {
        panic!("defective processor");
    }
}

/// Processor that checkpoints metadata before succeeding.
struct CheckpointingProcessor;

#[async_trait]
impl Processor for CheckpointingProcessor {
    fn work_type(&self) -> &str {
        TYPE_A
    }

    fn quantity(&self) -> usize {
        1
    }

    fn frequency(&self) -> Duration {
        TICK
    }

    async fn process(&self, _work: Work, updater: Arc<dyn ProcessingUpdater>) -> ProcessResult {
        let metadata = json!({"checkpoint": "halfway"})
            .as_object()
            .unwrap()
            .clone();
        updater
            .processing_update(metadata)
            .await
            .expect("checkpoint should persist");
        ProcessResult::Success(SuccessUpdate::default())
    }
}

async fn wait_for<F>(mut condition: F)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within deadline");
}

async fn state_of(store: &Arc<MemoryStore>, work: &Work) -> Option<State> {
    store
        .get(&work.id, &Condition::none())
        .await
        .unwrap()
        .map(|w| w.state)
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store);

    coordinator
        .register_processor(FixedProcessor::new(TYPE_A, FixedOutcome::Success))
        .unwrap();
    let second = coordinator.register_processor(FixedProcessor::new(TYPE_A, FixedOutcome::Delete));
    assert!(second.is_err());
}

#[tokio::test]
async fn registration_after_start_begins_polling() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());
    coordinator.start();

    let work = store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    coordinator
        .register_processor(FixedProcessor::new(TYPE_A, FixedOutcome::Success))
        .unwrap();

    wait_for(async || state_of(&store, &work).await == Some(State::Success)).await;
    coordinator.stop();
}

// ---------------------------------------------------------------------------
// Result application
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_and_failed_results_are_applied() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());

    let ok = store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    let bad = store.create(&Create::new(TYPE_B, 30)).await.unwrap();

    coordinator
        .register_processors(vec![
            FixedProcessor::new(TYPE_A, FixedOutcome::Success) as Arc<dyn Processor>,
            FixedProcessor::new(TYPE_B, FixedOutcome::Failed) as Arc<dyn Processor>,
        ])
        .unwrap();
    coordinator.start();

    wait_for(async || state_of(&store, &ok).await == Some(State::Success)).await;
    wait_for(async || state_of(&store, &bad).await == Some(State::Failed)).await;

    let failed = store.get(&bad.id, &Condition::none()).await.unwrap().unwrap();
    assert_eq!(failed.failed_error.as_deref(), Some("unrecoverable"));
    coordinator.stop();
}

#[tokio::test]
async fn delete_result_removes_the_item() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());

    let work = store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    coordinator
        .register_processor(FixedProcessor::new(TYPE_A, FixedOutcome::Delete))
        .unwrap();
    coordinator.start();

    wait_for(async || state_of(&store, &work).await.is_none()).await;
    coordinator.stop();
}

#[tokio::test]
async fn checkpointed_metadata_survives_into_the_result() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());

    let work = store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    coordinator
        .register_processor(Arc::new(CheckpointingProcessor))
        .unwrap();
    coordinator.start();

    wait_for(async || state_of(&store, &work).await == Some(State::Success)).await;

    let done = store.get(&work.id, &Condition::none()).await.unwrap().unwrap();
    assert_eq!(
        done.metadata.as_ref().and_then(|m| m.get("checkpoint")),
        Some(&json!("halfway"))
    );
    // Claim + checkpoint + success
    assert_eq!(done.revision, 3);
    coordinator.stop();
}

// ---------------------------------------------------------------------------
// Timeout and panic recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lease_timeout_synthesizes_transient_failure() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());

    let work = store.create(&Create::new(TYPE_A, 1)).await.unwrap();
    coordinator.register_processor(Arc::new(StuckProcessor)).unwrap();
    coordinator.start();

    wait_for(async || state_of(&store, &work).await == Some(State::Failing)).await;

    let failing = store.get(&work.id, &Condition::none()).await.unwrap().unwrap();
    assert!(
        failing.failing_error.as_deref().unwrap_or("").contains("timed out"),
        "unexpected error: {:?}",
        failing.failing_error
    );
    assert_eq!(failing.failing_retry_count, Some(1));
    // Backed off — not retried before the retry time elapses
    assert!(failing.failing_retry_time.unwrap() > chrono::Utc::now());
    coordinator.stop();
}

#[tokio::test]
async fn processor_panic_is_recovered_as_transient_failure() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());

    let doomed = store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    let fine = store.create(&Create::new(TYPE_B, 30)).await.unwrap();

    coordinator.register_processor(Arc::new(PanickingProcessor)).unwrap();
    coordinator
        .register_processor(FixedProcessor::new(TYPE_B, FixedOutcome::Success))
        .unwrap();
    coordinator.start();

    wait_for(async || state_of(&store, &doomed).await == Some(State::Failing)).await;
    // One processor's defect does not take down the other type's loop
    wait_for(async || state_of(&store, &fine).await == Some(State::Success)).await;

    let failing = store.get(&doomed.id, &Condition::none()).await.unwrap().unwrap();
    assert!(
        failing.failing_error.as_deref().unwrap_or("").contains("panicked"),
        "unexpected error: {:?}",
        failing.failing_error
    );
    coordinator.stop();
}

// ---------------------------------------------------------------------------
// Stop semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_ceases_polling() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());

    let processor = FixedProcessor::new(TYPE_A, FixedOutcome::Success);
    coordinator.register_processor(processor.clone()).unwrap();
    coordinator.start();
    coordinator.stop();

    let work = store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    tokio::time::sleep(TICK * 10).await;

    assert_eq!(state_of(&store, &work).await, Some(State::Pending));
    assert_eq!(processor.processed.load(Ordering::SeqCst), 0);
}
