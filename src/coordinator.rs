//! Coordinator: drives one polling/dispatch cycle per registered work
//! type, enforces per-type in-flight limits, applies processor results,
//! and recovers leases from timeouts and panics.
//!
//! The store is the sole serialization point — every claim and every
//! result lands as an atomic store call, so multiple coordinator
//! instances can safely share one store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use opentelemetry::KeyValue;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    Condition, FailingUpdate, Metadata, Poll, ProcessingUpdate, TypeQuantities, Update, Work,
    WorkId, validate_work_type,
};
use crate::processor::{ProcessResult, ProcessingUpdater, Processor};
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// One registered processor and its in-flight accounting.
#[derive(Clone)]
struct Registration {
    processor: Arc<dyn Processor>,
    in_flight: Arc<AtomicUsize>,
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    /// Explicit registry, populated through registration calls only.
    registry: Mutex<HashMap<String, Registration>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            registry: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Register a processor for its work type.
    ///
    /// Fails if the type is malformed, the quantity or frequency is zero,
    /// or a processor for the type is already registered. When the
    /// coordinator is already running the new type's polling cycle starts
    /// immediately, so processors may register siblings mid-flight.
    pub fn register_processor(&self, processor: Arc<dyn Processor>) -> Result<()> {
        let work_type = processor.work_type().to_string();

        let mut issues = crate::error::Issues::new();
        validate_work_type("type", &work_type, &mut issues);
        if processor.quantity() == 0 {
            issues.push("quantity", "must be greater than zero");
        }
        if processor.frequency().is_zero() {
            issues.push("frequency", "must be greater than zero");
        }
        issues.into_result()?;

        let registration = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if registry.contains_key(&work_type) {
                return Err(Error::Other(format!(
                    "processor already registered for type {work_type}"
                )));
            }
            let registration = Registration {
                processor,
                in_flight: Arc::new(AtomicUsize::new(0)),
            };
            registry.insert(work_type.clone(), registration.clone());
            registration
        };

        if self.started.load(Ordering::SeqCst) {
            self.spawn_cycle(registration);
        }
        Ok(())
    }

    pub fn register_processors(&self, processors: Vec<Arc<dyn Processor>>) -> Result<()> {
        for processor in processors {
            self.register_processor(processor)?;
        }
        Ok(())
    }

    /// Begin an independent polling cycle for each registered type.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let registrations: Vec<Registration> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.values().cloned().collect()
        };
        for registration in registrations {
            self.spawn_cycle(registration);
        }
        info!("coordinator started");
    }

    /// Stop issuing new polls. In-flight work finishes or hits its
    /// timeout — never forcibly killed.
    pub fn stop(&self) {
        self.cancel.cancel();
        info!("coordinator stopped");
    }

    fn spawn_cycle(&self, registration: Registration) {
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        tokio::spawn(run_cycle(store, registration, cancel));
    }
}

/// One polling cycle: tick at the processor's frequency, poll for as much
/// capacity as remains, dispatch each claimed item.
async fn run_cycle(store: Arc<dyn Store>, registration: Registration, cancel: CancellationToken) {
    let processor = Arc::clone(&registration.processor);
    let work_type = processor.work_type().to_string();
    let frequency = processor.frequency();
    info!(%work_type, "polling cycle started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(%work_type, "polling cycle stopped");
                return;
            }
            _ = tokio::time::sleep(frequency) => {}
        }

        let capacity = processor
            .quantity()
            .saturating_sub(registration.in_flight.load(Ordering::Relaxed));
        if capacity == 0 {
            continue;
        }

        let poll = Poll::new(TypeQuantities::new().with(&work_type, capacity));
        let claimed = match store.poll(&poll).await {
            Ok(claimed) => claimed,
            Err(e) => {
                // No work this cycle; retry at the next frequency tick.
                warn!(%work_type, "poll failed: {e}");
                continue;
            }
        };

        for work in claimed {
            metrics::work_claimed().add(1, &[KeyValue::new("work_type", work_type.clone())]);
            dispatch(Arc::clone(&store), registration.clone(), work);
        }
    }
}

/// Run one claimed item as its own task, bounded by its lease.
fn dispatch(store: Arc<dyn Store>, registration: Registration, work: Work) {
    registration.in_flight.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        let span = start_work_span(&work.work_type, &work.id);
        execute(store, Arc::clone(&registration.processor), work)
            .instrument(span)
            .await;
        registration.in_flight.fetch_sub(1, Ordering::Relaxed);
    });
}

async fn execute(store: Arc<dyn Store>, processor: Arc<dyn Processor>, work: Work) {
    let updater = Arc::new(StoreProcessingUpdater {
        store: Arc::clone(&store),
        id: work.id.clone(),
        revision: AsyncMutex::new(work.revision),
    });

    // Lease budget: the processor must return before the timeout time the
    // store stamped at claim.
    let now = chrono::Utc::now();
    let budget = work
        .processing_timeout_time
        .map(|expiry| (expiry - now).to_std().unwrap_or(std::time::Duration::ZERO))
        .unwrap_or(std::time::Duration::ZERO);

    let handle = tokio::spawn({
        let processor = Arc::clone(&processor);
        let updater: Arc<dyn ProcessingUpdater> = updater.clone();
        let work = work.clone();
        async move { processor.process(work, updater).await }
    });
    let abort = handle.abort_handle();

    let result = match tokio::time::timeout(budget, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            // Processor panicked; one defect must not take down the loop.
            error!(id = %work.id, "processor panicked: {join_error}");
            ProcessResult::Failing(FailingUpdate::backoff(
                format!("processor panicked: {join_error}"),
                next_retry_count(&work),
            ))
        }
        Err(_) => {
            abort.abort();
            warn!(
                id = %work.id,
                timeout = work.processing_timeout,
                "processing timed out, recording transient failure"
            );
            metrics::work_timeouts().add(
                1,
                &[KeyValue::new("work_type", work.work_type.clone())],
            );
            ProcessResult::Failing(FailingUpdate::backoff(
                format!(
                    "processing timed out after {} seconds",
                    work.processing_timeout
                ),
                next_retry_count(&work),
            ))
        }
    };

    apply_result(store, &updater, &work, result).await;
}

/// Apply a process result back to the store. A claimed item always ends
/// in a store update, a deletion, or — should the apply itself fail —
/// reclaim by lease expiry at a later poll.
async fn apply_result(
    store: Arc<dyn Store>,
    updater: &StoreProcessingUpdater,
    work: &Work,
    result: ProcessResult,
) {
    let condition = Condition::revision(updater.current_revision().await);
    let started = work.processing_time;

    let applied = match result {
        ProcessResult::Success(update) => store
            .update(&work.id, &condition, &Update::success(update))
            .await
            .map(|_| "success"),
        ProcessResult::Delete => store
            .delete(&work.id, &condition)
            .await
            .map(|_| "delete"),
        ProcessResult::Failed(update) => store
            .update(&work.id, &condition, &Update::failed(update))
            .await
            .map(|_| "failed"),
        ProcessResult::Failing(update) => store
            .update(&work.id, &condition, &Update::failing(update))
            .await
            .map(|_| "failing"),
        ProcessResult::Pending(update) => store
            .update(&work.id, &condition, &Update::pending(update))
            .await
            .map(|_| "pending"),
    };

    match applied {
        Ok(outcome) => {
            record_state_transition("processing", outcome);
            info!(id = %work.id, outcome, "work item processed");
            metrics::work_processed().add(
                1,
                &[
                    KeyValue::new("work_type", work.work_type.clone()),
                    KeyValue::new("result", outcome),
                ],
            );
            if let Some(started) = started {
                let elapsed = (chrono::Utc::now() - started).num_milliseconds() as f64;
                metrics::processing_duration_ms().record(
                    elapsed,
                    &[KeyValue::new("work_type", work.work_type.clone())],
                );
            }
        }
        Err(e) => {
            // Not dropped: the lease expires and a later poll reclaims it.
            error!(id = %work.id, "failed to apply process result: {e}");
        }
    }
}

fn next_retry_count(work: &Work) -> u32 {
    work.failing_retry_count.unwrap_or(0) + 1
}

/// Store-backed checkpoint handle. Tracks the item's revision so each
/// checkpoint, and the final result, updates against the latest state.
struct StoreProcessingUpdater {
    store: Arc<dyn Store>,
    id: WorkId,
    revision: AsyncMutex<i64>,
}

impl StoreProcessingUpdater {
    async fn current_revision(&self) -> i64 {
        *self.revision.lock().await
    }
}

#[async_trait::async_trait]
impl ProcessingUpdater for StoreProcessingUpdater {
    async fn processing_update(&self, metadata: Metadata) -> Result<Work> {
        let mut revision = self.revision.lock().await;
        let update = Update::processing(ProcessingUpdate {
            metadata: Some(metadata),
        });
        let work = self
            .store
            .update(&self.id, &Condition::revision(*revision), &update)
            .await?;
        *revision = work.revision;
        Ok(work)
    }
}
