//! Client: thin façade over the store exposing job lifecycle operations
//! to producers. Holds no mutable state beyond the store reference, so it
//! is safe to share and call concurrently.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::info;

use crate::error::{Error, Issues, Result};
use crate::model::{Condition, Create, Process, ProcessingUpdate, Repeat, Update, Work, WorkId};
use crate::store::Store;
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Store>,
}

impl Client {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The underlying store, for read paths the client does not wrap.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create a new pending work item. Fails on a malformed payload or a
    /// deduplication id collision.
    pub async fn create(&self, create: &Create) -> Result<Work> {
        create.validate()?;
        let work = self.store.create(create).await?;
        info!(id = %work.id, work_type = %work.work_type, "work item created");
        metrics::work_created().add(
            1,
            &[KeyValue::new("work_type", work.work_type.clone())],
        );
        Ok(work)
    }

    /// Ok(None) when the id is absent.
    pub async fn get(&self, id: &WorkId) -> Result<Option<Work>> {
        self.store.get(id, &Condition::none()).await
    }

    /// Manually claim an item for processing outside the normal poll loop.
    /// The store sets the lease from the item's own timeout.
    pub async fn process(&self, process: &Process) -> Result<Work> {
        self.store
            .update(
                &process.id,
                &Condition::none(),
                &Update::processing(ProcessingUpdate::default()),
            )
            .await
    }

    /// Re-arm a terminal (failed/success) item back to pending.
    pub async fn repeat(&self, id: &WorkId, repeat: &Repeat) -> Result<Work> {
        let work = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !work.state.is_terminal() {
            return Err(Error::InvalidTransition {
                from: work.state,
                to: crate::model::State::Pending,
            });
        }
        self.store
            .update(
                id,
                &Condition::revision(work.revision),
                &Update::pending(repeat.clone().into()),
            )
            .await
    }

    /// Remove an item. Idempotent — succeeds even if already absent.
    pub async fn delete(&self, id: &WorkId) -> Result<()> {
        self.store.delete(id, &Condition::none()).await?;
        Ok(())
    }

    /// Remove every item in a group, returning the count removed.
    pub async fn delete_all_by_group_id(&self, group_id: &str) -> Result<usize> {
        if group_id.is_empty() {
            let mut issues = Issues::new();
            issues.push("groupId", "must not be empty");
            return Err(Error::Validation(issues));
        }
        self.store.delete_all_by_group_id(group_id).await
    }
}
