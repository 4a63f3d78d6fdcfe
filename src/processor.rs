//! Processor: pluggable unit of business logic registered per work type.
//!
//! The coordinator claims items of a processor's type and dispatches them
//! to it; the processor reports its outcome as a [`ProcessResult`] rather
//! than an error, so transient and permanent failures stay distinguishable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::model::{
    FailedUpdate, FailingUpdate, Metadata, PendingUpdate, SuccessUpdate, Work,
};

#[async_trait]
pub trait Processor: Send + Sync {
    /// The reverse-domain work type this processor owns. The coordinator
    /// rejects registering two processors for the same type.
    fn work_type(&self) -> &str;

    /// Maximum number of items of this type held in flight concurrently.
    /// Must be greater than zero.
    fn quantity(&self) -> usize;

    /// Minimum interval between polls issued on behalf of this type.
    /// Must be non-zero.
    fn frequency(&self) -> Duration;

    /// Perform the business action for one claimed item.
    ///
    /// May call the updater any number of times to persist incremental
    /// metadata while working. Must finish within the item's processing
    /// timeout: at that boundary the coordinator aborts the call and
    /// records a transient failure, so a slow processor is retried rather
    /// than silently dropped.
    async fn process(&self, work: Work, updater: Arc<dyn ProcessingUpdater>) -> ProcessResult;
}

/// Handle for persisting metadata checkpoints while processing. Never
/// changes the item's state; tracks the item's revision across calls.
#[async_trait]
pub trait ProcessingUpdater: Send + Sync {
    async fn processing_update(&self, metadata: Metadata) -> Result<Work>;
}

/// Outcome of processing one work item.
#[derive(Debug, Clone)]
pub enum ProcessResult {
    /// Re-arm the item back into the claimable pool.
    Pending(PendingUpdate),
    /// Transient failure; retry after the update's retry time.
    Failing(FailingUpdate),
    /// Permanent failure. Terminal until manually repeated.
    Failed(FailedUpdate),
    /// Done.
    Success(SuccessUpdate),
    /// Remove the item entirely — no further action needed, and no record
    /// of success wanted (idempotent no-ops).
    Delete,
}

impl FailingUpdate {
    /// A transient failure scheduled with exponential backoff:
    /// min(60 * 2^(count-1), 3600) seconds from now.
    pub fn backoff(error: impl Into<String>, retry_count: u32) -> Self {
        let exponent = retry_count.saturating_sub(1).min(6);
        let delay = (60i64 << exponent).min(3600);
        Self {
            error: error.into(),
            retry_count,
            retry_time: Utc::now() + chrono::Duration::seconds(delay),
        }
    }
}

/// Decode a work item's metadata into a processor's typed shape.
///
/// Processors own their metadata schemas; a shape mismatch surfaces as a
/// validation error rather than a silent default.
pub fn decode_metadata<T: serde::de::DeserializeOwned>(metadata: &Metadata) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(metadata.clone())).map_err(|e| {
        let mut issues = crate::error::Issues::new();
        issues.push("metadata", e.to_string());
        Error::Validation(issues)
    })
}
