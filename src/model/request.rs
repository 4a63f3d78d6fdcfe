//! Request payloads: create, update, poll, list, and the operations the
//! client layers on top of them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Issues, Result};
use crate::model::work::{
    Metadata, State, validate_key, validate_metadata, validate_processing_timeout,
    validate_work_type,
};

/// Maximum number of entries in a `TypeQuantities` map.
pub const TYPE_QUANTITIES_MAX: usize = 100;

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Payload for creating a work item. Items always start pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Create {
    #[serde(rename = "type")]
    pub work_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_id: Option<String>,

    /// Defaults to the creation time when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_available_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_priority: Option<i32>,

    /// Lease duration in seconds. Required.
    pub processing_timeout: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Create {
    pub fn new(work_type: impl Into<String>, processing_timeout: i64) -> Self {
        Self {
            work_type: work_type.into(),
            group_id: None,
            deduplication_id: None,
            serial_id: None,
            processing_available_time: None,
            processing_priority: None,
            processing_timeout,
            metadata: None,
        }
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self
    }

    pub fn serial_id(mut self, serial_id: impl Into<String>) -> Self {
        self.serial_id = Some(serial_id.into());
        self
    }

    pub fn available_time(mut self, at: DateTime<Utc>) -> Self {
        self.processing_available_time = Some(at);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.processing_priority = Some(priority);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut issues = Issues::new();
        validate_work_type("type", &self.work_type, &mut issues);
        validate_key("groupId", self.group_id.as_deref(), &mut issues);
        validate_key(
            "deduplicationId",
            self.deduplication_id.as_deref(),
            &mut issues,
        );
        validate_key("serialId", self.serial_id.as_deref(), &mut issues);
        validate_processing_timeout(self.processing_timeout, &mut issues);
        validate_metadata(self.metadata.as_ref(), &mut issues);
        issues.into_result()
    }
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Payload for a state-transition update. Carries the target state plus
/// exactly one matching per-state payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub state: State,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_update: Option<PendingUpdate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_update: Option<ProcessingUpdate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_update: Option<FailingUpdate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_update: Option<FailedUpdate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_update: Option<SuccessUpdate>,
}

impl Update {
    pub fn pending(update: PendingUpdate) -> Self {
        Self {
            state: State::Pending,
            pending_update: Some(update),
            processing_update: None,
            failing_update: None,
            failed_update: None,
            success_update: None,
        }
    }

    pub fn processing(update: ProcessingUpdate) -> Self {
        Self {
            state: State::Processing,
            pending_update: None,
            processing_update: Some(update),
            failing_update: None,
            failed_update: None,
            success_update: None,
        }
    }

    pub fn failing(update: FailingUpdate) -> Self {
        Self {
            state: State::Failing,
            pending_update: None,
            processing_update: None,
            failing_update: Some(update),
            failed_update: None,
            success_update: None,
        }
    }

    pub fn failed(update: FailedUpdate) -> Self {
        Self {
            state: State::Failed,
            pending_update: None,
            processing_update: None,
            failing_update: None,
            failed_update: Some(update),
            success_update: None,
        }
    }

    pub fn success(update: SuccessUpdate) -> Self {
        Self {
            state: State::Success,
            pending_update: None,
            processing_update: None,
            failing_update: None,
            failed_update: None,
            success_update: Some(update),
        }
    }

    /// Exactly one payload must be present, and it must match `state`.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Issues::new();

        let populated = [
            self.pending_update.is_some(),
            self.processing_update.is_some(),
            self.failing_update.is_some(),
            self.failed_update.is_some(),
            self.success_update.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if populated != 1 {
            issues.push("state", format!("exactly one update payload required, found {populated}"));
        } else {
            let matches = match self.state {
                State::Pending => self.pending_update.is_some(),
                State::Processing => self.processing_update.is_some(),
                State::Failing => self.failing_update.is_some(),
                State::Failed => self.failed_update.is_some(),
                State::Success => self.success_update.is_some(),
            };
            if !matches {
                issues.push("state", format!("update payload does not match state {}", self.state));
            }
        }

        if let Some(ref update) = self.pending_update {
            if let Some(timeout) = update.processing_timeout {
                validate_processing_timeout(timeout, &mut issues);
            }
            validate_metadata(update.metadata.as_ref(), &mut issues);
        }
        if let Some(ref update) = self.processing_update {
            validate_metadata(update.metadata.as_ref(), &mut issues);
        }
        if let Some(ref update) = self.failing_update {
            if update.error.is_empty() {
                issues.push("failingUpdate", "error must not be empty");
            }
            if update.retry_count == 0 {
                issues.push("failingUpdate", "retryCount must be greater than zero");
            }
        }
        if let Some(ref update) = self.failed_update {
            if update.error.is_empty() {
                issues.push("failedUpdate", "error must not be empty");
            }
        }

        issues.into_result()
    }
}

/// Re-arm back into the claimable pool, optionally rescheduling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_available_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_priority: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_timeout: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Metadata checkpoint persisted while a processor holds the lease. Never
/// changes lease times. Also used for a manual claim, where the store sets
/// the lease from the item's own timeout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Transient failure with the processor's chosen retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailingUpdate {
    pub error: String,
    pub retry_count: u32,
    pub retry_time: DateTime<Utc>,
}

/// Permanent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUpdate {
    pub error: String,
}

/// Terminal success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessUpdate {}

// ---------------------------------------------------------------------------
// Poll / List
// ---------------------------------------------------------------------------

/// Mapping from work type to an integer quantity: per-poll claim limits,
/// and per-processor registration capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeQuantities(HashMap<String, usize>);

impl TypeQuantities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, work_type: impl Into<String>, quantity: usize) -> Self {
        self.0.insert(work_type.into(), quantity);
        self
    }

    pub fn insert(&mut self, work_type: impl Into<String>, quantity: usize) {
        self.0.insert(work_type.into(), quantity);
    }

    pub fn get(&self, work_type: &str) -> Option<usize> {
        self.0.get(work_type).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, usize)> {
        self.0.iter().map(|(t, q)| (t, *q))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let mut issues = Issues::new();
        if self.0.is_empty() {
            issues.push("types", "must not be empty");
        }
        if self.0.len() > TYPE_QUANTITIES_MAX {
            issues.push(
                "types",
                format!("must not exceed {TYPE_QUANTITIES_MAX} entries"),
            );
        }
        for (work_type, quantity) in &self.0 {
            if *quantity == 0 {
                issues.push("types", format!("quantity for {work_type:?} must be greater than zero"));
            }
            validate_work_type("types", work_type, &mut issues);
        }
        issues.into_result()
    }
}

impl FromIterator<(String, usize)> for TypeQuantities {
    fn from_iter<I: IntoIterator<Item = (String, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Poll request: claim up to the given quantity of eligible items per type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    #[serde(rename = "types")]
    pub type_quantities: TypeQuantities,
}

impl Poll {
    pub fn new(type_quantities: TypeQuantities) -> Self {
        Self { type_quantities }
    }

    pub fn validate(&self) -> Result<()> {
        self.type_quantities.validate()
    }
}

/// List filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Page/size pagination for list calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 0, size: 100 }
    }
}

/// Optional expected revision for optimistic-concurrency updates. A
/// mismatch fails with a revision conflict, distinct from not-found.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Condition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl Condition {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn revision(revision: i64) -> Self {
        Self {
            revision: Some(revision),
        }
    }
}

// ---------------------------------------------------------------------------
// Client operations
// ---------------------------------------------------------------------------

/// Manual trigger of processing outside the normal poll loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: crate::model::WorkId,
}

/// Re-arm a terminal (failed/success) item back to pending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repeat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_available_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_priority: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_timeout: Option<i64>,
}

impl From<Repeat> for PendingUpdate {
    fn from(repeat: Repeat) -> Self {
        PendingUpdate {
            processing_available_time: repeat.processing_available_time,
            processing_priority: repeat.processing_priority,
            processing_timeout: repeat.processing_timeout,
            metadata: None,
        }
    }
}
