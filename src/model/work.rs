//! The work item: identity, scheduling attributes, lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Issues, Result};

/// Arbitrary key/value payload carried by a work item. Opaque to the
/// coordinator; interpreted only by the processor that owns the type.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Maximum serialized metadata size in bytes.
pub const METADATA_SIZE_MAX: usize = 4096;

/// Maximum length of group, deduplication, and serial keys.
pub const KEY_LENGTH_MAX: usize = 1000;

/// Processing timeout bounds, in seconds.
pub const PROCESSING_TIMEOUT_MIN: i64 = 1;
pub const PROCESSING_TIMEOUT_MAX: i64 = 86400;

// ---------------------------------------------------------------------------
// Work Id
// ---------------------------------------------------------------------------

/// Newtype for work item IDs: 24 lowercase hex characters, immutable once
/// created. Four timestamp bytes followed by eight random bytes, so IDs
/// sort roughly by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(String);

impl WorkId {
    pub fn new() -> Self {
        let seconds = Utc::now().timestamp().max(0) as u32;
        let entropy = Uuid::new_v4().as_simple().to_string();
        Self(format!("{seconds:08x}{}", &entropy[..16]))
    }

    /// Parse an ID from its string form, rejecting malformed input.
    pub fn parse(s: &str) -> Result<Self> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            let mut issues = Issues::new();
            issues.push("id", format!("{s:?} is not 24 lowercase hex characters"));
            Err(Error::Validation(issues))
        }
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == 24
            && s.chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
///
/// Deletion is not a state: a delete removes the item entirely, used for
/// terminal outcomes that need no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting to be claimed once `processing_available_time` passes.
    Pending,
    /// Claimed under a lease, a processor is working on it.
    Processing,
    /// Transient failure, eligible again once `failing_retry_time` passes.
    Failing,
    /// Permanent failure. Terminal unless manually repeated.
    Failed,
    /// Done. Terminal unless manually repeated.
    Success,
}

impl State {
    /// Can transition from self to `to`?
    ///
    /// Processing -> Processing covers metadata checkpoints made while a
    /// processor holds the lease.
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Failing)
                | (Processing, Pending)     // re-arm, back to the claimable pool
                | (Processing, Processing)  // checkpoint
                | (Failing, Processing)     // retry claim
                | (Failed, Pending)         // manual repeat
                | (Success, Pending) // manual repeat
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Failed | State::Success)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Processing => "processing",
            State::Failing => "failing",
            State::Failed => "failed",
            State::Success => "success",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "processing" => Ok(State::Processing),
            "failing" => Ok(State::Failing),
            "failed" => Ok(State::Failed),
            "success" => Ok(State::Success),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// A persisted unit of work with full lifecycle state.
///
/// Mutated exclusively through store updates that encode a state
/// transition; `revision` increments by one on every successful update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    pub id: WorkId,

    /// Reverse-domain work type. Determines which processor handles the
    /// item and how poll capacity is accounted.
    #[serde(rename = "type")]
    pub work_type: String,

    /// Batch-deletion grouping key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Idempotency key. The store rejects a create whose deduplication id
    /// collides with an existing item's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication_id: Option<String>,

    /// Mutual-exclusion key. At most one item per serial id may be
    /// processing at any instant, regardless of type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_id: Option<String>,

    /// Not eligible for claim before this time.
    pub processing_available_time: DateTime<Utc>,

    /// Higher claimed first among eligible items of the same type.
    pub processing_priority: i32,

    /// Lease duration in seconds once claimed.
    pub processing_timeout: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    pub state: State,

    /// Set whenever the item is (re)pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_time: Option<DateTime<Utc>>,

    /// Set while claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<DateTime<Utc>>,

    /// `processing_time + processing_timeout`; the lease expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_timeout_time: Option<DateTime<Utc>>,

    /// Seconds spent in the most recent processing attempt, recorded on
    /// every transition out of Processing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_duration: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_time: Option<DateTime<Utc>>,

    /// Present while Failing, and retained through the retry claim into
    /// Processing so the last error stays visible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_retry_count: Option<u32>,

    /// Not eligible for a retry claim before this time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_retry_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_time: Option<DateTime<Utc>>,

    pub created_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,

    /// Optimistic-concurrency counter. 0 at creation.
    pub revision: i64,
}

impl Work {
    /// Validate internal consistency: field shapes plus the
    /// exactly-one-state-payload rule and lease ordering.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Issues::new();

        if !WorkId::is_valid(self.id.as_str()) {
            issues.push("id", "must be 24 lowercase hex characters");
        }
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

        self.validate_state_payload(&mut issues);

        issues.into_result()
    }

    fn validate_state_payload(&self, issues: &mut Issues) {
        match self.state {
            State::Pending => {
                if self.pending_time.is_none() {
                    issues.push("pendingTime", "required while pending");
                }
                require_absent(issues, "processingTime", self.processing_time.is_some());
                require_absent(issues, "failingError", self.failing_error.is_some());
                require_absent(issues, "failedError", self.failed_error.is_some());
                require_absent(issues, "successTime", self.success_time.is_some());
            }
            State::Processing => {
                match (self.processing_time, self.processing_timeout_time) {
                    (Some(start), Some(expiry)) => {
                        if expiry <= start {
                            issues.push(
                                "processingTimeoutTime",
                                "must be after processingTime",
                            );
                        }
                        if start <= self.created_time {
                            issues.push("processingTime", "must be after createdTime");
                        }
                    }
                    _ => {
                        issues.push(
                            "processingTime",
                            "processingTime and processingTimeoutTime required while processing",
                        );
                    }
                }
                require_absent(issues, "pendingTime", self.pending_time.is_some());
                require_absent(issues, "failedError", self.failed_error.is_some());
                require_absent(issues, "successTime", self.success_time.is_some());
            }
            State::Failing => {
                if self.failing_time.is_none()
                    || self.failing_error.is_none()
                    || self.failing_retry_count.is_none()
                    || self.failing_retry_time.is_none()
                {
                    issues.push(
                        "failingError",
                        "failingTime, failingError, failingRetryCount, and failingRetryTime required while failing",
                    );
                }
                require_absent(issues, "pendingTime", self.pending_time.is_some());
                require_absent(issues, "processingTime", self.processing_time.is_some());
                require_absent(issues, "failedError", self.failed_error.is_some());
                require_absent(issues, "successTime", self.success_time.is_some());
            }
            State::Failed => {
                if self.failed_time.is_none() || self.failed_error.is_none() {
                    issues.push("failedError", "failedTime and failedError required when failed");
                }
                require_absent(issues, "pendingTime", self.pending_time.is_some());
                require_absent(issues, "processingTime", self.processing_time.is_some());
                require_absent(issues, "failingError", self.failing_error.is_some());
                require_absent(issues, "successTime", self.success_time.is_some());
            }
            State::Success => {
                if self.success_time.is_none() {
                    issues.push("successTime", "required when success");
                }
                require_absent(issues, "pendingTime", self.pending_time.is_some());
                require_absent(issues, "processingTime", self.processing_time.is_some());
                require_absent(issues, "failingError", self.failing_error.is_some());
                require_absent(issues, "failedError", self.failed_error.is_some());
            }
        }
    }
}

fn require_absent(issues: &mut Issues, field: &'static str, present: bool) {
    if present {
        issues.push(field, "must be absent in this state");
    }
}

// ---------------------------------------------------------------------------
// Field validation helpers
// ---------------------------------------------------------------------------

/// Reverse-domain work type: at least two dot-separated segments, each
/// non-empty, ASCII alphanumeric or hyphen.
pub(crate) fn validate_work_type(field: &'static str, value: &str, issues: &mut Issues) {
    if value.is_empty() {
        issues.push(field, "must not be empty");
        return;
    }
    if value.len() > KEY_LENGTH_MAX {
        issues.push(field, format!("must not exceed {KEY_LENGTH_MAX} characters"));
        return;
    }
    let segments: Vec<&str> = value.split('.').collect();
    if segments.len() < 2
        || segments
            .iter()
            .any(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
    {
        issues.push(
            field,
            format!("{value:?} is not a reverse-domain work type"),
        );
    }
}

pub(crate) fn validate_key(field: &'static str, value: Option<&str>, issues: &mut Issues) {
    if let Some(value) = value {
        if value.is_empty() {
            issues.push(field, "must not be empty when present");
        } else if value.len() > KEY_LENGTH_MAX {
            issues.push(field, format!("must not exceed {KEY_LENGTH_MAX} characters"));
        }
    }
}

pub(crate) fn validate_processing_timeout(value: i64, issues: &mut Issues) {
    if !(PROCESSING_TIMEOUT_MIN..=PROCESSING_TIMEOUT_MAX).contains(&value) {
        issues.push(
            "processingTimeout",
            format!("must be between {PROCESSING_TIMEOUT_MIN} and {PROCESSING_TIMEOUT_MAX} seconds"),
        );
    }
}

pub(crate) fn validate_metadata(value: Option<&Metadata>, issues: &mut Issues) {
    if let Some(metadata) = value {
        let size = serde_json::to_vec(metadata).map(|b| b.len()).unwrap_or(usize::MAX);
        if size > METADATA_SIZE_MAX {
            issues.push(
                "metadata",
                format!("serialized size {size} exceeds {METADATA_SIZE_MAX} bytes"),
            );
        }
    }
}
