//! Pure state-transition engine.
//!
//! Every mutation of a work item flows through here, so the lifecycle
//! bookkeeping (which timestamp/error group is populated, lease times,
//! revision counting) lives in exactly one place. Store implementations
//! call these functions and only supply atomicity.

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::model::request::{
    Create, FailedUpdate, FailingUpdate, PendingUpdate, ProcessingUpdate, SuccessUpdate, Update,
};
use crate::model::work::{State, Work, WorkId};

impl Work {
    /// Build a new pending work item from a validated create payload.
    pub fn from_create(create: &Create, now: DateTime<Utc>) -> Result<Self> {
        create.validate()?;
        Ok(Self {
            id: WorkId::new(),
            work_type: create.work_type.clone(),
            group_id: create.group_id.clone(),
            deduplication_id: create.deduplication_id.clone(),
            serial_id: create.serial_id.clone(),
            processing_available_time: create.processing_available_time.unwrap_or(now),
            processing_priority: create.processing_priority.unwrap_or(0),
            processing_timeout: create.processing_timeout,
            metadata: create.metadata.clone(),
            state: State::Pending,
            pending_time: Some(now),
            processing_time: None,
            processing_timeout_time: None,
            processing_duration: None,
            failing_time: None,
            failing_error: None,
            failing_retry_count: None,
            failing_retry_time: None,
            failed_time: None,
            failed_error: None,
            success_time: None,
            created_time: now,
            modified_time: now,
            revision: 0,
        })
    }

    /// Is this item claimable at `now`?
    ///
    /// Pending items past their available time, failing items past their
    /// retry time, and processing items whose lease has expired (abandoned,
    /// reclaimable without coordinator intervention).
    pub fn claim_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            State::Pending => self.processing_available_time <= now,
            State::Failing => self.failing_retry_time.is_some_and(|t| t <= now),
            State::Processing => self.processing_timeout_time.is_some_and(|t| t <= now),
            State::Failed | State::Success => false,
        }
    }

    /// The claim transition: into Processing under a fresh lease.
    ///
    /// Failing bookkeeping survives a retry claim so the last error stays
    /// visible while the item is processing again.
    pub fn claiming(&self, now: DateTime<Utc>) -> Result<Self> {
        if !self.state.can_transition_to(State::Processing) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: State::Processing,
            });
        }
        let mut next = self.clone();
        next.claim_in_place(now);
        next.touch(now);
        Ok(next)
    }

    /// Apply a state-transition update, returning the successor item.
    ///
    /// Fails with a validation error for a malformed payload and with an
    /// invalid-transition error for an illegal state change. Never mutates
    /// `self`.
    pub fn applying(&self, update: &Update, now: DateTime<Utc>) -> Result<Self> {
        update.validate()?;
        if !self.state.can_transition_to(update.state) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: update.state,
            });
        }

        let mut next = self.clone();
        match payload_of(update)? {
            Payload::Pending(p) => next.repend_in_place(p, now),
            Payload::Processing(p) => {
                if self.state == State::Processing {
                    // Checkpoint: metadata only, lease untouched.
                    if let Some(ref metadata) = p.metadata {
                        next.metadata = Some(metadata.clone());
                    }
                } else {
                    next.claim_in_place(now);
                    if let Some(ref metadata) = p.metadata {
                        next.metadata = Some(metadata.clone());
                    }
                }
            }
            Payload::Failing(p) => next.fail_transiently_in_place(p, now),
            Payload::Failed(p) => next.fail_in_place(p, now),
            Payload::Success(_) => next.succeed_in_place(now),
        }
        next.touch(now);
        Ok(next)
    }

    fn claim_in_place(&mut self, now: DateTime<Utc>) {
        self.record_processing_duration(now);
        self.state = State::Processing;
        self.pending_time = None;
        self.processing_time = Some(now);
        self.processing_timeout_time = Some(now + Duration::seconds(self.processing_timeout));
        self.processing_duration = None;
        // failing_error and failing_retry_count carry into the retry claim
        self.failing_time = None;
        self.failing_retry_time = None;
    }

    fn repend_in_place(&mut self, update: &PendingUpdate, now: DateTime<Utc>) {
        self.record_processing_duration(now);
        self.state = State::Pending;
        self.pending_time = Some(now);
        if let Some(at) = update.processing_available_time {
            self.processing_available_time = at;
        }
        if let Some(priority) = update.processing_priority {
            self.processing_priority = priority;
        }
        if let Some(timeout) = update.processing_timeout {
            self.processing_timeout = timeout;
        }
        if let Some(ref metadata) = update.metadata {
            self.metadata = Some(metadata.clone());
        }
        self.clear_processing();
        self.clear_failing();
        self.clear_terminal();
    }

    fn fail_transiently_in_place(&mut self, update: &FailingUpdate, now: DateTime<Utc>) {
        self.record_processing_duration(now);
        self.state = State::Failing;
        self.clear_processing();
        self.failing_time = Some(now);
        self.failing_error = Some(update.error.clone());
        self.failing_retry_count = Some(update.retry_count);
        self.failing_retry_time = Some(update.retry_time);
    }

    fn fail_in_place(&mut self, update: &FailedUpdate, now: DateTime<Utc>) {
        self.record_processing_duration(now);
        self.state = State::Failed;
        self.clear_processing();
        self.clear_failing();
        self.failed_time = Some(now);
        self.failed_error = Some(update.error.clone());
    }

    fn succeed_in_place(&mut self, now: DateTime<Utc>) {
        self.record_processing_duration(now);
        self.state = State::Success;
        self.clear_processing();
        self.clear_failing();
        self.success_time = Some(now);
    }

    fn record_processing_duration(&mut self, now: DateTime<Utc>) {
        if self.state == State::Processing {
            if let Some(start) = self.processing_time {
                self.processing_duration = Some((now - start).num_milliseconds() as f64 / 1000.0);
            }
        }
    }

    fn clear_processing(&mut self) {
        self.processing_time = None;
        self.processing_timeout_time = None;
    }

    fn clear_failing(&mut self) {
        self.failing_time = None;
        self.failing_error = None;
        self.failing_retry_count = None;
        self.failing_retry_time = None;
    }

    fn clear_terminal(&mut self) {
        self.failed_time = None;
        self.failed_error = None;
        self.success_time = None;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.modified_time = now;
        self.revision += 1;
    }
}

enum Payload<'a> {
    Pending(&'a PendingUpdate),
    Processing(&'a ProcessingUpdate),
    Failing(&'a FailingUpdate),
    Failed(&'a FailedUpdate),
    Success(&'a SuccessUpdate),
}

fn payload_of(update: &Update) -> Result<Payload<'_>> {
    match update.state {
        State::Pending => update.pending_update.as_ref().map(Payload::Pending),
        State::Processing => update.processing_update.as_ref().map(Payload::Processing),
        State::Failing => update.failing_update.as_ref().map(Payload::Failing),
        State::Failed => update.failed_update.as_ref().map(Payload::Failed),
        State::Success => update.success_update.as_ref().map(Payload::Success),
    }
    .ok_or_else(|| Error::Other(format!("update payload missing for state {}", update.state)))
}
