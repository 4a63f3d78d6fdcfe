//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the coordinator.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for work item execution.
///
/// The `work.state` field is declared empty and is filled in by the
/// state-transition events recorded while the item executes.
pub fn start_work_span(work_type: &str, work_id: &WorkId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.type" = work_type,
        "work.id" = %work_id,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the current span.
pub fn record_state_transition(from: &str, to: &str) {
    tracing::info!(from = from, to = to, "state_transition");
}
