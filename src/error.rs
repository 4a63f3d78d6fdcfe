//! Error types for conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    /// Stale revision presented on an update or delete. Distinct from
    /// not-found so callers can re-read and retry.
    #[error("revision conflict on work item {id}: expected {expected}, found {actual}")]
    RevisionConflict {
        id: String,
        expected: i64,
        actual: i64,
    },

    /// An active work item with the same deduplication id already exists.
    #[error("duplicate work item for deduplication id {0:?}")]
    Duplicate(String),

    #[error("validation failed: {0}")]
    Validation(Issues),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One malformed field, reported by payload validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub field: &'static str,
    pub message: String,
}

/// Collector for validation issues. A payload's `validate()` pushes one
/// issue per malformed field and converts to `Error::Validation` at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Issues(Vec<Issue>);

impl Issues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(Issue {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issue> {
        self.0.iter()
    }

    /// Ok if no issues were collected, Err(Error::Validation) otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl std::fmt::Display for Issues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", issue.field, issue.message)?;
        }
        Ok(())
    }
}
