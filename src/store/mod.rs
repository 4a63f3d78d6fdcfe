//! Durable, queryable persistence for work items.
//!
//! The store is the single source of truth and the sole serialization
//! point: the coordinator and its concurrent tasks never mutate a work
//! item directly. Claims made by [`Store::poll`] are atomic with respect
//! to concurrent pollers, including pollers in other service instances.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Condition, Create, Filter, Pagination, Poll, Update, Work, WorkId};

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically claim up to the requested quantity of eligible items per
    /// type, transitioning each to Processing under a fresh lease.
    ///
    /// Eligible items are returned ordered by priority descending, then
    /// available time ascending, and never more per type than requested.
    /// Items sharing a non-empty serial id are never claimed while another
    /// holder of that serial id is processing.
    async fn poll(&self, poll: &Poll) -> Result<Vec<Work>>;

    async fn list(&self, filter: &Filter, pagination: &Pagination) -> Result<Vec<Work>>;

    /// Persist a new pending item. Fails with a duplicate error when an
    /// active item with the same deduplication id exists.
    async fn create(&self, create: &Create) -> Result<Work>;

    /// Ok(None) when the id is absent or the condition does not match.
    async fn get(&self, id: &WorkId, condition: &Condition) -> Result<Option<Work>>;

    /// Apply a state-transition update. A stale condition revision fails
    /// with a revision conflict and leaves the record untouched.
    async fn update(&self, id: &WorkId, condition: &Condition, update: &Update) -> Result<Work>;

    /// Remove an item, returning it. Ok(None) when already absent; a stale
    /// condition revision fails with a revision conflict.
    async fn delete(&self, id: &WorkId, condition: &Condition) -> Result<Option<Work>>;

    /// Remove every item in a group, returning the count removed.
    async fn delete_all_by_group_id(&self, group_id: &str) -> Result<usize>;
}
