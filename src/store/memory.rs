//! In-memory store.
//!
//! A single async mutex over the item map makes every operation — claim
//! transitions included — atomic. Used by tests and by embedded consumers
//! that do not need durability.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{Condition, Create, Filter, Pagination, Poll, State, Update, Work, WorkId};
use crate::store::Store;

#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<WorkId, Work>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn poll(&self, poll: &Poll) -> Result<Vec<Work>> {
        poll.validate()?;
        let now = Utc::now();
        let mut items = self.items.lock().await;

        // Serial ids already held by a live lease. Claims made during this
        // poll are added as they happen so one batch cannot double-claim.
        let mut active_serials: HashSet<String> = items
            .values()
            .filter(|w| {
                w.state == State::Processing
                    && w.processing_timeout_time.is_some_and(|t| t > now)
            })
            .filter_map(|w| w.serial_id.clone())
            .collect();

        let mut claimed = Vec::new();
        for (work_type, quantity) in poll.type_quantities.iter() {
            let mut candidates: Vec<WorkId> = items
                .values()
                .filter(|w| w.work_type == *work_type && w.claim_eligible(now))
                .map(|w| w.id.clone())
                .collect();
            candidates.sort_by(|a, b| {
                let wa = &items[a];
                let wb = &items[b];
                wb.processing_priority
                    .cmp(&wa.processing_priority)
                    .then(wa.processing_available_time.cmp(&wb.processing_available_time))
            });

            let mut taken = 0;
            for id in candidates {
                if taken >= quantity {
                    break;
                }
                let work = &items[&id];
                if let Some(ref serial) = work.serial_id {
                    if active_serials.contains(serial) {
                        continue;
                    }
                }
                let next = work.claiming(now)?;
                if let Some(ref serial) = next.serial_id {
                    active_serials.insert(serial.clone());
                }
                items.insert(id, next.clone());
                claimed.push(next);
                taken += 1;
            }
        }

        Ok(claimed)
    }

    async fn list(&self, filter: &Filter, pagination: &Pagination) -> Result<Vec<Work>> {
        let items = self.items.lock().await;
        let mut matched: Vec<Work> = items
            .values()
            .filter(|w| {
                filter
                    .types
                    .as_ref()
                    .is_none_or(|types| types.iter().any(|t| *t == w.work_type))
            })
            .filter(|w| {
                filter
                    .group_id
                    .as_ref()
                    .is_none_or(|g| w.group_id.as_ref() == Some(g))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_time.cmp(&b.created_time));

        Ok(matched
            .into_iter()
            .skip(pagination.page * pagination.size)
            .take(pagination.size)
            .collect())
    }

    async fn create(&self, create: &Create) -> Result<Work> {
        let now = Utc::now();
        let work = Work::from_create(create, now)?;

        let mut items = self.items.lock().await;
        if let Some(ref dedup) = work.deduplication_id {
            let collision = items
                .values()
                .any(|w| !w.state.is_terminal() && w.deduplication_id.as_ref() == Some(dedup));
            if collision {
                return Err(Error::Duplicate(dedup.clone()));
            }
        }
        items.insert(work.id.clone(), work.clone());
        Ok(work)
    }

    async fn get(&self, id: &WorkId, condition: &Condition) -> Result<Option<Work>> {
        let items = self.items.lock().await;
        Ok(items
            .get(id)
            .filter(|w| condition.revision.is_none_or(|r| r == w.revision))
            .cloned())
    }

    async fn update(&self, id: &WorkId, condition: &Condition, update: &Update) -> Result<Work> {
        let now = Utc::now();
        let mut items = self.items.lock().await;
        let work = items
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(expected) = condition.revision {
            if expected != work.revision {
                return Err(Error::RevisionConflict {
                    id: id.to_string(),
                    expected,
                    actual: work.revision,
                });
            }
        }
        let next = work.applying(update, now)?;
        items.insert(id.clone(), next.clone());
        Ok(next)
    }

    async fn delete(&self, id: &WorkId, condition: &Condition) -> Result<Option<Work>> {
        let mut items = self.items.lock().await;
        let Some(work) = items.get(id) else {
            return Ok(None);
        };
        if let Some(expected) = condition.revision {
            if expected != work.revision {
                return Err(Error::RevisionConflict {
                    id: id.to_string(),
                    expected,
                    actual: work.revision,
                });
            }
        }
        Ok(items.remove(id))
    }

    async fn delete_all_by_group_id(&self, group_id: &str) -> Result<usize> {
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|_, w| w.group_id.as_deref() != Some(group_id));
        Ok(before - items.len())
    }
}
