//! Integration tests for the in-memory store: claim semantics, optimistic
//! concurrency, dedup, serial exclusivity, group deletion, lease recovery.

use std::sync::Arc;

use chrono::{Duration, Utc};
use conveyor::error::Error;
use conveyor::model::{
    Condition, Create, Filter, Pagination, Poll, State, SuccessUpdate, TypeQuantities, Update,
};
use conveyor::store::{MemoryStore, Store};

const TYPE_A: &str = "org.example.test.a";
const TYPE_B: &str = "org.example.test.b";

fn poll_one(work_type: &str) -> Poll {
    Poll::new(TypeQuantities::new().with(work_type, 1))
}

fn poll_many(work_type: &str, quantity: usize) -> Poll {
    Poll::new(TypeQuantities::new().with(work_type, quantity))
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_starts_pending_at_revision_zero() {
    let store = MemoryStore::new();

    let work = store.create(&Create::new(TYPE_A, 30)).await.unwrap();

    assert_eq!(work.state, State::Pending);
    assert_eq!(work.revision, 0);
    assert!(work.pending_time.is_some());
    assert_eq!(work.created_time, work.modified_time);
    assert!(work.processing_time.is_none());
}

#[tokio::test]
async fn create_rejects_invalid_payload() {
    let store = MemoryStore::new();
    let result = store.create(&Create::new(TYPE_A, 0)).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn duplicate_deduplication_id_is_rejected() {
    let store = MemoryStore::new();

    store
        .create(&Create::new(TYPE_A, 30).deduplication_id("reminder-42"))
        .await
        .unwrap();
    let second = store
        .create(&Create::new(TYPE_A, 30).deduplication_id("reminder-42"))
        .await;

    assert!(matches!(second, Err(Error::Duplicate(ref d)) if d == "reminder-42"));

    let all = store
        .list(&Filter::default(), &Pagination::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

// ---------------------------------------------------------------------------
// Poll / claim
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_claims_with_lease() {
    let store = MemoryStore::new();
    let created = store.create(&Create::new(TYPE_A, 30)).await.unwrap();

    let claimed = store.poll(&poll_one(TYPE_A)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let work = &claimed[0];
    assert_eq!(work.id, created.id);
    assert_eq!(work.state, State::Processing);
    assert_eq!(
        work.processing_timeout_time,
        work.processing_time.map(|t| t + Duration::seconds(30))
    );

    // Already claimed — nothing left for a second poll
    let again = store.poll(&poll_one(TYPE_A)).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn poll_respects_quantity_and_type() {
    let store = MemoryStore::new();
    for _ in 0..5 {
        store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    }
    store.create(&Create::new(TYPE_B, 30)).await.unwrap();

    let claimed = store.poll(&poll_many(TYPE_A, 3)).await.unwrap();
    assert_eq!(claimed.len(), 3);
    assert!(claimed.iter().all(|w| w.work_type == TYPE_A));
}

#[tokio::test]
async fn poll_orders_by_priority_then_available_time() {
    let store = MemoryStore::new();
    let low = store
        .create(&Create::new(TYPE_A, 30).priority(1))
        .await
        .unwrap();
    let high = store
        .create(&Create::new(TYPE_A, 30).priority(10))
        .await
        .unwrap();

    let first = store.poll(&poll_one(TYPE_A)).await.unwrap();
    assert_eq!(first[0].id, high.id);
    let second = store.poll(&poll_one(TYPE_A)).await.unwrap();
    assert_eq!(second[0].id, low.id);
}

#[tokio::test]
async fn poll_skips_items_not_yet_available() {
    let store = MemoryStore::new();
    store
        .create(&Create::new(TYPE_A, 30).available_time(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();

    let claimed = store.poll(&poll_one(TYPE_A)).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn concurrent_polls_never_double_claim() {
    let store = Arc::new(MemoryStore::new());
    let created = store.create(&Create::new(TYPE_A, 30)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(
            async move { store.poll(&poll_one(TYPE_A)).await },
        ));
    }

    let mut total = 0;
    for handle in handles {
        let claimed = handle.await.unwrap().unwrap();
        assert!(claimed.len() <= 1);
        for work in claimed {
            assert_eq!(work.id, created.id);
            total += 1;
        }
    }
    assert_eq!(total, 1, "exactly one poller may claim a pending item");
}

// ---------------------------------------------------------------------------
// Update / optimistic concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_increments_revision_and_rejects_stale() {
    let store = MemoryStore::new();
    store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    let claimed = store.poll(&poll_one(TYPE_A)).await.unwrap().remove(0);

    let update = Update::success(SuccessUpdate::default());
    let done = store
        .update(&claimed.id, &Condition::revision(claimed.revision), &update)
        .await
        .unwrap();
    assert_eq!(done.state, State::Success);
    assert!(done.success_time.is_some());
    assert_eq!(done.revision, claimed.revision + 1);

    // Replaying with the old revision conflicts and mutates nothing
    let replay = store
        .update(&claimed.id, &Condition::revision(claimed.revision), &update)
        .await;
    assert!(matches!(replay, Err(Error::RevisionConflict { .. })));

    let current = store
        .get(&claimed.id, &Condition::none())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.revision, done.revision);
}

#[tokio::test]
async fn update_missing_item_is_not_found() {
    let store = MemoryStore::new();
    let id = conveyor::model::WorkId::new();
    let result = store
        .update(
            &id,
            &Condition::none(),
            &Update::success(SuccessUpdate::default()),
        )
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn get_with_stale_condition_returns_none() {
    let store = MemoryStore::new();
    let work = store.create(&Create::new(TYPE_A, 30)).await.unwrap();

    assert!(
        store
            .get(&work.id, &Condition::revision(99))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .get(&work.id, &Condition::revision(0))
            .await
            .unwrap()
            .is_some()
    );
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_removes_claimed_item() {
    let store = MemoryStore::new();
    store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    let claimed = store.poll(&poll_one(TYPE_A)).await.unwrap().remove(0);

    let removed = store.delete(&claimed.id, &Condition::none()).await.unwrap();
    assert!(removed.is_some());
    assert!(
        store
            .get(&claimed.id, &Condition::none())
            .await
            .unwrap()
            .is_none()
    );

    // Idempotent at the store level: absent returns None, not an error
    let again = store.delete(&claimed.id, &Condition::none()).await.unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn delete_all_by_group_id_removes_exactly_the_group() {
    let store = MemoryStore::new();
    for _ in 0..3 {
        store
            .create(&Create::new(TYPE_A, 30).group_id("batch-1"))
            .await
            .unwrap();
    }
    store
        .create(&Create::new(TYPE_A, 30).group_id("batch-2"))
        .await
        .unwrap();

    let removed = store.delete_all_by_group_id("batch-1").await.unwrap();
    assert_eq!(removed, 3);

    let filter = Filter {
        types: None,
        group_id: Some("batch-1".to_string()),
    };
    let left = store.list(&filter, &Pagination::default()).await.unwrap();
    assert!(left.is_empty());

    let other = store
        .list(&Filter::default(), &Pagination::default())
        .await
        .unwrap();
    assert_eq!(other.len(), 1);
}

// ---------------------------------------------------------------------------
// Serial exclusivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn serial_id_allows_one_processing_at_a_time() {
    let store = MemoryStore::new();
    store
        .create(&Create::new(TYPE_A, 30).serial_id("user-7"))
        .await
        .unwrap();
    store
        .create(&Create::new(TYPE_A, 30).serial_id("user-7"))
        .await
        .unwrap();

    // Both eligible, but only one may hold the serial key
    let first = store.poll(&poll_many(TYPE_A, 2)).await.unwrap();
    assert_eq!(first.len(), 1);

    let blocked = store.poll(&poll_many(TYPE_A, 2)).await.unwrap();
    assert!(blocked.is_empty());

    // Finishing the holder releases the key
    store
        .update(
            &first[0].id,
            &Condition::revision(first[0].revision),
            &Update::success(SuccessUpdate::default()),
        )
        .await
        .unwrap();

    let second = store.poll(&poll_many(TYPE_A, 2)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].id, first[0].id);
}

// ---------------------------------------------------------------------------
// Lease expiry recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_lease_is_reclaimed_by_a_later_poll() {
    let store = MemoryStore::new();
    store.create(&Create::new(TYPE_A, 1)).await.unwrap();

    let first = store.poll(&poll_one(TYPE_A)).await.unwrap();
    assert_eq!(first.len(), 1);

    // Lease still live — not claimable
    assert!(store.poll(&poll_one(TYPE_A)).await.unwrap().is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let reclaimed = store.poll(&poll_one(TYPE_A)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, first[0].id);
    assert_eq!(reclaimed[0].state, State::Processing);
    assert!(reclaimed[0].processing_time > first[0].processing_time);
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_filters_by_type_and_paginates() {
    let store = MemoryStore::new();
    for _ in 0..4 {
        store.create(&Create::new(TYPE_A, 30)).await.unwrap();
    }
    store.create(&Create::new(TYPE_B, 30)).await.unwrap();

    let filter = Filter {
        types: Some(vec![TYPE_A.to_string()]),
        group_id: None,
    };
    let all = store.list(&filter, &Pagination::default()).await.unwrap();
    assert_eq!(all.len(), 4);

    let page = store
        .list(&filter, &Pagination { page: 1, size: 3 })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
}
