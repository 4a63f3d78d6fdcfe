//! Integration tests for the client façade over the store.

use std::sync::Arc;

use conveyor::client::Client;
use conveyor::error::Error;
use conveyor::model::{Create, Process, Repeat, State, WorkId};
use conveyor::store::MemoryStore;

const TYPE_A: &str = "org.example.test.a";

fn test_client() -> Client {
    Client::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn create_and_get() {
    let client = test_client();

    let work = client.create(&Create::new(TYPE_A, 30)).await.unwrap();
    assert_eq!(work.state, State::Pending);

    let fetched = client.get(&work.id).await.unwrap().unwrap();
    assert_eq!(fetched, work);
}

#[tokio::test]
async fn get_missing_returns_none_without_error() {
    let client = test_client();
    assert!(client.get(&WorkId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn create_rejects_invalid_type() {
    let client = test_client();
    let result = client.create(&Create::new("nodots", 30)).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn process_claims_manually() {
    let client = test_client();
    let work = client.create(&Create::new(TYPE_A, 30)).await.unwrap();

    let claimed = client
        .process(&Process {
            id: work.id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(claimed.state, State::Processing);
    assert!(claimed.processing_time.is_some());
    assert!(claimed.processing_timeout_time.is_some());
}

#[tokio::test]
async fn repeat_rearms_terminal_item() {
    let client = test_client();
    let work = client.create(&Create::new(TYPE_A, 30)).await.unwrap();

    // Drive to success through manual processing
    let claimed = client
        .process(&Process {
            id: work.id.clone(),
        })
        .await
        .unwrap();
    let done = client
        .store()
        .update(
            &claimed.id,
            &conveyor::model::Condition::revision(claimed.revision),
            &conveyor::model::Update::success(conveyor::model::SuccessUpdate::default()),
        )
        .await
        .unwrap();
    assert_eq!(done.state, State::Success);

    let repeated = client.repeat(&work.id, &Repeat::default()).await.unwrap();
    assert_eq!(repeated.state, State::Pending);
    assert!(repeated.pending_time.is_some());
    assert!(repeated.success_time.is_none());
}

#[tokio::test]
async fn repeat_rejects_non_terminal_item() {
    let client = test_client();
    let work = client.create(&Create::new(TYPE_A, 30)).await.unwrap();

    let result = client.repeat(&work.id, &Repeat::default()).await;
    assert!(matches!(result, Err(Error::InvalidTransition { .. })));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let client = test_client();
    let work = client.create(&Create::new(TYPE_A, 30)).await.unwrap();

    client.delete(&work.id).await.unwrap();
    assert!(client.get(&work.id).await.unwrap().is_none());

    // Absent — still succeeds
    client.delete(&work.id).await.unwrap();
}

#[tokio::test]
async fn delete_all_by_group_id_returns_count() {
    let client = test_client();
    for _ in 0..2 {
        client
            .create(&Create::new(TYPE_A, 30).group_id("batch-9"))
            .await
            .unwrap();
    }

    let removed = client.delete_all_by_group_id("batch-9").await.unwrap();
    assert_eq!(removed, 2);

    let result = client.delete_all_by_group_id("").await;
    assert!(matches!(result, Err(Error::Validation(_))));
}
