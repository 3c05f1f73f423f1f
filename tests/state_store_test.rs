//! State store behavior: round-trips, update-only semantics, and
//! self-healing initialization of the persistence document.

use berth::state::{InstanceState, JsonStateStore, MemoryStateStore, StateStore};
use berth::BerthError;

#[tokio::test]
async fn upsert_then_get_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path().join("state.json"));

    store.upsert("app1", InstanceState::PullingImage).await.unwrap();
    assert_eq!(
        store.get("app1").await.unwrap(),
        Some(InstanceState::PullingImage)
    );

    // Upsert replaces, it does not accumulate records.
    store.upsert("app1", InstanceState::Running).await.unwrap();
    assert_eq!(store.get("app1").await.unwrap(), Some(InstanceState::Running));
}

#[tokio::test]
async fn update_existing_requires_a_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(dir.path().join("state.json"));

    let err = store
        .update_existing("ghost", InstanceState::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, BerthError::NotFound(_)));

    // The failed update must not have created a record.
    assert_eq!(store.get("ghost").await.unwrap(), None);
}

#[tokio::test]
async fn absent_document_is_created_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.json");
    let store = JsonStateStore::new(path.clone());

    assert_eq!(store.get("anything").await.unwrap(), None);
    assert!(path.exists());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
}

#[tokio::test]
async fn corrupt_document_fails_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ not json").unwrap();
    let store = JsonStateStore::new(path.clone());

    let err = store.get("app1").await.unwrap_err();
    assert!(matches!(err, BerthError::Serialization(_)));

    // The corrupt document must survive untouched, never silently reset.
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
}

#[tokio::test]
async fn memory_store_matches_contract() {
    let store = MemoryStateStore::new();
    store.upsert("a", InstanceState::Installing).await.unwrap();
    assert_eq!(store.get("a").await.unwrap(), Some(InstanceState::Installing));

    store.update_existing("a", InstanceState::Running).await.unwrap();
    assert_eq!(store.get("a").await.unwrap(), Some(InstanceState::Running));

    assert!(matches!(
        store.update_existing("b", InstanceState::Running).await,
        Err(BerthError::NotFound(_))
    ));
    assert_eq!(store.get("b").await.unwrap(), None);
}
