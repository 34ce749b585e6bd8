//! Journey: the remaining operation surface
//!
//! health, stats, optimize, delete_by_tag, error shapes, and cooperative
//! cancellation.

use remanence_core::{CancellationToken, StorageError, StoreRequest, TagMode, SCHEMA_VERSION};
use remanence_e2e_tests::harness::{TestService, TEST_DIMENSION};
use serde_json::Map;

#[test]
fn health_reports_the_store_shape() {
    let ts = TestService::open();
    ts.service
        .store(StoreRequest::new("one").with_tags(["a", "b"]))
        .unwrap();
    ts.service
        .store(StoreRequest::new("two").with_tags(["b"]))
        .unwrap();

    let health = ts.service.health().unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.total_memories, 2);
    assert_eq!(health.unique_tags, 2);
    assert_eq!(health.dimension, TEST_DIMENSION);
    assert_eq!(health.schema_version, SCHEMA_VERSION);
    assert!(health.model.contains("e2e-hash-encoder"));
    assert!(health.db_size_bytes > 0);
}

#[test]
fn stats_breaks_counts_down() {
    let ts = TestService::open();
    ts.service
        .store(StoreRequest::new("a note").with_type("note"))
        .unwrap();
    ts.service
        .store(StoreRequest::new("a reference").with_type("reference"))
        .unwrap();
    ts.service.store(StoreRequest::new("untyped")).unwrap();

    let stats = ts.service.stats().unwrap();
    assert_eq!(stats.total_memories, 3);
    assert_eq!(stats.live_memories, 3);
    assert_eq!(stats.archived_memories, 0);
    assert_eq!(stats.memories_by_type.get("note"), Some(&1));
    assert_eq!(stats.memories_by_type.get("reference"), Some(&1));
    assert!(stats.oldest_memory.unwrap() <= stats.newest_memory.unwrap());
}

#[test]
fn optimize_returns_a_duration_and_keeps_data() {
    let ts = TestService::open();
    for i in 0..20 {
        ts.service
            .store(StoreRequest::new(format!("filler row {i}")))
            .unwrap();
    }

    let report = ts.service.optimize().unwrap();
    assert!(report.ok);

    assert_eq!(ts.service.health().unwrap().total_memories, 20);
}

#[test]
fn delete_by_tag_returns_the_count() {
    let ts = TestService::open();
    ts.service
        .store(StoreRequest::new("one").with_tags(["drop"]))
        .unwrap();
    ts.service
        .store(StoreRequest::new("two").with_tags(["drop", "other"]))
        .unwrap();
    ts.service
        .store(StoreRequest::new("three").with_tags(["keep"]))
        .unwrap();

    let deleted = ts
        .service
        .delete_by_tag(&["drop".to_string()], TagMode::And)
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(ts.service.health().unwrap().total_memories, 1);
}

#[test]
fn error_shapes_for_bad_inputs() {
    let ts = TestService::open();

    assert!(matches!(
        ts.service.recall_by_time("the before times", None),
        Err(StorageError::InvalidTimeExpression(_))
    ));

    assert!(matches!(
        ts.service.delete("not-a-sha256"),
        Err(StorageError::InvalidInput(_))
    ));

    assert!(matches!(
        ts.service.search_by_tag(&[], TagMode::And),
        Err(StorageError::InvalidInput(_))
    ));

    let missing = remanence_core::content_hash("never stored");
    assert!(matches!(
        ts.service.update_metadata(&missing, &Map::new()),
        Err(StorageError::NotFound(_))
    ));
}

#[test]
fn cancellation_stops_store_and_retrieve() {
    let ts = TestService::open();
    ts.service
        .store(StoreRequest::new("something to scan past"))
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();

    let result = ts
        .service
        .store_cancellable(StoreRequest::new("never lands"), Some(token.clone()));
    assert!(matches!(result, Err(StorageError::Cancelled(_))));

    let result = ts
        .service
        .retrieve_cancellable("anything", 5, Some(token));
    assert!(matches!(result, Err(StorageError::Cancelled(_))));

    // Cancelled store left nothing behind
    assert_eq!(ts.service.health().unwrap().total_memories, 1);
}

#[test]
fn recent_listing_and_tag_inventory() {
    let ts = TestService::open();
    ts.service
        .store(StoreRequest::new("first").with_tags(["x"]))
        .unwrap();
    ts.service
        .store(StoreRequest::new("second").with_tags(["x", "y"]))
        .unwrap();

    let store = ts.service.store_handle();
    let recent = store.list_recent(1).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].content, "second");

    let tags = store.all_tags().unwrap();
    assert_eq!(tags.get("x"), Some(&2));
    assert_eq!(tags.get("y"), Some(&1));
}
