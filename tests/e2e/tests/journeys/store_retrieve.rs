//! Journey: store -> retrieve
//!
//! The front-door flow: text goes in with tags and metadata, semantic
//! queries get it back ranked by meaning, and duplicate content is a
//! polite no-op.

use remanence_core::{StorageError, StoreRequest};
use remanence_e2e_tests::harness::TestService;
use serde_json::{json, Value};

#[test]
fn store_then_retrieve_exact_match_ranks_first() {
    let ts = TestService::open();

    ts.service
        .store(
            StoreRequest::new("The capital of France is Paris.").with_tags(["geo", "trivia"]),
        )
        .unwrap();
    ts.service
        .store(StoreRequest::new("Sourdough needs a mature starter and patience."))
        .unwrap();
    ts.service
        .store(StoreRequest::new("Borrow checker errors usually mean a lifetime problem."))
        .unwrap();

    let results = ts.service.retrieve("capital France", 5).unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].memory.content, "The capital of France is Paris.");
    assert!(
        results[0].relevance_score >= 0.5,
        "expected relevance >= 0.5, got {}",
        results[0].relevance_score
    );
    assert_eq!(results[0].memory.tags, vec!["geo", "trivia"]);

    // Scores are sorted descending
    for pair in results.windows(2) {
        assert!(pair[0].relevance_score >= pair[1].relevance_score);
    }
}

#[test]
fn duplicate_content_stores_exactly_one_row() {
    let ts = TestService::open();

    let first = ts
        .service
        .store(StoreRequest::new("duplicate-content"))
        .unwrap();
    assert!(first.success);
    assert!(first.reason.is_none());

    let second = ts
        .service
        .store(StoreRequest::new("duplicate-content"))
        .unwrap();
    assert!(!second.success);
    assert_eq!(second.reason.as_deref(), Some("duplicate"));
    assert_eq!(second.content_hash, first.content_hash);

    assert_eq!(ts.service.health().unwrap().total_memories, 1);
}

#[test]
fn stored_embedding_has_declared_shape_and_unit_norm() {
    let ts = TestService::open();
    let outcome = ts
        .service
        .store(StoreRequest::new("embedding shape check"))
        .unwrap();

    let store = ts.service.store_handle();
    let embedding = store.get_embedding(&outcome.content_hash).unwrap().unwrap();
    assert_eq!(embedding.len(), store.dimension());
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

#[test]
fn metadata_patch_round_trips_and_preserves_unrelated_keys() {
    let ts = TestService::open();

    let stored = ts
        .service
        .store(
            StoreRequest::new("note with metadata")
                .with_type("note")
                .with_metadata_entry("project", Value::from("remanence"))
                .with_metadata_entry("priority", Value::from(2)),
        )
        .unwrap();
    let before = stored.memory.unwrap();

    let patch = json!({
        "metadata": { "priority": 5, "reviewed": true }
    });
    let patch = patch.as_object().unwrap().clone();
    let updated = ts
        .service
        .update_metadata(&before.content_hash, &patch)
        .unwrap();

    assert_eq!(updated.metadata.get("project"), Some(&Value::from("remanence")));
    assert_eq!(updated.metadata.get("priority"), Some(&Value::from(5)));
    assert_eq!(updated.metadata.get("reviewed"), Some(&Value::from(true)));
    assert_eq!(updated.created_at, before.created_at);
    assert!(updated.updated_at >= updated.created_at);

    // And again through a plain read
    let read_back = ts
        .service
        .get_by_hash(&before.content_hash)
        .unwrap()
        .unwrap();
    assert_eq!(read_back.metadata.get("reviewed"), Some(&Value::from(true)));
}

#[test]
fn empty_content_is_invalid_input() {
    let ts = TestService::open();
    let result = ts.service.store(StoreRequest::new("   \n  "));
    assert!(matches!(result, Err(StorageError::InvalidInput(_))));
}

#[test]
fn deleted_memory_never_comes_back_from_retrieve() {
    let ts = TestService::open();

    let stored = ts
        .service
        .store(StoreRequest::new("ephemeral fact about migratory birds"))
        .unwrap();
    let results = ts.service.retrieve("migratory birds", 5).unwrap();
    assert!(!results.is_empty());

    let outcome = ts.service.delete(&stored.content_hash).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.deleted, 1);

    let results = ts.service.retrieve("migratory birds", 5).unwrap();
    assert!(results
        .iter()
        .all(|r| r.memory.content_hash != stored.content_hash));

    // Deleting again reports nothing deleted
    let outcome = ts.service.delete(&stored.content_hash).unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.deleted, 0);

    // And the content can be stored fresh afterwards
    let again = ts
        .service
        .store(StoreRequest::new("ephemeral fact about migratory birds"))
        .unwrap();
    assert!(again.success);
}
