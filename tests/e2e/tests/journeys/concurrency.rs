//! Journey: multiple clients, one database file
//!
//! WAL journaling plus busy-timeout retry lets several handles (standing
//! in for several processes) share a store. Writes committed by one
//! handle are visible to reads issued afterwards on another.

use std::sync::Arc;

use remanence_core::{StorageError, StoreConfig, StoreRequest};
use remanence_e2e_tests::harness::{TestEncoder, TestService, TEST_DIMENSION};

#[test]
fn write_on_one_handle_is_visible_on_another() {
    let ts = TestService::open();
    let second = ts.reopen();

    let stored = ts
        .service
        .store(StoreRequest::new("shared fact about tide tables"))
        .unwrap();

    // Read-after-write across handles
    let seen = second.get_by_hash(&stored.content_hash).unwrap();
    assert!(seen.is_some());

    let hits = second.retrieve("tide tables", 5).unwrap();
    assert_eq!(hits[0].memory.content_hash, stored.content_hash);

    // And the other direction
    second
        .store(StoreRequest::new("second handle contribution"))
        .unwrap();
    assert_eq!(ts.service.health().unwrap().total_memories, 2);
}

#[test]
fn duplicate_across_handles_is_still_a_duplicate() {
    let ts = TestService::open();
    let second = ts.reopen();

    let first = ts
        .service
        .store(StoreRequest::new("exactly one of these"))
        .unwrap();
    assert!(first.success);

    let dup = second
        .store(StoreRequest::new("exactly one of these"))
        .unwrap();
    assert!(!dup.success);
    assert_eq!(dup.reason.as_deref(), Some("duplicate"));
    assert_eq!(ts.service.health().unwrap().total_memories, 1);
}

#[test]
fn concurrent_writers_on_one_service() {
    let ts = TestService::open();
    let service = Arc::new(ts.service);

    let mut handles = Vec::new();
    for t in 0..4 {
        let service = Arc::clone(&service);
        handles.push(std::thread::spawn(move || {
            for i in 0..15 {
                service
                    .store(StoreRequest::new(format!("worker {t} item {i}")))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(service.health().unwrap().total_memories, 60);
}

#[test]
fn reopen_after_drop_preserves_a_consistent_store() {
    let ts = TestService::open();
    let hash = ts
        .service
        .store(
            StoreRequest::new("durable memory")
                .with_tags(["keep"])
                .with_type("reference"),
        )
        .unwrap()
        .content_hash;

    // Drop the first service entirely, then come back
    let second = ts.reopen();
    drop(ts.service);

    let memory = second.get_by_hash(&hash).unwrap().unwrap();
    assert_eq!(memory.content, "durable memory");
    assert_eq!(memory.tags, vec!["keep"]);
    assert_eq!(memory.memory_type.as_deref(), Some("reference"));
    assert!(memory.created_at <= memory.updated_at);

    let health = second.health().unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.total_memories, 1);
}

#[test]
fn mismatched_dimension_refuses_to_open_the_store() {
    let ts = TestService::open();
    let dir = ts.db_path.parent().unwrap().to_path_buf();

    let config = StoreConfig {
        data_dir: Some(dir),
        dimension: 128,
        ..StoreConfig::default()
    };
    let result = remanence_core::MemoryService::open(config, Arc::new(TestEncoder::new(128)));
    assert!(matches!(result, Err(StorageError::IncompatibleStore(_))));

    // The original handle keeps working
    assert!(ts.service.health().is_ok());
}

#[test]
fn mismatched_model_identifier_refuses_to_open_the_store() {
    struct RenamedEncoder(TestEncoder);
    impl remanence_core::Encoder for RenamedEncoder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, remanence_core::EncoderError> {
            self.0.embed(text)
        }
        fn dimension(&self) -> usize {
            self.0.dimension()
        }
        fn model_identifier(&self) -> String {
            "some-other-model-v9".to_string()
        }
    }

    let ts = TestService::open();
    let dir = ts.db_path.parent().unwrap().to_path_buf();

    let config = StoreConfig {
        data_dir: Some(dir),
        dimension: TEST_DIMENSION,
        ..StoreConfig::default()
    };
    let result = remanence_core::MemoryService::open(
        config,
        Arc::new(RenamedEncoder(TestEncoder::standard())),
    );
    assert!(matches!(result, Err(StorageError::IncompatibleStore(_))));
}
