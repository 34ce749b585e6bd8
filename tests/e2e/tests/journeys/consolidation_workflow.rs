//! Journey: the consolidation pipeline
//!
//! Drives decay, association, clustering, compression, and forgetting
//! against real stores with a simulated clock, including the headline
//! guarantee: memories compressed into a summary are never forgotten
//! while that summary survives.

use remanence_core::{
    ConsolidationConfig, ConsolidationError, Consolidator, OpBudget, Phase, ScheduleConfig,
    Scheduler, StoreRequest, TagMode, Timestamp,
};
use remanence_e2e_tests::harness::TestService;
use serde_json::Value;

const DAY: f64 = 86_400.0;

/// Six near-duplicate memories about database indexing, one shared topic
/// word apart, so they embed into a tight cluster
fn seed_indexing_cluster(ts: &TestService) -> Vec<String> {
    let variants = [
        "dramatically",
        "significantly",
        "notably",
        "considerably",
        "markedly",
        "substantially",
    ];
    variants
        .iter()
        .map(|variant| {
            ts.service
                .store(
                    StoreRequest::new(format!(
                        "Database indexing with btree structures improves query lookup speed {variant}."
                    ))
                    .with_tags(["databases"]),
                )
                .unwrap()
                .content_hash
        })
        .collect()
}

#[test]
fn clustering_and_compression_produce_one_summary() {
    let ts = TestService::open();
    let members = seed_indexing_cluster(&ts);
    ts.service
        .store(StoreRequest::new("Weather forecast promises sunshine tomorrow afternoon."))
        .unwrap();

    let store = ts.service.store_handle().clone();
    let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default());
    let budget = OpBudget::unbounded();
    let now = Timestamp::now().epoch;

    let report = consolidator
        .run(&[Phase::Clustering, Phase::Compression], now, &budget)
        .unwrap();
    assert_eq!(report.phases.len(), 2);

    let clusters = store.clusters().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].theme, "databases");
    assert!(clusters[0].member_hashes.len() >= 5);

    let summaries = store.summaries().unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.memory_type.as_deref(), Some("summary"));
    assert!(summary.tags.iter().any(|t| t == "consolidation"));
    assert!(summary.tags.iter().any(|t| t == "cluster:databases"));
    assert!(summary.content.chars().count() <= 500);

    let sources = summary.source_hashes();
    for member in &members {
        assert!(sources.contains(member), "summary must reference {member}");
    }

    // Originals are untouched
    for member in &members {
        assert!(store.get_by_hash(member).unwrap().is_some());
    }
}

#[test]
fn compression_is_idempotent_for_an_unchanged_cluster() {
    let ts = TestService::open();
    seed_indexing_cluster(&ts);

    let store = ts.service.store_handle().clone();
    let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default());
    let budget = OpBudget::unbounded();
    let now = Timestamp::now().epoch;

    consolidator
        .run(&[Phase::Clustering, Phase::Compression], now, &budget)
        .unwrap();
    assert_eq!(store.summaries().unwrap().len(), 1);

    // Re-running both phases regenerates the cluster but not the summary
    consolidator
        .run(&[Phase::Clustering, Phase::Compression], now + 60.0, &budget)
        .unwrap();
    assert_eq!(store.summaries().unwrap().len(), 1);
}

#[test]
fn summary_sources_survive_forgetting_two_hundred_days_later() {
    let ts = TestService::open();
    let members = seed_indexing_cluster(&ts);
    let unrelated = ts
        .service
        .store(StoreRequest::new("Weather forecast promises sunshine tomorrow afternoon."))
        .unwrap();

    let store = ts.service.store_handle().clone();
    let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default());
    let budget = OpBudget::unbounded();
    let now = Timestamp::now().epoch;

    consolidator
        .run(&[Phase::Clustering, Phase::Compression], now, &budget)
        .unwrap();
    assert_eq!(store.summaries().unwrap().len(), 1);

    // Advance the simulated clock 200 days and run decay + forgetting
    let later = now + 200.0 * DAY;
    consolidator
        .run(&[Phase::Decay, Phase::Forgetting], later, &budget)
        .unwrap();

    // No summarized source was archived
    for member in &members {
        let memory = store.get_by_hash(member).unwrap().unwrap();
        assert!(
            !memory.is_archived(),
            "summary-referenced memory {member} must not be archived"
        );
    }

    // The unprotected, decayed memory was archived but retained
    let archived = store.get_by_hash(&unrelated.content_hash).unwrap().unwrap();
    assert!(archived.is_archived());
    assert!(archived.archived_at().is_some());

    // Archived memories drop out of semantic retrieval
    let hits = ts.service.retrieve("weather sunshine forecast", 5).unwrap();
    assert!(hits
        .iter()
        .all(|r| r.memory.content_hash != unrelated.content_hash));
}

#[test]
fn pinned_memories_are_exempt_from_decay_and_forgetting() {
    let ts = TestService::open();
    let pinned = ts
        .service
        .store(
            StoreRequest::new("pin this forever")
                .with_metadata_entry("pinned", Value::Bool(true)),
        )
        .unwrap();
    let plain = ts
        .service
        .store(StoreRequest::new("plain forgettable remark"))
        .unwrap();

    let store = ts.service.store_handle().clone();
    let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default());
    let budget = OpBudget::unbounded();
    let later = Timestamp::now().epoch + 200.0 * DAY;

    consolidator
        .run(&[Phase::Decay, Phase::Forgetting], later, &budget)
        .unwrap();

    let scores = store.decay_scores().unwrap();
    assert_eq!(scores.get(&pinned.content_hash), Some(&1.0));

    assert!(!store
        .get_by_hash(&pinned.content_hash)
        .unwrap()
        .unwrap()
        .is_archived());
    assert!(store
        .get_by_hash(&plain.content_hash)
        .unwrap()
        .unwrap()
        .is_archived());
}

#[test]
fn archived_memories_are_purged_after_the_grace_window() {
    let ts = TestService::open();
    let doomed = ts
        .service
        .store(StoreRequest::new("short lived operational detail"))
        .unwrap();

    let store = ts.service.store_handle().clone();
    let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default());
    let budget = OpBudget::unbounded();
    let t0 = Timestamp::now().epoch;

    // Archived at +200 days
    consolidator
        .run(&[Phase::Decay, Phase::Forgetting], t0 + 200.0 * DAY, &budget)
        .unwrap();
    assert!(store
        .get_by_hash(&doomed.content_hash)
        .unwrap()
        .unwrap()
        .is_archived());

    // Still inside the grace window at +300 days
    consolidator
        .run(&[Phase::Forgetting], t0 + 300.0 * DAY, &budget)
        .unwrap();
    assert!(store.get_by_hash(&doomed.content_hash).unwrap().is_some());

    // Hard-deleted past the 180-day grace
    consolidator
        .run(&[Phase::Forgetting], t0 + 390.0 * DAY, &budget)
        .unwrap();
    assert!(store.get_by_hash(&doomed.content_hash).unwrap().is_none());
}

#[test]
fn association_discovery_links_partially_overlapping_memories() {
    let ts = TestService::open();
    ts.service
        .store(StoreRequest::new("alpha beta gamma delta"))
        .unwrap();
    ts.service
        .store(StoreRequest::new("alpha beta epsilon zeta"))
        .unwrap();
    ts.service
        .store(StoreRequest::new("totally unrelated cooking recipe"))
        .unwrap();

    let store = ts.service.store_handle().clone();
    let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default());
    let budget = OpBudget::unbounded();
    let now = Timestamp::now().epoch;

    consolidator
        .run(&[Phase::Association], now, &budget)
        .unwrap();

    let associations = store.associations().unwrap();
    assert_eq!(associations.len(), 1);
    let pair = &associations[0];
    assert!(pair.source_hash < pair.target_hash, "pairs are lex-ordered");
    assert!(pair.similarity >= 0.3 && pair.similarity <= 0.7);

    // Re-running refreshes rather than duplicating
    consolidator
        .run(&[Phase::Association], now + 60.0, &budget)
        .unwrap();
    let associations = store.associations().unwrap();
    assert_eq!(associations.len(), 1);
    assert!(associations[0].discovered_at >= now + 60.0);
}

#[test]
fn scheduler_coalesces_lapsed_cadences_then_goes_quiet() {
    let ts = TestService::open();
    seed_indexing_cluster(&ts);

    let store = ts.service.store_handle().clone();
    let consolidator = Consolidator::new(store.clone(), ConsolidationConfig::default());
    let scheduler = Scheduler::new(store.clone(), ScheduleConfig::default());
    let budget = OpBudget::unbounded();

    // Fresh store: every cadence has lapsed, so one coalesced run fires
    let report = scheduler
        .tick_at(&consolidator, chrono::Local::now(), &budget)
        .unwrap();
    let report = report.expect("first tick must run");
    assert_eq!(report.phases.len(), 5);
    assert_eq!(report.phases[0].phase, Phase::Decay);
    assert_eq!(report.phases[4].phase, Phase::Forgetting);

    // Immediately afterwards nothing is due
    let second = scheduler
        .tick_at(&consolidator, chrono::Local::now(), &budget)
        .unwrap();
    assert!(second.is_none());
}

#[test]
fn consolidate_reports_already_running_when_lock_is_held() {
    let ts = TestService::open();
    let store = ts.service.store_handle().clone();

    // Simulate another process holding a fresh (non-stale) lock
    let token = format!("{}:other-process", Timestamp::now().epoch);
    assert!(store
        .try_insert_meta("consolidation.run_lock", &token)
        .unwrap());

    let err = ts.service.consolidate(None).unwrap_err();
    assert!(matches!(err, ConsolidationError::AlreadyRunning));

    // Releasing the lock lets the next run proceed
    store.delete_meta("consolidation.run_lock").unwrap();
    assert!(ts.service.consolidate(Some(Phase::Decay)).is_ok());
}

#[test]
fn invariants_hold_after_a_full_pipeline_run() {
    let ts = TestService::open();
    let members = seed_indexing_cluster(&ts);

    let report = ts.service.consolidate(None).unwrap();
    assert_eq!(report.phases.len(), 5);

    // Hash uniqueness and idempotent store still hold
    let duplicate = ts
        .service
        .store(
            StoreRequest::new(
                "Database indexing with btree structures improves query lookup speed dramatically."
            )
            .with_tags(["databases"]),
        )
        .unwrap();
    assert!(!duplicate.success);

    // Every member still present with consistent timestamps
    for member in &members {
        let memory = ts.service.get_by_hash(member).unwrap().unwrap();
        assert!(memory.created_at <= memory.updated_at);
    }

    // Tag search still sees the seeded tag set
    let tagged = ts
        .service
        .search_by_tag(&["databases".to_string()], TagMode::And)
        .unwrap();
    assert!(tagged.len() >= members.len());

    // The run was recorded as completed in the run history
    assert!(ts
        .service
        .store_handle()
        .get_meta("consolidation.last_run.decay")
        .unwrap()
        .is_some());
    let history = ts.service.consolidation_history(5).unwrap();
    assert!(!history.is_empty());
    assert_eq!(history[0].status, "completed");
    assert!(history[0].finished_at.is_some());
    assert!(history[0].phases_json.contains("forgetting"));
}
