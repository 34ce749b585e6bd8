//! Journey: structured retrieval by tag set and time window

use remanence_core::{StoreRequest, TagMode};
use remanence_e2e_tests::harness::{backdate_days, TestService};

#[test]
fn tag_and_or_semantics() {
    let ts = TestService::open();

    let m1 = ts
        .service
        .store(StoreRequest::new("m1").with_tags(["a", "b"]))
        .unwrap();
    let m2 = ts
        .service
        .store(StoreRequest::new("m2").with_tags(["b", "c"]))
        .unwrap();
    let m3 = ts
        .service
        .store(StoreRequest::new("m3").with_tags(["c"]))
        .unwrap();

    let and_b = ts
        .service
        .search_by_tag(&["b".to_string()], TagMode::And)
        .unwrap();
    let hashes: Vec<&str> = and_b.iter().map(|m| m.content_hash.as_str()).collect();
    assert_eq!(hashes.len(), 2);
    assert!(hashes.contains(&m1.content_hash.as_str()));
    assert!(hashes.contains(&m2.content_hash.as_str()));

    let or_ac = ts
        .service
        .search_by_tag(&["a".to_string(), "c".to_string()], TagMode::Or)
        .unwrap();
    assert_eq!(or_ac.len(), 3);
    assert!(or_ac.iter().any(|m| m.content_hash == m3.content_hash));

    let and_ac = ts
        .service
        .search_by_tag(&["a".to_string(), "c".to_string()], TagMode::And)
        .unwrap();
    assert!(and_ac.is_empty());
}

#[test]
fn tag_matching_is_case_sensitive_and_trimmed() {
    let ts = TestService::open();
    ts.service
        .store(StoreRequest::new("m").with_tags(["  Geo  "]))
        .unwrap();

    let exact = ts
        .service
        .search_by_tag(&["Geo".to_string()], TagMode::And)
        .unwrap();
    assert_eq!(exact.len(), 1);

    let wrong_case = ts
        .service
        .search_by_tag(&["geo".to_string()], TagMode::And)
        .unwrap();
    assert!(wrong_case.is_empty());
}

#[test]
fn time_recall_windows() {
    let ts = TestService::open();

    let today = ts
        .service
        .store(StoreRequest::new("written today"))
        .unwrap();
    let yesterday = ts
        .service
        .store(StoreRequest::new("written yesterday"))
        .unwrap();
    let old = ts
        .service
        .store(StoreRequest::new("written ten days ago"))
        .unwrap();

    backdate_days(&ts.db_path, &yesterday.content_hash, 1.0);
    backdate_days(&ts.db_path, &old.content_hash, 10.0);

    // "last week" is a trailing 7-day window: today and yesterday are in,
    // the ten-day-old memory is out
    let last_week = ts.service.recall_by_time("last week", None).unwrap();
    let hashes: Vec<&str> = last_week.iter().map(|m| m.content_hash.as_str()).collect();
    assert!(hashes.contains(&today.content_hash.as_str()));
    assert!(hashes.contains(&yesterday.content_hash.as_str()));
    assert!(!hashes.contains(&old.content_hash.as_str()));

    // "yesterday" returns exactly the backdated-one-day memory
    let y = ts.service.recall_by_time("yesterday", None).unwrap();
    assert_eq!(y.len(), 1);
    assert_eq!(y[0].content_hash, yesterday.content_hash);

    // "today" excludes it
    let t = ts.service.recall_by_time("today", None).unwrap();
    let hashes: Vec<&str> = t.iter().map(|m| m.content_hash.as_str()).collect();
    assert!(hashes.contains(&today.content_hash.as_str()));
    assert!(!hashes.contains(&yesterday.content_hash.as_str()));
}

#[test]
fn time_recall_is_newest_first_and_limited() {
    let ts = TestService::open();
    ts.service.store(StoreRequest::new("first")).unwrap();
    ts.service.store(StoreRequest::new("second")).unwrap();
    ts.service.store(StoreRequest::new("third")).unwrap();

    let all = ts.service.recall_by_time("today", None).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].content, "third");
    assert_eq!(all[2].content, "first");

    let limited = ts.service.recall_by_time("today", Some(2)).unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].content, "third");
}

#[test]
fn absolute_date_range_recall() {
    let ts = TestService::open();
    let kept = ts.service.store(StoreRequest::new("recent note")).unwrap();

    let old = ts.service.store(StoreRequest::new("ancient note")).unwrap();
    backdate_days(&ts.db_path, &old.content_hash, 400.0);

    let today = chrono::Local::now().date_naive();
    let start = today - chrono::Duration::days(30);
    let expression = format!("{start}..{today}");

    let hits = ts.service.recall_by_time(&expression, None).unwrap();
    let hashes: Vec<&str> = hits.iter().map(|m| m.content_hash.as_str()).collect();
    assert!(hashes.contains(&kept.content_hash.as_str()));
    assert!(!hashes.contains(&old.content_hash.as_str()));
}
