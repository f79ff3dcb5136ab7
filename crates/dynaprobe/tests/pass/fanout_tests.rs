//! Tests for fan-out and fan-in over many checks

use std::collections::HashSet;
use std::time::Duration;

use dynaprobe::{CheckRegistry, CheckStatus, DefinitionStore};

use super::{definition, drain, scheduler};

#[tokio::test]
async fn test_one_event_per_definition() {
    let _ = tracing_subscriber::fmt::try_init();

    let definitions: Vec<_> = (0..25)
        .map(|i| definition(&format!("noop-{i}"), "noop", r#"{"Static": "x"}"#))
        .collect();
    let (scheduler, mut rx) = scheduler(CheckRegistry::default(), Duration::from_secs(10));

    let summary = scheduler.run_pass(&definitions).await;
    let events = drain(&mut rx);

    assert_eq!(summary.total, 25);
    assert_eq!(summary.published, 25);
    assert_eq!(events.len(), 25);

    let ids: HashSet<_> = events.iter().map(|event| event.id.as_str()).collect();
    assert_eq!(ids.len(), 25, "every definition reported exactly once");
    assert!(events.iter().all(|event| event.event_type == "dynaprobe" && event.passed));
}

#[tokio::test]
async fn test_thousand_noop_checks_drain_without_blocking() {
    let definitions: Vec<_> = (0..1000)
        .map(|i| definition(&format!("noop-{i}"), "noop", "{}"))
        .collect();
    let (scheduler, mut rx) = scheduler(CheckRegistry::default(), Duration::from_secs(10));

    let summary = tokio::time::timeout(Duration::from_secs(30), scheduler.run_pass(&definitions))
        .await
        .expect("pass should complete");

    assert_eq!(summary.total, 1000);
    assert_eq!(summary.passed, 1000);
    assert_eq!(drain(&mut rx).len(), 1000);
}

#[tokio::test]
async fn test_store_keeps_set_between_passes() {
    let store = DefinitionStore::new(vec![
        definition("a", "noop", "{}"),
        definition("b", "noop", "{}"),
    ]);
    let (scheduler, mut rx) = scheduler(CheckRegistry::default(), Duration::from_secs(10));

    let first = scheduler.run(&store).await;
    let second = scheduler.run(&store).await;

    assert_eq!(first.total, 2);
    assert_eq!(second.total, 2);
    assert_ne!(first.pass_id, second.pass_id);
    assert_eq!(store.len(), 2);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|event| event.status == CheckStatus::Passed));
}
