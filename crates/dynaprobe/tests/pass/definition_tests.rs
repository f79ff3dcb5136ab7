//! Tests for definitions that cannot become runnable checks

use std::collections::HashMap;
use std::time::Duration;

use dynaprobe::{CheckRegistry, CheckStatus};

use super::{definition, drain, scheduler};

#[tokio::test]
async fn test_unknown_type_yields_invalid_event() {
    let _ = tracing_subscriber::fmt::try_init();

    let definitions = vec![
        definition("good", "noop", "{}"),
        definition("mystery", "gopher", "{}"),
    ];
    let (scheduler, mut rx) = scheduler(CheckRegistry::default(), Duration::from_secs(10));

    let summary = scheduler.run_pass(&definitions).await;
    assert_eq!(summary.total, 2);
    assert_eq!(summary.invalid, 1);
    assert_eq!(summary.passed, 1);

    let events = drain(&mut rx);
    let mystery = events.iter().find(|event| event.id == "mystery").unwrap();
    assert_eq!(mystery.status, CheckStatus::Invalid);
    assert_eq!(mystery.check_type, "gopher");
    assert!(mystery.message.contains("unknown check type 'gopher'"));
}

#[tokio::test]
async fn test_missing_field_names_the_field() {
    let definitions = vec![definition("ssh-1", "ssh", r#"{"IP": "10.0.0.5", "Cmd": "id"}"#)];
    let (scheduler, mut rx) = scheduler(CheckRegistry::default(), Duration::from_secs(10));

    let summary = scheduler.run_pass(&definitions).await;
    assert_eq!(summary.invalid, 1);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, CheckStatus::Invalid);
    assert_eq!(events[0].message, "check ssh-1 (ssh) is missing required field Username");
}

#[tokio::test]
async fn test_render_fallback_still_runs() {
    // `{{missing}}` has no attribute, so the raw text is used as-is
    let mut noop = definition("fallback", "noop", r#"{"Static": "{{missing}}"}"#);
    noop.attributes = HashMap::from([("other".to_string(), "x".to_string())]);
    let (scheduler, mut rx) = scheduler(CheckRegistry::default(), Duration::from_secs(10));

    let summary = scheduler.run_pass(&[noop]).await;
    assert_eq!(summary.passed, 1);

    let events = drain(&mut rx);
    assert_eq!(events[0].message, "Static: {{missing}}, Dynamic: ");
}

#[tokio::test]
async fn test_malformed_payload_is_invalid() {
    let definitions = vec![definition("broken", "noop", "{not json")];
    let (scheduler, mut rx) = scheduler(CheckRegistry::default(), Duration::from_secs(10));

    scheduler.run_pass(&definitions).await;

    let events = drain(&mut rx);
    assert_eq!(events[0].status, CheckStatus::Invalid);
    assert!(events[0].message.starts_with("check broken (noop) has a malformed definition"));
}
