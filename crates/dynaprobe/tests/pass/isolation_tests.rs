//! Tests for keeping a misbehaving check from affecting the rest of the pass

use std::time::Duration;

use dynaprobe::{Check, CheckMeta, CheckRegistry, CheckResult, CheckStatus, DefinitionError, RunContext};

use super::{definition, drain, scheduler};

/// Never reports on its own
#[derive(Debug, Default)]
struct HangingCheck {
    meta: CheckMeta,
}

#[async_trait::async_trait]
impl Check for HangingCheck {
    fn kind(&self) -> &'static str {
        "hang"
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, _definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        Ok(())
    }

    async fn run(&self, _ctx: &RunContext) -> CheckResult {
        std::future::pending().await
    }
}

/// Waits for cancellation and reports how it ended
#[derive(Debug, Default)]
struct PatientCheck {
    meta: CheckMeta,
}

#[async_trait::async_trait]
impl Check for PatientCheck {
    fn kind(&self) -> &'static str {
        "patient"
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, _definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> CheckResult {
        let result = CheckResult::new(&self.meta, "patient");
        match ctx.until_deadline(std::future::pending::<Result<(), std::io::Error>>()).await {
            Ok(()) => result.success("unreachable"),
            Err(e) => result.failure(e.to_string()),
        }
    }
}

/// Panics partway through a run
#[derive(Debug, Default)]
struct PanickingCheck {
    meta: CheckMeta,
}

#[async_trait::async_trait]
impl Check for PanickingCheck {
    fn kind(&self) -> &'static str {
        "panic"
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, _definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        Ok(())
    }

    async fn run(&self, _ctx: &RunContext) -> CheckResult {
        tokio::task::yield_now().await;
        panic!("unexpected server reply");
    }
}

fn registry() -> CheckRegistry {
    let mut registry = CheckRegistry::default();
    registry
        .register("hang", || Box::new(HangingCheck::default()))
        .register("patient", || Box::new(PatientCheck::default()))
        .register("panic", || Box::new(PanickingCheck::default()));
    registry
}

#[tokio::test]
async fn test_hung_check_times_out_without_blocking_others() {
    let _ = tracing_subscriber::fmt::try_init();

    let definitions = vec![
        definition("ok-1", "noop", "{}"),
        definition("stuck", "hang", "{}"),
        definition("ok-2", "noop", "{}"),
    ];
    let (scheduler, mut rx) = scheduler(registry(), Duration::from_millis(200));

    let summary = tokio::time::timeout(Duration::from_secs(5), scheduler.run_pass(&definitions))
        .await
        .expect("pass should finish despite the hung check");

    assert_eq!(summary.total, 3);
    assert_eq!(summary.passed, 2);
    assert_eq!(summary.timed_out, 1);

    let events = drain(&mut rx);
    let stuck = events.iter().find(|event| event.id == "stuck").unwrap();
    assert_eq!(stuck.status, CheckStatus::TimedOut);
    assert!(!stuck.passed);
    assert_eq!(stuck.check_type, "hang");
    assert_eq!(stuck.group, "team1");
}

#[tokio::test]
async fn test_deadline_reaches_cooperative_check() {
    let definitions = vec![definition("waits", "patient", "{}")];
    let (scheduler, mut rx) = scheduler(registry(), Duration::from_millis(200));

    let summary = scheduler.run_pass(&definitions).await;
    assert_eq!(summary.total, 1);
    assert_eq!(summary.passed, 0);
    assert_eq!(drain(&mut rx).len(), 1);
}

#[tokio::test]
async fn test_panicking_check_still_reports() {
    let definitions = vec![
        definition("ok", "noop", "{}"),
        definition("broken", "panic", "{}"),
    ];
    let (scheduler, mut rx) = scheduler(registry(), Duration::from_secs(5));

    let summary = scheduler.run_pass(&definitions).await;
    assert_eq!(summary.total, definitions.len());
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.published, definitions.len());

    let events = drain(&mut rx);
    let broken = events.iter().find(|event| event.id == "broken").unwrap();
    assert_eq!(broken.status, CheckStatus::Failed);
    assert_eq!(broken.check_type, "panic");
    assert_eq!(broken.message, "Check panicked");
}
