/// Pass scheduler - runs every definition once, concurrently, and publishes the results
///
/// A pass goes through: render and instantiate, fan out one task per check,
/// wait for every task, drain the result channel into the publisher.
mod store;
mod summary;

pub use store::DefinitionStore;
pub use summary::PassSummary;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::check::Check;
use crate::context::{DEFAULT_CONNECT_TIMEOUT, RunContext};
use crate::model::{CheckDefinition, CheckEvent, CheckResult};
use crate::registry::CheckRegistry;
use crate::render::render;
use crate::sink::Publisher;

/// Event type used when none is configured
pub const DEFAULT_EVENT_TYPE: &str = "dynaprobe";

/// Timing and labelling for a pass
#[derive(Debug, Clone)]
pub struct PassConfig {
    /// Deadline for each check, measured from its launch
    pub check_timeout: Duration,
    /// Bound on each network step inside a check
    pub connect_timeout: Duration,
    /// `type` field of every published event
    pub event_type: String,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(10),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_type: DEFAULT_EVENT_TYPE.to_string(),
        }
    }
}

/// Runs passes over a definition set
pub struct PassScheduler {
    registry: Arc<CheckRegistry>,
    publisher: Arc<dyn Publisher>,
    config: PassConfig,
    shutdown: CancellationToken,
}

impl PassScheduler {
    pub fn new(registry: Arc<CheckRegistry>, publisher: Arc<dyn Publisher>, config: PassConfig) -> Self {
        Self { registry, publisher, config, shutdown: CancellationToken::new() }
    }

    /// Cancel in-flight checks when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    /// Run one pass over the store's current set; the set stays in the store
    pub async fn run(&self, store: &DefinitionStore) -> PassSummary {
        let definitions = store.borrow();
        self.run_pass(&definitions).await
    }

    /// Run every definition once and publish exactly one event per definition
    pub async fn run_pass(&self, definitions: &[CheckDefinition]) -> PassSummary {
        let mut summary = PassSummary::new(Uuid::new_v4(), Utc::now());
        let start = Instant::now();
        info!(pass_id = %summary.pass_id, checks = definitions.len(), "Starting checks");

        // One slot per definition, so no task ever waits on the drain
        let (tx, mut rx) = mpsc::channel(definitions.len().max(1));
        let tracker = TaskTracker::new();
        let pass_token = self.shutdown.child_token();

        for definition in definitions {
            let rendered = render(&definition.definition, &definition.attributes);
            if let Some(reason) = &rendered.fallback {
                debug!(id = %definition.id, "Could not render definition, using raw text: {reason}");
            }

            let check = match self.registry.instantiate(definition, &rendered.text) {
                Ok(check) => check,
                Err(e) => {
                    warn!(id = %definition.id, check_type = %definition.check_type, "{e}");
                    let result = CheckResult::new(&definition.meta(), &definition.check_type).invalid(e.to_string());
                    if tx.send(result).await.is_err() {
                        error!("Result channel closed during pass {}", summary.pass_id);
                    }
                    continue;
                }
            };

            let token = pass_token.child_token();
            let ctx = RunContext::new(token.clone(), Instant::now() + self.config.check_timeout, self.config.connect_timeout);
            let limit = self.config.check_timeout;
            let tx = tx.clone();

            tracker.spawn(async move {
                let _guard = token.drop_guard();
                let meta = check.meta().clone();
                let kind = check.kind();

                // Separate task so a panic still yields a result
                let worker = tokio::spawn(async move { run_check(check, &ctx, limit).await });
                let result = match worker.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(id = %meta.id, check_type = kind, "Check task failed: {e}");
                        let reason = if e.is_panic() { "Check panicked" } else { "Check was cancelled" };
                        CheckResult::new(&meta, kind).failure(reason)
                    }
                };
                let _ = tx.send(result).await;
            });
        }

        drop(tx);
        tracker.close();
        tracker.wait().await;

        while let Some(result) = rx.recv().await {
            summary.record(result.status);
            debug!(
                id = %result.id,
                check_type = %result.check_type,
                status = %result.status,
                "{}",
                result.message
            );

            match self.publisher.publish(CheckEvent::from_result(&self.config.event_type, result)).await {
                Ok(()) => summary.published += 1,
                Err(e) => error!("Failed to publish check result: {e}"),
            }
        }

        summary.elapsed = start.elapsed();
        info!(
            pass_id = %summary.pass_id,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Checks started at {} have finished: {summary}",
            summary.started_at
        );

        summary
    }
}

/// Run a check under its deadline; expiry produces a timed-out result
async fn run_check(check: Box<dyn Check>, ctx: &RunContext, limit: Duration) -> CheckResult {
    let started_at = Utc::now();

    match timeout(limit, check.run(ctx)).await {
        Ok(result) => result,
        Err(_) => {
            ctx.cancellation().cancel();
            let mut result = CheckResult::new(check.meta(), check.kind())
                .timed_out(format!("Check did not finish within {} ms", limit.as_millis()));
            result.timestamp = started_at;
            result
        }
    }
}
