use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

/// Default bound on a single connect/authenticate/execute step
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-task execution context handed to [`crate::Check::run`]
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Instant,
    connect_timeout: Duration,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, deadline: Instant, connect_timeout: Duration) -> Self {
        Self { cancel, deadline, connect_timeout }
    }

    /// A context with its own token, for running a check outside a pass
    pub fn standalone(pass_timeout: Duration, connect_timeout: Duration) -> Self {
        Self::new(CancellationToken::new(), Instant::now() + pass_timeout, connect_timeout)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Time left until the pass deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// The bound applied to the next network step
    pub fn step_timeout(&self) -> Duration {
        self.connect_timeout.min(self.remaining())
    }

    /// Run one network step, giving up on cancellation or after [`Self::step_timeout`]
    pub async fn bounded<T, E, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.race(self.step_timeout(), future).await
    }

    /// Run an operation that bounds its own steps, giving up on cancellation
    /// or when the pass deadline is reached
    pub async fn until_deadline<T, E, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.race(self.remaining(), future).await
    }

    async fn race<T, E, F>(&self, limit: Duration, future: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(anyhow!("cancelled: pass deadline reached")),
            outcome = timeout(limit, future) => match outcome {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(anyhow!("timed out after {} ms", limit.as_millis())),
            },
        }
    }
}
