use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::CheckEvent;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event sink closed")]
    Closed,

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write event: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for the events produced by a pass
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: CheckEvent) -> Result<(), PublishError>;
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<CheckEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CheckEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: CheckEvent) -> Result<(), PublishError> {
        self.tx.send(event).map_err(|_| PublishError::Closed)
    }
}
