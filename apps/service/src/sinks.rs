use std::io::Write;
use std::sync::{Arc, Mutex};

use dynaprobe::{CheckEvent, PublishError, Publisher};
use tracing::info;

use crate::config::SinkKind;

/// Writes one JSON event per line
#[derive(Debug)]
pub struct JsonLinesPublisher<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesPublisher<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl<W: Write + Send> Publisher for JsonLinesPublisher<W> {
    async fn publish(&self, event: CheckEvent) -> Result<(), PublishError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }
}

/// Emits every event through tracing
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait::async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, event: CheckEvent) -> Result<(), PublishError> {
        let details = match &event.details {
            Some(details) => serde_json::to_string(details)?,
            None => String::new(),
        };

        info!(
            id = %event.id,
            group = %event.group,
            check_type = %event.check_type,
            status = %event.status,
            score_weight = event.score_weight,
            details = %details,
            "{}",
            event.message
        );
        Ok(())
    }
}

pub fn publisher(kind: SinkKind) -> Arc<dyn Publisher> {
    match kind {
        SinkKind::Stdout => Arc::new(JsonLinesPublisher::new(std::io::stdout())),
        SinkKind::Log => Arc::new(LogPublisher),
    }
}
