//! Whole-pass scenarios

mod definition_tests;
mod fanout_tests;
mod isolation_tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dynaprobe::{ChannelPublisher, CheckDefinition, CheckEvent, CheckRegistry, PassConfig, PassScheduler};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn definition(id: &str, check_type: &str, payload: &str) -> CheckDefinition {
    CheckDefinition {
        id: id.to_string(),
        name: format!("Check {id}"),
        group: "team1".to_string(),
        check_type: check_type.to_string(),
        score_weight: 1.0,
        attributes: HashMap::new(),
        definition: payload.to_string(),
    }
}

pub fn scheduler(registry: CheckRegistry, check_timeout: Duration) -> (PassScheduler, UnboundedReceiver<CheckEvent>) {
    let (publisher, rx) = ChannelPublisher::new();
    let config = PassConfig { check_timeout, ..PassConfig::default() };
    (PassScheduler::new(Arc::new(registry), Arc::new(publisher), config), rx)
}

pub fn drain(rx: &mut UnboundedReceiver<CheckEvent>) -> Vec<CheckEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
