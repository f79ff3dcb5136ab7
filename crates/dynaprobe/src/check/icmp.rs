use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Check, parse_fields, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};

const KIND: &str = "icmp";

const PAYLOAD: [u8; 56] = [0; 56];

/// Fields of an ICMP definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct IcmpFields {
    /// (required)
    host: String,
    /// (optional, default=1) echo requests to send
    count: u32,
    /// (optional, default=false) pass with some replies missing
    allow_packet_loss: bool,
    /// (optional, default=100) loss percentage that still passes, exclusive
    percent: u32,
}

impl Default for IcmpFields {
    fn default() -> Self {
        Self { host: String::new(), count: 1, allow_packet_loss: false, percent: 100 }
    }
}

/// Pings a host and compares the observed packet loss to the allowed amount
#[derive(Debug, Default)]
pub struct IcmpCheck {
    meta: CheckMeta,
    fields: IcmpFields,
}

/// Outcome of the echo requests sent during one run
#[derive(Debug, Clone, Copy, PartialEq)]
struct Loss {
    sent: u32,
    received: u32,
}

impl Loss {
    fn percent(&self) -> u32 {
        if self.sent == 0 {
            return 0;
        }
        (self.sent - self.received) * 100 / self.sent
    }

    fn acceptable(&self, allow_loss: bool, limit: u32) -> bool {
        self.received == self.sent || (allow_loss && self.received > 0 && self.percent() < limit)
    }
}

/// Send up to `count` echo requests, stopping early once the run is cancelled.
/// Only requests actually sent count towards the loss.
async fn send_echoes<F, Fut, E>(ctx: &RunContext, count: u32, mut echo: F) -> (Loss, Vec<Duration>, Option<anyhow::Error>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Duration, E>>,
    E: Into<anyhow::Error>,
{
    let mut loss = Loss { sent: 0, received: 0 };
    let mut rtts = Vec::new();
    let mut last_error = None;

    for seq in 0..count.max(1) {
        loss.sent += 1;
        match ctx.bounded(echo()).await {
            Ok(rtt) => {
                loss.received += 1;
                rtts.push(rtt);
            }
            Err(e) => {
                debug!("echo request {seq} failed: {e}");
                last_error = Some(e);
            }
        }
        if ctx.is_cancelled() {
            break;
        }
    }

    (loss, rtts, last_error)
}

impl IcmpCheck {
    async fn resolve(&self, ctx: &RunContext) -> Result<IpAddr> {
        if let Ok(ip) = self.fields.host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let mut addrs = ctx
            .bounded(tokio::net::lookup_host((self.fields.host.as_str(), 0)))
            .await
            .map_err(|e| anyhow!("Could not resolve host {} : {e}", self.fields.host))?;

        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| anyhow!("Could not resolve host {}", self.fields.host))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<(String, serde_json::Value)> {
        let ip = self.resolve(ctx).await?;
        let (loss, rtts, last_error) = send_echoes(ctx, self.fields.count, move || async move {
            surge_ping::ping(ip, &PAYLOAD).await.map(|(_, rtt)| rtt)
        })
        .await;

        let details = json!({
            "sent": loss.sent,
            "received": loss.received,
            "loss_percent": loss.percent(),
            "rtt_ms": rtts.iter().map(|rtt| rtt.as_secs_f64() * 1000.0).collect::<Vec<_>>(),
        });

        if !loss.acceptable(self.fields.allow_packet_loss, self.fields.percent) {
            match (loss.received, last_error) {
                (0, Some(e)) => bail!("Error pinging host {} : {e}", self.fields.host),
                _ => bail!(
                    "Packet loss of {}% to {} ({} of {} replies)",
                    loss.percent(),
                    self.fields.host,
                    loss.received,
                    loss.sent
                ),
            }
        }

        Ok((
            format!("Received {} of {} replies from {}", loss.received, loss.sent, self.fields.host),
            details,
        ))
    }
}

#[async_trait::async_trait]
impl Check for IcmpCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: IcmpFields = parse_fields(&self.meta, KIND, definition)?;

        require(&self.meta, KIND, &[("Host", !fields.host.is_empty())])?;

        self.fields = fields;
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> CheckResult {
        let result = CheckResult::new(&self.meta, KIND);

        match self.execute(ctx).await {
            Ok((message, details)) => result.success(message).with_details(details),
            Err(e) => result.failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let mut check = IcmpCheck::default();
        check.init(CheckMeta::default(), r#"{"Host": "10.0.0.1"}"#).unwrap();

        assert_eq!(check.fields.count, 1);
        assert_eq!(check.fields.percent, 100);
        assert!(!check.fields.allow_packet_loss);
    }

    #[test]
    fn test_host_required() {
        let mut check = IcmpCheck::default();
        let error = check.init(CheckMeta::default(), r#"{"Count": 3}"#).unwrap_err();
        assert!(matches!(error, DefinitionError::Validation(ref v) if v.field == "Host"));
    }

    #[test]
    fn test_loss_rules() {
        let all = Loss { sent: 4, received: 4 };
        assert!(all.acceptable(false, 100));

        let half = Loss { sent: 4, received: 2 };
        assert_eq!(half.percent(), 50);
        assert!(!half.acceptable(false, 100));
        assert!(half.acceptable(true, 75));
        assert!(!half.acceptable(true, 50));

        let none = Loss { sent: 4, received: 0 };
        assert!(!none.acceptable(true, 100));
    }

    #[tokio::test]
    async fn test_cancelled_run_counts_only_sent_requests() {
        let ctx = RunContext::standalone(Duration::from_secs(10), Duration::from_secs(1));
        let token = ctx.cancellation().clone();
        let mut calls = 0;

        let (loss, rtts, last_error) = send_echoes(&ctx, 5, || {
            calls += 1;
            let reply = if calls == 1 {
                Ok(Duration::from_millis(3))
            } else {
                token.cancel();
                Err(anyhow!("no reply"))
            };
            async move { reply }
        })
        .await;

        assert_eq!(calls, 2);
        assert_eq!(loss, Loss { sent: 2, received: 1 });
        assert_eq!(loss.percent(), 50);
        assert_eq!(rtts, vec![Duration::from_millis(3)]);
        assert!(last_error.is_some());
    }

    #[tokio::test]
    async fn test_all_requests_sent_when_not_cancelled() {
        let ctx = RunContext::standalone(Duration::from_secs(10), Duration::from_secs(1));

        let (loss, rtts, last_error) =
            send_echoes(&ctx, 3, || async { Ok::<_, anyhow::Error>(Duration::from_millis(1)) }).await;

        assert_eq!(loss, Loss { sent: 3, received: 3 });
        assert_eq!(rtts.len(), 3);
        assert!(last_error.is_none());
    }
}
