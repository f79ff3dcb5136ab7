use std::net::IpAddr;

use anyhow::{Result, anyhow, bail};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use serde::Deserialize;
use serde_json::json;

use super::{Check, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};

const KIND: &str = "dns";

/// Fields of a DNS definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct DnsFields {
    /// (required) IP address of the nameserver under test
    server: String,
    /// (required) name to resolve
    fqdn: String,
    /// (required) address the name must resolve to
    #[serde(rename = "ExpectedIP")]
    expected_ip: String,
    /// (optional, default=53)
    #[serde(deserialize_with = "de::port")]
    port: String,
}

impl Default for DnsFields {
    fn default() -> Self {
        Self {
            server: String::new(),
            fqdn: String::new(),
            expected_ip: String::new(),
            port: "53".to_string(),
        }
    }
}

/// Asks one nameserver for a name and compares the answer to the expected address
#[derive(Debug, Default)]
pub struct DnsCheck {
    meta: CheckMeta,
    fields: DnsFields,
}

impl DnsCheck {
    fn resolver(&self, ctx: &RunContext) -> Result<TokioAsyncResolver> {
        let server: IpAddr = self
            .fields
            .server
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid DNS server address {} : {e}", self.fields.server))?;
        let port = parse_port(&self.fields.port)?;

        let mut opts = ResolverOpts::default();
        opts.timeout = ctx.step_timeout();
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.use_hosts_file = false;

        let nameservers = NameServerConfigGroup::from_ips_clear(&[server], port, true);
        let config = ResolverConfig::from_parts(None, vec![], nameservers);

        Ok(TokioAsyncResolver::tokio(config, opts))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<(String, serde_json::Value)> {
        let resolver = self.resolver(ctx)?;
        let expected: IpAddr = self
            .fields
            .expected_ip
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid expected address {} : {e}", self.fields.expected_ip))?;

        let lookup = ctx
            .bounded(resolver.lookup_ip(self.fields.fqdn.as_str()))
            .await
            .map_err(|e| anyhow!("Error resolving {} with {} : {e}", self.fields.fqdn, self.fields.server))?;

        let answers: Vec<IpAddr> = lookup.iter().collect();
        let details = json!({ "answers": answers.iter().map(IpAddr::to_string).collect::<Vec<_>>() });

        if !answers.contains(&expected) {
            let got = answers.iter().map(IpAddr::to_string).collect::<Vec<_>>().join(", ");
            bail!("Incorrect address for {} : expected {expected}, got [{got}]", self.fields.fqdn);
        }

        Ok((format!("Resolved {} to {expected}", self.fields.fqdn), details))
    }
}

#[async_trait::async_trait]
impl Check for DnsCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: DnsFields = parse_fields(&self.meta, KIND, definition)?;

        require(
            &self.meta,
            KIND,
            &[
                ("Server", !fields.server.is_empty()),
                ("Fqdn", !fields.fqdn.is_empty()),
                ("ExpectedIP", !fields.expected_ip.is_empty()),
            ],
        )?;

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
