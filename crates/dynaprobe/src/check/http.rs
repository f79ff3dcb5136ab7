use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{Check, ContentMatch, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};

const KIND: &str = "http";

/// Fields of an HTTP definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct HttpFields {
    /// (optional, default=http) `http` or `https`
    scheme: String,
    /// (required)
    host: String,
    /// (optional, default=80 or 443 depending on the scheme)
    #[serde(deserialize_with = "de::port")]
    port: String,
    /// (optional, default=/) path and query
    path: String,
    /// (optional, default=GET)
    verb: String,
    headers: HashMap<String, String>,
    body: String,
    /// (optional, default=200) expected status code
    code: u16,
    /// (optional, default=false) skip certificate verification
    insecure: bool,
    match_content: bool,
    content_regex: String,
}

impl Default for HttpFields {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: String::new(),
            port: String::new(),
            path: "/".to_string(),
            verb: "GET".to_string(),
            headers: HashMap::new(),
            body: String::new(),
            code: 200,
            insecure: false,
            match_content: false,
            content_regex: ".*".to_string(),
        }
    }
}

impl HttpFields {
    fn url(&self) -> Result<Url> {
        let scheme = self.scheme.to_ascii_lowercase();
        let port = match (self.port.trim(), scheme.as_str()) {
            ("", "http") => 80,
            ("", "https") => 443,
            (_, "http" | "https") => parse_port(&self.port)?,
            (_, other) => bail!("Unsupported scheme {other}"),
        };

        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        Url::parse(&format!("{scheme}://{}:{port}{path}", self.host))
            .map_err(|e| anyhow!("Invalid URL for host {} : {e}", self.host))
    }
}

/// Sends one HTTP request and checks the status code and, optionally, the body
#[derive(Debug, Default)]
pub struct HttpCheck {
    meta: CheckMeta,
    fields: HttpFields,
}

impl HttpCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<(String, serde_json::Value)> {
        let url = self.fields.url()?;
        let method = Method::from_bytes(self.fields.verb.to_ascii_uppercase().as_bytes())
            .map_err(|e| anyhow!("Invalid HTTP verb {} : {e}", self.fields.verb))?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.fields.insecure)
            .connect_timeout(ctx.connect_timeout())
            .build()
            .context("failed to build HTTP client")?;

        let mut request = client.request(method.clone(), url.clone());
        for (name, value) in &self.fields.headers {
            request = request.header(name, value);
        }
        if !self.fields.body.is_empty() {
            request = request.body(self.fields.body.clone());
        }

        let start = Instant::now();
        let (status, body) = ctx
            .until_deadline(async {
                let response = request.send().await?;
                let status = response.status();
                let body = response.text().await?;
                Ok::<_, reqwest::Error>((status, body))
            })
            .await
            .map_err(|e| anyhow!("Error making request to {url} : {e}"))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        if status.as_u16() != self.fields.code {
            bail!(
                "Received status code {} from {url} (expected {})",
                status.as_u16(),
                self.fields.code
            );
        }

        ContentMatch::new(self.fields.match_content, &self.fields.content_regex).evaluate(&body)?;

        Ok((
            format!("{method} {url} returned {}", status.as_u16()),
            json!({ "status_code": status.as_u16(), "latency_ms": latency_ms }),
        ))
    }
}

#[async_trait::async_trait]
impl Check for HttpCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: HttpFields = parse_fields(&self.meta, KIND, definition)?;

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
