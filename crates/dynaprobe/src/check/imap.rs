use anyhow::{Result, anyhow, bail};
use serde::Deserialize;

use super::{Check, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;
use crate::transport::Conn;

const KIND: &str = "imap";

/// Fields of an IMAP definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ImapFields {
    /// (required)
    host: String,
    /// (required)
    username: String,
    /// (required)
    password: Secret,
    /// (optional, default=143)
    #[serde(deserialize_with = "de::port")]
    port: String,
    /// (optional, default=false) implicit TLS from the first byte
    encrypted: bool,
}

impl Default for ImapFields {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: Secret::default(),
            port: "143".to_string(),
            encrypted: false,
        }
    }
}

/// Logs into an IMAP server with LOGIN
#[derive(Debug, Default)]
pub struct ImapCheck {
    meta: CheckMeta,
    fields: ImapFields,
}

/// IMAP quoted string
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Read untagged lines until the tagged completion for `tag` arrives
async fn tagged_response(conn: &mut Conn, ctx: &RunContext, tag: &str) -> Result<String> {
    let prefix = format!("{tag} ");
    loop {
        let line = conn.read_line(ctx).await?;
        if let Some(status) = line.strip_prefix(&prefix) {
            return Ok(status.to_string());
        }
    }
}

impl ImapCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let host = &self.fields.host;

        let mut conn = Conn::connect(ctx, host, port, self.fields.encrypted)
            .await
            .map_err(|e| anyhow!("Could not connect to IMAP server {host} : {e}"))?;

        let greeting = conn.read_line(ctx).await?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            bail!("Unexpected greeting from {host} : {greeting}");
        }

        conn.write_line(
            ctx,
            &format!("a1 LOGIN {} {}", quote(&self.fields.username), quote(self.fields.password.expose())),
        )
        .await?;

        let status = tagged_response(&mut conn, ctx, "a1").await?;
        if !status.starts_with("OK") {
            bail!("Failed to login with user {} : {status}", self.fields.username);
        }

        if conn.write_line(ctx, "a2 LOGOUT").await.is_ok() {
            let _ = tagged_response(&mut conn, ctx, "a2").await;
        }

        Ok(format!("Logged in to {host} as {}", self.fields.username))
    }
}

#[async_trait::async_trait]
impl Check for ImapCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: ImapFields = parse_fields(&self.meta, KIND, definition)?;

        require(
            &self.meta,
            KIND,
            &[
                ("Host", !fields.host.is_empty()),
                ("Username", !fields.username.is_empty()),
                ("Password", !fields.password.is_empty()),
            ],
        )?;

        self.fields = fields;
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> CheckResult {
        let result = CheckResult::new(&self.meta, KIND);

        match self.execute(ctx).await {
            Ok(message) => result.success(message),
            Err(e) => result.failure(e.to_string()),
        }
    }
}
