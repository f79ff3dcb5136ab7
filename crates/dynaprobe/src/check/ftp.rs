use anyhow::{Result, anyhow, bail};
use serde::Deserialize;

use super::{Check, ContentMatch, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;
use crate::transport::{Conn, Reply};

const KIND: &str = "ftp";

/// Fields of an FTP definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct FtpFields {
    /// (required)
    host: String,
    /// (required)
    username: String,
    /// (required)
    password: Secret,
    /// (optional, default=21)
    #[serde(deserialize_with = "de::port")]
    port: String,
    /// (optional) file to download after login
    file: String,
    match_content: bool,
    content_regex: String,
}

impl Default for FtpFields {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: Secret::default(),
            port: "21".to_string(),
            file: String::new(),
            match_content: false,
            content_regex: ".*".to_string(),
        }
    }
}

/// Logs into an FTP server and optionally retrieves a file
#[derive(Debug, Default)]
pub struct FtpCheck {
    meta: CheckMeta,
    fields: FtpFields,
}

fn expect(reply: Reply, codes: &[u16], context: impl FnOnce() -> String) -> Result<Reply> {
    if codes.contains(&reply.code) {
        Ok(reply)
    } else {
        Err(anyhow!("{} : {} {}", context(), reply.code, reply.text))
    }
}

/// Data port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply
fn passive_port(text: &str) -> Result<u16> {
    let start = text.find('(').ok_or_else(|| anyhow!("malformed PASV reply: {text}"))?;
    let end = text[start..].find(')').map(|i| start + i).ok_or_else(|| anyhow!("malformed PASV reply: {text}"))?;

    let numbers = text[start + 1..end]
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("malformed PASV reply {text} : {e}"))?;

    match numbers.as_slice() {
        [_, _, _, _, high, low] => Ok(u16::from(*high) << 8 | u16::from(*low)),
        _ => bail!("malformed PASV reply: {text}"),
    }
}

impl FtpCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let host = &self.fields.host;

        let mut conn = Conn::connect(ctx, host, port, false)
            .await
            .map_err(|e| anyhow!("Could not connect to FTP server {host} : {e}"))?;

        expect(conn.read_reply(ctx).await?, &[220], || format!("Unexpected greeting from {host}"))?;

        let login_failed = || format!("Failed to login with user {}", self.fields.username);
        let user = conn.command(ctx, &format!("USER {}", self.fields.username)).await?;
        let user = expect(user, &[230, 331], login_failed)?;
        if user.is(331) {
            let pass = conn.command(ctx, &format!("PASS {}", self.fields.password.expose())).await?;
            expect(pass, &[230, 202], login_failed)?;
        }

        if self.fields.file.is_empty() {
            let _ = conn.command(ctx, "QUIT").await;
            return Ok(format!("Logged in to {host} as {}", self.fields.username));
        }

        let file = &self.fields.file;
        expect(conn.command(ctx, "TYPE I").await?, &[200], || "Could not switch to binary mode".to_string())?;

        let pasv = expect(conn.command(ctx, "PASV").await?, &[227], || "Passive mode refused".to_string())?;
        let data_port = passive_port(&pasv.text)?;

        // Data connection goes to the control host, not the advertised address
        let mut data = Conn::connect(ctx, host, data_port, false)
            .await
            .map_err(|e| anyhow!("Could not open data connection to {host}:{data_port} : {e}"))?;

        let retr = conn.command(ctx, &format!("RETR {file}")).await?;
        expect(retr, &[125, 150], || format!("Failed to retrieve file {file}"))?;

        let content = data.read_to_end(ctx).await?;
        drop(data);

        expect(conn.read_reply(ctx).await?, &[226, 250], || format!("Transfer of {file} did not complete"))?;
        let _ = conn.command(ctx, "QUIT").await;

        ContentMatch::new(self.fields.match_content, &self.fields.content_regex)
            .evaluate(&String::from_utf8_lossy(&content))?;

        Ok(format!("Retrieved {file} ({} bytes) from {host}", content.len()))
    }
}

#[async_trait::async_trait]
impl Check for FtpCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: FtpFields = parse_fields(&self.meta, KIND, definition)?;

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
