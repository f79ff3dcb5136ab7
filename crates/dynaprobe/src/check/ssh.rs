use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use ssh2::{ExtendedData, Session};

use super::{Check, ContentMatch, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;

const KIND: &str = "ssh";

/// Fields of an SSH definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct SshFields {
    /// (required) host to log in to
    #[serde(rename = "IP")]
    ip: String,
    /// (required)
    username: String,
    /// (required)
    password: Secret,
    /// (required) command executed once logged in
    cmd: String,
    /// (optional, default=false) match the command output against `content_regex`
    match_content: bool,
    /// (optional, default=`.*`)
    content_regex: String,
    /// (optional, default=22)
    #[serde(deserialize_with = "de::port")]
    port: String,
}

impl Default for SshFields {
    fn default() -> Self {
        Self {
            ip: String::new(),
            username: String::new(),
            password: Secret::default(),
            cmd: String::new(),
            match_content: false,
            content_regex: ".*".to_string(),
            port: "22".to_string(),
        }
    }
}

/// Logs in with a password and runs a command
#[derive(Debug, Default)]
pub struct SshCheck {
    meta: CheckMeta,
    fields: SshFields,
}

impl SshCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let fields = self.fields.clone();
        let step_timeout = ctx.connect_timeout();

        // libssh2 is blocking; it enforces `step_timeout` on every socket operation
        let session = tokio::task::spawn_blocking(move || remote_exec(&fields, port, step_timeout));
        let output = ctx
            .until_deadline(async {
                match session.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(anyhow!("ssh task failed: {e}")),
                }
            })
            .await?;

        let matcher = ContentMatch::new(self.fields.match_content, &self.fields.content_regex);
        matcher.evaluate(&output)?;

        if matcher.enabled {
            Ok(format!("Command {} output matched {}", self.fields.cmd, self.fields.content_regex))
        } else {
            Ok(format!("Command {} executed successfully: {}", self.fields.cmd, output.trim_end()))
        }
    }
}

/// Dial, authenticate and run the command, returning stdout and stderr combined
fn remote_exec(fields: &SshFields, port: u16, step_timeout: Duration) -> Result<String> {
    let addr = (fields.ip.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| anyhow!("Error creating ssh client: {e}"))?
        .next()
        .ok_or_else(|| anyhow!("Error creating ssh client: no address for {}", fields.ip))?;

    let tcp = TcpStream::connect_timeout(&addr, step_timeout)
        .map_err(|e| anyhow!("Error creating ssh client: {e}"))?;

    let mut session = Session::new().map_err(|e| anyhow!("Error creating ssh client: {e}"))?;
    // zero would disable the timeout entirely
    session.set_timeout(step_timeout.as_millis().clamp(1, u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| anyhow!("Error creating ssh client: {e}"))?;

    session
        .userauth_password(&fields.username, fields.password.expose())
        .map_err(|e| anyhow!("Error creating ssh client: {e}"))?;
    if !session.authenticated() {
        bail!("Error creating ssh client: authentication failed for user {}", fields.username);
    }

    let mut channel =
        session.channel_session().map_err(|e| anyhow!("Error creating a ssh session: {e}"))?;
    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(|e| anyhow!("Error creating a ssh session: {e}"))?;

    channel.exec(&fields.cmd).map_err(|e| anyhow!("Error executing command: {e}"))?;

    let mut output = Vec::new();
    channel.read_to_end(&mut output).map_err(|e| anyhow!("Error executing command: {e}"))?;
    channel.wait_close().map_err(|e| anyhow!("Error executing command: {e}"))?;

    let status = channel.exit_status().map_err(|e| anyhow!("Error executing command: {e}"))?;
    if status != 0 {
        bail!("Error executing command: process exited with status {status}");
    }

    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[async_trait::async_trait]
impl Check for SshCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let mut fields: SshFields = parse_fields(&self.meta, KIND, definition)?;

        // Empty values rendered from templates take the defaults
        let defaults = SshFields::default();
        if fields.port.trim().is_empty() {
            fields.port = defaults.port;
        }
        if fields.content_regex.is_empty() {
            fields.content_regex = defaults.content_regex;
        }

        require(
            &self.meta,
            KIND,
            &[
                ("IP", !fields.ip.is_empty()),
                ("Username", !fields.username.is_empty()),
                ("Password", !fields.password.is_empty()),
                ("Cmd", !fields.cmd.is_empty()),
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
