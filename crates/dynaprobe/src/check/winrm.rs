//! WinRM command execution over WS-Management.
//!
//! A run creates a remote `cmd` shell, starts the configured command, polls
//! its output streams until the command reports `Done`, then signals and
//! deletes the shell. Only Basic authentication is supported.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{Check, ContentMatch, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;

const KIND: &str = "winrm";

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Upper bound on Receive round trips for one command
const MAX_RECEIVES: usize = 64;

/// Suffix of the `State` attribute once a command has exited
const STATE_DONE: &str = "CommandState/Done";

/// Fields of a WinRM definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct WinRmFields {
    /// (required) IP or hostname of the Windows host
    host: String,
    /// (required)
    username: String,
    /// (required)
    password: Secret,
    /// (required) command executed in the remote shell
    cmd: String,
    /// (optional, default=true) use HTTPS
    encrypted: bool,
    /// (optional, default=false)
    match_content: bool,
    /// (optional, default=`.*`)
    content_regex: String,
    /// (optional, default=5986)
    #[serde(deserialize_with = "de::port")]
    port: String,
}

impl Default for WinRmFields {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: Secret::default(),
            cmd: String::new(),
            encrypted: true,
            match_content: false,
            content_regex: ".*".to_string(),
            port: "5986".to_string(),
        }
    }
}

/// Output collected from one remote command
#[derive(Debug, Default)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
}

/// Output stream a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamName {
    Stdout,
    Stderr,
}

/// Element whose text is being collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    ShellId,
    CommandId,
    Stream(StreamName),
    ExitCode,
    FaultText,
}

/// The parts of a WS-Management response the shell client reads
#[derive(Debug, Default, PartialEq)]
struct WsmanResponse {
    shell_id: Option<String>,
    command_id: Option<String>,
    /// Base64 chunks in document order
    streams: Vec<(StreamName, String)>,
    exit_code: Option<i64>,
    done: bool,
    fault: Option<String>,
}

impl WsmanResponse {
    fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut response = Self::default();
        let mut current = None;
        loop {
            match reader.read_event().context("malformed WS-Management response")? {
                Event::Start(element) => current = response.open(&element)?,
                Event::Empty(element) => {
                    response.open(&element)?;
                    current = None;
                }
                Event::Text(text) => {
                    if let Some(field) = current {
                        let text = text.unescape().context("malformed WS-Management response")?;
                        response.fill(field, text.trim());
                    }
                }
                Event::End(_) => current = None,
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(response)
    }

    fn open(&mut self, element: &BytesStart) -> Result<Option<Field>> {
        let field = match element.local_name().as_ref() {
            b"ShellId" => Some(Field::ShellId),
            b"CommandId" => Some(Field::CommandId),
            b"ExitCode" => Some(Field::ExitCode),
            b"Text" => Some(Field::FaultText),
            b"Stream" => match attribute(element, "Name")?.as_deref() {
                Some("stdout") => Some(Field::Stream(StreamName::Stdout)),
                Some("stderr") => Some(Field::Stream(StreamName::Stderr)),
                _ => None,
            },
            b"CommandState" => {
                if attribute(element, "State")?.is_some_and(|state| state.ends_with(STATE_DONE)) {
                    self.done = true;
                }
                None
            }
            _ => None,
        };
        Ok(field)
    }

    fn fill(&mut self, field: Field, text: &str) {
        match field {
            Field::ShellId => {
                self.shell_id.get_or_insert_with(|| text.to_string());
            }
            Field::CommandId => {
                self.command_id.get_or_insert_with(|| text.to_string());
            }
            Field::Stream(name) => self.streams.push((name, text.to_string())),
            Field::ExitCode => self.exit_code = text.parse().ok(),
            Field::FaultText => {
                self.fault.get_or_insert_with(|| text.to_string());
            }
        }
    }
}

fn attribute(element: &BytesStart, name: &str) -> Result<Option<String>> {
    match element.try_get_attribute(name).context("malformed attribute")? {
        Some(value) => Ok(Some(value.unescape_value().context("malformed attribute")?.into_owned())),
        None => Ok(None),
    }
}

/// Runs a command on a Windows host through WinRM
#[derive(Debug, Default)]
pub struct WinRmCheck {
    meta: CheckMeta,
    fields: WinRmFields,
}

impl WinRmCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let client = WsmanClient::new(&self.fields, port, ctx)?;

        let shell_id = client
            .create_shell(ctx)
            .await
            .map_err(|e| anyhow!("Login to WinRM host {} failed : {e}", self.fields.host))?;

        let output = client.run_command(ctx, &shell_id, &self.fields.cmd).await;

        if let Err(e) = client.delete_shell(ctx, &shell_id).await {
            debug!(host = %self.fields.host, "failed to delete WinRM shell: {e}");
        }

        let output =
            output.map_err(|e| anyhow!("Running command {} failed : {e}", self.fields.cmd))?;

        if !output.stderr.trim().is_empty() || output.exit_code.is_some_and(|code| code != 0) {
            bail!(
                "Executing command {} failed : {}",
                self.fields.cmd,
                output.stderr.trim_end()
            );
        }

        let matcher = ContentMatch::new(self.fields.match_content, &self.fields.content_regex);
        matcher.evaluate(&output.stdout)?;

        if matcher.enabled {
            Ok(format!("Command {} output matched {}", self.fields.cmd, self.fields.content_regex))
        } else {
            Ok(format!(
                "Command {} executed successfully: {}",
                self.fields.cmd,
                output.stdout.trim_end()
            ))
        }
    }
}

/// Minimal WS-Management client for the remote shell resource
struct WsmanClient<'a> {
    http: reqwest::Client,
    endpoint: String,
    fields: &'a WinRmFields,
}

impl<'a> WsmanClient<'a> {
    fn new(fields: &'a WinRmFields, port: u16, ctx: &RunContext) -> Result<Self> {
        let scheme = if fields.encrypted { "https" } else { "http" };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(ctx.connect_timeout())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { http, endpoint: format!("{scheme}://{}:{port}/wsman", fields.host), fields })
    }

    async fn create_shell(&self, ctx: &RunContext) -> Result<String> {
        let options = concat!(
            r#"<wsman:OptionSet><wsman:Option Name="WINRS_NOPROFILE">FALSE</wsman:Option>"#,
            r#"<wsman:Option Name="WINRS_CODEPAGE">65001</wsman:Option></wsman:OptionSet>"#
        );
        let body = concat!(
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>"
        );

        let response = self.send(ctx, ACTION_CREATE, None, options, body).await?;
        WsmanResponse::parse(&response)?
            .shell_id
            .ok_or_else(|| anyhow!("response did not contain a ShellId"))
    }

    async fn run_command(&self, ctx: &RunContext, shell_id: &str, cmd: &str) -> Result<CommandOutput> {
        let options = concat!(
            r#"<wsman:OptionSet><wsman:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</wsman:Option>"#,
            r#"<wsman:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</wsman:Option></wsman:OptionSet>"#
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(cmd)
        );

        let response = self.send(ctx, ACTION_COMMAND, Some(shell_id), options, &body).await?;
        let command_id = WsmanResponse::parse(&response)?
            .command_id
            .ok_or_else(|| anyhow!("response did not contain a CommandId"))?;

        let mut output = CommandOutput::default();
        let mut done = false;
        for _ in 0..MAX_RECEIVES {
            let body = format!(
                r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
            );
            let response = self.send(ctx, ACTION_RECEIVE, Some(shell_id), "", &body).await?;
            done = collect_streams(&response, &mut output)?;
            if done {
                break;
            }
        }

        let signal = format!(
            r#"<rsp:Signal CommandId="{command_id}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#
        );
        if let Err(e) = self.send(ctx, ACTION_SIGNAL, Some(shell_id), "", &signal).await {
            debug!("failed to signal WinRM command {command_id}: {e}");
        }

        if !done {
            bail!("command did not finish after {MAX_RECEIVES} receive requests");
        }
        Ok(output)
    }

    async fn delete_shell(&self, ctx: &RunContext, shell_id: &str) -> Result<()> {
        self.send(ctx, ACTION_DELETE, Some(shell_id), "", "").await.map(|_| ())
    }

    async fn send(
        &self,
        ctx: &RunContext,
        action: &str,
        shell_id: Option<&str>,
        options: &str,
        body: &str,
    ) -> Result<String> {
        let envelope = envelope(&self.endpoint, action, shell_id, options, body);

        let request = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.fields.username, Some(self.fields.password.expose()))
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(envelope)
            .send();

        let (status, text) = ctx
            .bounded(async {
                let response = request.await?;
                let status = response.status();
                let text = response.text().await?;
                Ok::<_, reqwest::Error>((status, text))
            })
            .await?;

        if !status.is_success() {
            let reason = WsmanResponse::parse(&text).ok().and_then(|response| response.fault).unwrap_or_default();
            bail!("HTTP {} {}", status.as_u16(), reason);
        }
        Ok(text)
    }
}

fn envelope(endpoint: &str, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
    let selector = shell_id
        .map(|id| {
            format!(
                r#"<wsman:SelectorSet><wsman:Selector Name="ShellId">{id}</wsman:Selector></wsman:SelectorSet>"#
            )
        })
        .unwrap_or_default();

    format!(
        concat!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
            r#"xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
            r#"xmlns:wsman="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
            r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
            "<s:Header>",
            "<wsa:To>{endpoint}</wsa:To>",
            r#"<wsa:ReplyTo><wsa:Address s:mustUnderstand="true">"#,
            "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
            "</wsa:Address></wsa:ReplyTo>",
            r#"<wsman:MaxEnvelopeSize s:mustUnderstand="true">153600</wsman:MaxEnvelopeSize>"#,
            "<wsa:MessageID>uuid:{message_id}</wsa:MessageID>",
            r#"<wsman:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
            "<wsman:OperationTimeout>PT20S</wsman:OperationTimeout>",
            r#"<wsman:ResourceURI s:mustUnderstand="true">{resource}</wsman:ResourceURI>"#,
            r#"<wsa:Action s:mustUnderstand="true">{action}</wsa:Action>"#,
            "{selector}{options}",
            "</s:Header>",
            "<s:Body>{body}</s:Body>",
            "</s:Envelope>"
        ),
        endpoint = endpoint,
        message_id = Uuid::new_v4().to_string().to_uppercase(),
        resource = RESOURCE_CMD,
        action = action,
        selector = selector,
        options = options,
        body = body,
    )
}

/// Append decoded stream chunks; returns whether the command has finished
fn collect_streams(response: &str, output: &mut CommandOutput) -> Result<bool> {
    let response = WsmanResponse::parse(response)?;

    for (name, encoded) in &response.streams {
        let decoded = STANDARD.decode(encoded).context("invalid base64 in output stream")?;
        let text = String::from_utf8_lossy(&decoded);

        match name {
            StreamName::Stdout => output.stdout.push_str(&text),
            StreamName::Stderr => output.stderr.push_str(&text),
        }
    }

    if response.exit_code.is_some() {
        output.exit_code = response.exit_code;
    }

    Ok(response.done)
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[async_trait::async_trait]
impl Check for WinRmCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: WinRmFields = parse_fields(&self.meta, KIND, definition)?;

        require(
            &self.meta,
            KIND,
            &[
                ("Host", !fields.host.is_empty()),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CheckMeta {
        CheckMeta { id: "win01".to_string(), ..CheckMeta::default() }
    }

    #[test]
    fn test_defaults_applied() {
        let mut check = WinRmCheck::default();
        check
            .init(meta(), r#"{"Host": "10.0.0.9", "Username": "Administrator", "Password": "pw", "Cmd": "hostname"}"#)
            .unwrap();

        assert_eq!(check.fields.port, "5986");
        assert!(check.fields.encrypted);
        assert_eq!(check.fields.content_regex, ".*");
    }

    #[test]
    fn test_validation_order() {
        let mut check = WinRmCheck::default();
        let error = check.init(meta(), r#"{"Host": "h", "Cmd": "dir"}"#).unwrap_err();
        assert!(matches!(error, DefinitionError::Validation(ref v) if v.field == "Username"));
    }

    #[test]
    fn test_collect_streams() {
        let response = concat!(
            r#"<rsp:ReceiveResponse>"#,
            r#"<rsp:Stream Name="stdout" CommandId="1">T0sNCg==</rsp:Stream>"#,
            r#"<rsp:Stream Name="stderr" CommandId="1" End="true"/>"#,
            r#"<rsp:CommandState CommandId="1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">"#,
            r#"<rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState>"#,
            r#"</rsp:ReceiveResponse>"#
        );

        let mut output = CommandOutput::default();
        let done = collect_streams(response, &mut output).unwrap();

        assert!(done);
        assert_eq!(output.stdout, "OK\r\n");
        assert!(output.stderr.is_empty());
        assert_eq!(output.exit_code, Some(0));
    }

    #[test]
    fn test_collect_streams_any_attribute_order() {
        let response = concat!(
            "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\" ",
            "xmlns:rsp=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell\"><s:Body>",
            "<rsp:ReceiveResponse>",
            "<rsp:Stream CommandId=\"1\" Name=\"stdout\">\n  T0s=\n</rsp:Stream>",
            "<rsp:Stream End=\"true\" CommandId=\"1\" Name=\"stdout\"></rsp:Stream>",
            "<rsp:CommandState State=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done\" CommandId=\"1\">",
            "<rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState>",
            "</rsp:ReceiveResponse></s:Body></s:Envelope>"
        );

        let mut output = CommandOutput::default();
        assert!(collect_streams(response, &mut output).unwrap());
        assert_eq!(output.stdout, "OK");
        assert_eq!(output.exit_code, Some(0));
    }

    #[test]
    fn test_collect_streams_rejects_malformed_xml() {
        let mut output = CommandOutput::default();
        assert!(collect_streams("<rsp:Stream Name=\"stdout\">YQ==</rsp:Other>", &mut output).is_err());
    }

    #[test]
    fn test_collect_streams_running() {
        let response = r#"<rsp:Stream Name="stdout" CommandId="1">YQ==</rsp:Stream><rsp:CommandState State="x/CommandState/Running"/>"#;

        let mut output = CommandOutput::default();
        assert!(!collect_streams(response, &mut output).unwrap());
        assert_eq!(output.stdout, "a");
    }

    #[test]
    fn test_envelope_carries_selector_and_escaped_body() {
        let body = format!("<rsp:Command>{}</rsp:Command>", xml_escape("echo a & b"));
        let xml = envelope("https://h:5986/wsman", ACTION_COMMAND, Some("ABC"), "", &body);

        assert!(xml.contains(r#"<wsman:Selector Name="ShellId">ABC</wsman:Selector>"#));
        assert!(xml.contains("echo a &amp; b"));
        assert!(xml.contains("<wsa:To>https://h:5986/wsman</wsa:To>"));
        assert!(xml.contains(ACTION_COMMAND));
    }

    #[test]
    fn test_response_ids() {
        let response = WsmanResponse::parse("<x:Shell><x:ShellId>11-22</x:ShellId></x:Shell>").unwrap();
        assert_eq!(response.shell_id.as_deref(), Some("11-22"));
        assert_eq!(response.command_id, None);

        let response = WsmanResponse::parse("<CommandResponse><CommandId>AB</CommandId></CommandResponse>").unwrap();
        assert_eq!(response.command_id.as_deref(), Some("AB"));
    }

    #[test]
    fn test_fault_text() {
        let response = concat!(
            "<s:Fault><s:Reason><s:Text xml:lang=\"en-US\">",
            "The user name or password is incorrect.</s:Text></s:Reason></s:Fault>"
        );
        assert_eq!(
            WsmanResponse::parse(response).unwrap().fault.as_deref(),
            Some("The user name or password is incorrect.")
        );
    }
}
