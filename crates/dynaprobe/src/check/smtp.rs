use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Deserialize;

use super::{Check, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;
use crate::transport::{Conn, Reply};

const KIND: &str = "smtp";

const CLIENT_NAME: &str = "dynaprobe.local";

/// Fields of an SMTP definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct SmtpFields {
    /// (required)
    host: String,
    /// (required) envelope sender
    from: String,
    /// (required) envelope recipient
    to: String,
    /// (optional) authenticate with AUTH LOGIN when set
    username: String,
    password: Secret,
    subject: String,
    body: String,
    /// (optional, default=25)
    #[serde(deserialize_with = "de::port")]
    port: String,
    /// (optional, default=false) upgrade with STARTTLS
    encrypted: bool,
}

impl Default for SmtpFields {
    fn default() -> Self {
        Self {
            host: String::new(),
            from: String::new(),
            to: String::new(),
            username: String::new(),
            password: Secret::default(),
            subject: String::new(),
            body: String::new(),
            port: "25".to_string(),
            encrypted: false,
        }
    }
}

/// Delivers a message to an SMTP server
#[derive(Debug, Default)]
pub struct SmtpCheck {
    meta: CheckMeta,
    fields: SmtpFields,
}

fn expect(reply: Reply, codes: &[u16], step: &str) -> Result<Reply> {
    if codes.contains(&reply.code) {
        Ok(reply)
    } else {
        Err(anyhow!("{step} rejected : {} {}", reply.code, reply.text))
    }
}

/// Message text for DATA, dot-stuffed and without the terminating dot line
fn message(fields: &SmtpFields) -> String {
    let mut text = format!(
        "From: <{}>\r\nTo: <{}>\r\nSubject: {}\r\nDate: {}\r\n\r\n",
        fields.from,
        fields.to,
        fields.subject,
        Utc::now().to_rfc2822()
    );

    for line in fields.body.lines() {
        if line.starts_with('.') {
            text.push('.');
        }
        text.push_str(line);
        text.push_str("\r\n");
    }

    text
}

impl SmtpCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let host = &self.fields.host;

        let mut conn = Conn::connect(ctx, host, port, false)
            .await
            .map_err(|e| anyhow!("Could not connect to SMTP server {host} : {e}"))?;

        expect(conn.read_reply(ctx).await?, &[220], "Greeting")?;
        let mut ehlo = expect(conn.command(ctx, &format!("EHLO {CLIENT_NAME}")).await?, &[250], "EHLO")?;

        if self.fields.encrypted {
            expect(conn.command(ctx, "STARTTLS").await?, &[220], "STARTTLS")?;
            conn = conn.upgrade(ctx).await.map_err(|e| anyhow!("TLS session creation failed : {e}"))?;
            ehlo = expect(conn.command(ctx, &format!("EHLO {CLIENT_NAME}")).await?, &[250], "EHLO")?;
        }

        if !self.fields.username.is_empty() {
            if !ehlo.text.to_ascii_uppercase().contains("AUTH") {
                return Err(anyhow!("Server {host} does not offer authentication"));
            }
            let login = async {
                expect(conn.command(ctx, "AUTH LOGIN").await?, &[334], "AUTH LOGIN")?;
                expect(conn.command(ctx, &BASE64.encode(&self.fields.username)).await?, &[334], "Username")?;
                expect(conn.command(ctx, &BASE64.encode(self.fields.password.expose())).await?, &[235], "Password")
            };
            login
                .await
                .map_err(|e| anyhow!("Failed to login with user {} : {e}", self.fields.username))?;
        }

        expect(conn.command(ctx, &format!("MAIL FROM:<{}>", self.fields.from)).await?, &[250], "MAIL FROM")?;
        expect(conn.command(ctx, &format!("RCPT TO:<{}>", self.fields.to)).await?, &[250, 251], "RCPT TO")?;
        expect(conn.command(ctx, "DATA").await?, &[354], "DATA")?;

        conn.write_all(ctx, message(&self.fields).as_bytes()).await?;
        expect(conn.command(ctx, ".").await?, &[250], "Message")?;
        let _ = conn.command(ctx, "QUIT").await;

        Ok(format!("Sent mail from {} to {} via {host}", self.fields.from, self.fields.to))
    }
}

#[async_trait::async_trait]
impl Check for SmtpCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: SmtpFields = parse_fields(&self.meta, KIND, definition)?;

        require(
            &self.meta,
            KIND,
            &[
                ("Host", !fields.host.is_empty()),
                ("From", !fields.from.is_empty()),
                ("To", !fields.to.is_empty()),
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
    use crate::context::DEFAULT_CONNECT_TIMEOUT;
    use crate::transport::testing::line_server;
    use std::time::Duration;

    fn check(definition: &str) -> SmtpCheck {
        let mut check = SmtpCheck::default();
        check.init(CheckMeta::default(), definition).unwrap();
        check
    }

    fn ctx() -> RunContext {
        RunContext::standalone(Duration::from_secs(10), DEFAULT_CONNECT_TIMEOUT)
    }

    #[test]
    fn test_message_dot_stuffing() {
        let fields = SmtpFields {
            from: "a@example.com".to_string(),
            to: "b@example.com".to_string(),
            subject: "probe".to_string(),
            body: "hello\n.hidden\nbye".to_string(),
            ..SmtpFields::default()
        };

        let text = message(&fields);
        assert!(text.starts_with("From: <a@example.com>\r\nTo: <b@example.com>\r\nSubject: probe\r\n"));
        assert!(text.ends_with("\r\n\r\nhello\r\n..hidden\r\nbye\r\n"));
    }

    #[test]
    fn test_validation_order() {
        let mut check = SmtpCheck::default();
        let error = check.init(CheckMeta::default(), r#"{"Host": "mx", "To": "b@x"}"#).unwrap_err();
        assert!(matches!(error, DefinitionError::Validation(ref v) if v.field == "From"));
    }

    #[tokio::test]
    async fn test_delivery_with_auth() {
        let (port, server) = line_server(
            "220 mx ESMTP\r\n",
            vec![
                ("EHLO", "250-mx\r\n250 AUTH LOGIN PLAIN\r\n"),
                ("AUTH LOGIN", "334 VXNlcm5hbWU6\r\n"),
                ("YWxpY2U=", "334 UGFzc3dvcmQ6\r\n"),
                ("c2VjcmV0", "235 ok\r\n"),
                ("MAIL FROM:<alice@example.com>", "250 ok\r\n"),
                ("RCPT TO:<bob@example.com>", "250 ok\r\n"),
                ("DATA", "354 go ahead\r\n"),
                ("From: <alice@example.com>", ""),
                ("To:", ""),
                ("Subject: hi", ""),
                ("Date:", ""),
                ("\r\n", ""),
                ("body", ""),
                (".", "250 queued\r\n"),
                ("QUIT", "221 bye\r\n"),
            ],
        )
        .await;

        let check = check(&format!(
            r#"{{"Host": "127.0.0.1", "Port": {port}, "From": "alice@example.com", "To": "bob@example.com",
                "Username": "alice", "Password": "secret", "Subject": "hi", "Body": "body"}}"#
        ));
        let result = check.run(&ctx()).await;

        assert!(result.passed(), "{}", result.message);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_recipient() {
        let (port, _server) = line_server(
            "220 mx ESMTP\r\n",
            vec![
                ("EHLO", "250 mx\r\n"),
                ("MAIL FROM", "250 ok\r\n"),
                ("RCPT TO", "550 no such user\r\n"),
            ],
        )
        .await;

        let check = check(&format!(
            r#"{{"Host": "127.0.0.1", "Port": {port}, "From": "alice@example.com", "To": "nobody@example.com"}}"#
        ));
        let result = check.run(&ctx()).await;

        assert!(!result.passed());
        assert_eq!(result.message, "RCPT TO rejected : 550 no such user");
    }
}
