use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Deserialize;

use super::{Check, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;
use crate::transport::Conn;

const KIND: &str = "xmpp";

const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

const FEATURES_END: [&str; 4] = ["</stream:features>", "<stream:features/>", "</stream:stream>", "<stream:error"];

/// Fields of an XMPP definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmppFields {
    /// (required)
    host: String,
    /// (required) bare JID, `user@domain`
    username: String,
    /// (required)
    password: Secret,
    /// (optional, default=5222)
    #[serde(deserialize_with = "de::port")]
    port: String,
    /// (optional, default=true) require STARTTLS before authenticating
    encrypted: bool,
}

impl Default for XmppFields {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: Secret::default(),
            port: "5222".to_string(),
            encrypted: true,
        }
    }
}

/// Opens a client stream and authenticates with SASL PLAIN
#[derive(Debug, Default)]
pub struct XmppCheck {
    meta: CheckMeta,
    fields: XmppFields,
}

/// Split a JID into its local part and domain, falling back to `host` for the domain
fn split_jid<'a>(jid: &'a str, host: &'a str) -> (&'a str, &'a str) {
    let bare = jid.split('/').next().unwrap_or(jid);
    match bare.split_once('@') {
        Some((local, domain)) => (local, domain),
        None => (bare, host),
    }
}

/// What a `<stream:features>` block offers
#[derive(Debug, Default, PartialEq)]
struct StreamFeatures {
    starttls: bool,
    mechanisms: Vec<String>,
}

impl StreamFeatures {
    /// Parse the stream header and features; the stream element itself stays open
    fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut features = Self::default();
        let mut in_mechanism = false;
        loop {
            match reader.read_event().context("malformed stream features")? {
                Event::Start(element) => {
                    let name = element.local_name();
                    in_mechanism = name.as_ref() == b"mechanism";
                    features.starttls |= name.as_ref() == b"starttls";
                }
                Event::Empty(element) => match element.local_name().as_ref() {
                    b"starttls" => features.starttls = true,
                    b"features" => break,
                    _ => {}
                },
                Event::Text(text) if in_mechanism => {
                    let mechanism = text.unescape().context("malformed stream features")?;
                    features.mechanisms.push(mechanism.trim().to_string());
                }
                Event::End(element) => {
                    in_mechanism = false;
                    if element.local_name().as_ref() == b"features" {
                        break;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(features)
    }

    fn offers(&self, mechanism: &str) -> bool {
        self.mechanisms.iter().any(|offered| offered.eq_ignore_ascii_case(mechanism))
    }
}

fn plain_auth(local: &str, password: &str) -> String {
    BASE64.encode(format!("\0{local}\0{password}"))
}

async fn open_stream(conn: &mut Conn, ctx: &RunContext, domain: &str) -> Result<StreamFeatures> {
    conn.write_all(
        ctx,
        format!(
            "<?xml version='1.0'?><stream:stream to='{domain}' version='1.0' xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams'>"
        )
        .as_bytes(),
    )
    .await?;

    let features = conn.read_until_any(ctx, &FEATURES_END).await?;
    if features.contains("<stream:error") {
        bail!("Stream error from server : {features}");
    }

    StreamFeatures::parse(&features)
}

impl XmppCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let host = &self.fields.host;
        let (local, domain) = split_jid(&self.fields.username, host);

        let mut conn = Conn::connect(ctx, host, port, false)
            .await
            .map_err(|e| anyhow!("Could not connect to XMPP server {host} : {e}"))?;

        let mut features = open_stream(&mut conn, ctx, domain).await?;

        if self.fields.encrypted {
            if !features.starttls {
                bail!("Server {host} does not offer STARTTLS");
            }
            conn.write_all(ctx, format!("<starttls xmlns='{NS_TLS}'/>").as_bytes()).await?;
            let answer = conn.read_until_any(ctx, &["<proceed", "<failure"]).await?;
            if !answer.contains("<proceed") {
                bail!("Server {host} refused STARTTLS");
            }

            conn = conn.upgrade(ctx).await.map_err(|e| anyhow!("TLS session creation failed : {e}"))?;
            features = open_stream(&mut conn, ctx, domain).await?;
        }

        if !features.offers("PLAIN") {
            bail!("Server {host} does not offer SASL PLAIN");
        }

        let auth = plain_auth(local, self.fields.password.expose());
        conn.write_all(ctx, format!("<auth xmlns='{NS_SASL}' mechanism='PLAIN'>{auth}</auth>").as_bytes())
            .await?;

        let answer = conn.read_until_any(ctx, &["<success", "<failure"]).await?;
        if !answer.contains("<success") {
            bail!("Failed to login with user {}", self.fields.username);
        }

        let _ = conn.write_all(ctx, b"</stream:stream>").await;

        Ok(format!("Authenticated to {domain} as {}", self.fields.username))
    }
}

#[async_trait::async_trait]
impl Check for XmppCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: XmppFields = parse_fields(&self.meta, KIND, definition)?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DEFAULT_CONNECT_TIMEOUT;
    use crate::transport::testing::serve_once;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const FEATURES: &str = "<?xml version='1.0'?><stream:stream from='chat.local' version='1.0' \
        xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'><stream:features>\
        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
        </stream:features>";

    async fn read_until(stream: &mut tokio::net::TcpStream, marker: &str) -> String {
        let mut collected = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&collected).contains(marker) {
            let read = stream.read(&mut chunk).await.unwrap();
            assert!(read > 0, "client closed before {marker}");
            collected.extend_from_slice(&chunk[..read]);
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[test]
    fn test_split_jid() {
        assert_eq!(split_jid("alice@chat.local", "10.0.0.5"), ("alice", "chat.local"));
        assert_eq!(split_jid("alice@chat.local/probe", "10.0.0.5"), ("alice", "chat.local"));
        assert_eq!(split_jid("alice", "10.0.0.5"), ("alice", "10.0.0.5"));
    }

    #[test]
    fn test_features_parsed_as_xml() {
        let features = StreamFeatures::parse(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' version='1.0'><stream:features>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             <sasl:mechanisms xmlns:sasl='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <sasl:mechanism>SCRAM-SHA-1</sasl:mechanism><sasl:mechanism>\n  PLAIN\n</sasl:mechanism>\
             </sasl:mechanisms></stream:features>",
        )
        .unwrap();

        assert!(features.starttls);
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
        assert!(features.offers("PLAIN"));
    }

    #[test]
    fn test_empty_features() {
        let features = StreamFeatures::parse(
            "<stream:stream xmlns:stream='http://etherx.jabber.org/streams'><stream:features/>",
        )
        .unwrap();

        assert_eq!(features, StreamFeatures::default());
        assert!(!features.offers("PLAIN"));
    }

    #[test]
    fn test_plain_auth() {
        assert_eq!(plain_auth("alice", "pw"), BASE64.encode(b"\0alice\0pw"));
    }

    #[test]
    fn test_encrypted_by_default() {
        let mut check = XmppCheck::default();
        check
            .init(CheckMeta::default(), r#"{"Host": "chat", "Username": "a@chat", "Password": "pw"}"#)
            .unwrap();
        assert!(check.fields.encrypted);
        assert_eq!(check.fields.port, "5222");
    }

    #[tokio::test]
    async fn test_plain_sasl_success() {
        let (port, server) = serve_once(|mut stream| async move {
            let open = read_until(&mut stream, "/streams'>").await;
            assert!(open.contains("to='chat.local'"));
            stream.write_all(FEATURES.as_bytes()).await.unwrap();

            let auth = read_until(&mut stream, "</auth>").await;
            assert!(auth.contains(&plain_auth("alice", "pw")));
            stream.write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await.unwrap();
        })
        .await;

        let mut check = XmppCheck::default();
        check
            .init(
                CheckMeta::default(),
                &format!(
                    r#"{{"Host": "127.0.0.1", "Port": {port}, "Username": "alice@chat.local", "Password": "pw", "Encrypted": false}}"#
                ),
            )
            .unwrap();

        let ctx = RunContext::standalone(Duration::from_secs(10), DEFAULT_CONNECT_TIMEOUT);
        let result = check.run(&ctx).await;

        assert!(result.passed(), "{}", result.message);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_starttls_fails() {
        let (port, _server) = serve_once(|mut stream| async move {
            read_until(&mut stream, "/streams'>").await;
            stream.write_all(FEATURES.as_bytes()).await.unwrap();
        })
        .await;

        let mut check = XmppCheck::default();
        check
            .init(
                CheckMeta::default(),
                &format!(r#"{{"Host": "127.0.0.1", "Port": {port}, "Username": "alice@chat.local", "Password": "pw"}}"#),
            )
            .unwrap();

        let ctx = RunContext::standalone(Duration::from_secs(10), DEFAULT_CONNECT_TIMEOUT);
        let result = check.run(&ctx).await;

        assert!(!result.passed());
        assert_eq!(result.message, "Server 127.0.0.1 does not offer STARTTLS");
    }
}
