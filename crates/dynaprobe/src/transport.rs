//! Bounded TCP conversations for the line-oriented protocol checks.
//!
//! Every read and write goes through [`RunContext::bounded`], so a silent
//! server costs at most one connection timeout per step and never outlives
//! the pass.

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::context::RunContext;

/// Largest response accepted while waiting for a marker
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Anything a [`Conn`] can talk over
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A numeric reply as used by SMTP and FTP, possibly spanning several lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn is(&self, code: u16) -> bool {
        self.code == code
    }
}

/// A client connection, plain or TLS
pub struct Conn {
    host: String,
    reader: BufReader<Box<dyn Stream>>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("host", &self.host).finish_non_exhaustive()
    }
}

impl Conn {
    /// Dial `host:port`, optionally wrapping the socket in TLS straight away
    pub async fn connect(ctx: &RunContext, host: &str, port: u16, tls: bool) -> Result<Self> {
        let tcp = ctx.bounded(TcpStream::connect((host, port))).await?;
        let conn = Self::from_stream(host, Box::new(tcp));

        if tls { conn.upgrade(ctx).await } else { Ok(conn) }
    }

    pub fn from_stream(host: &str, stream: Box<dyn Stream>) -> Self {
        Self { host: host.to_string(), reader: BufReader::new(stream) }
    }

    /// Perform a TLS handshake on the current connection (implicit TLS or STARTTLS)
    pub async fn upgrade(self, ctx: &RunContext) -> Result<Self> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .context("failed to build TLS connector")?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let host = self.host;
        let stream = self.reader.into_inner();
        let tls = ctx.bounded(connector.connect(&host, stream)).await?;

        Ok(Self { reader: BufReader::new(Box::new(tls)), host })
    }

    /// Read one line without its terminator
    pub async fn read_line(&mut self, ctx: &RunContext) -> Result<String> {
        let mut line = String::new();
        let read = ctx.bounded(self.reader.read_line(&mut line)).await?;
        if read == 0 {
            bail!("connection closed by {}", self.host);
        }

        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read a `NNN text` reply, following `NNN-` continuation lines
    pub async fn read_reply(&mut self, ctx: &RunContext) -> Result<Reply> {
        let first = self.read_line(ctx).await?;
        let code = reply_code(&first).ok_or_else(|| anyhow!("malformed reply: {first}"))?;
        let mut text = first.get(4..).unwrap_or_default().to_string();

        if first.as_bytes().get(3) == Some(&b'-') {
            let last = format!("{code} ");
            let more = format!("{code}-");
            loop {
                let line = self.read_line(ctx).await?;
                let done = line.starts_with(&last) || line == code.to_string();
                let body = line
                    .strip_prefix(&last)
                    .or_else(|| line.strip_prefix(&more))
                    .unwrap_or(&line);
                text.push('\n');
                text.push_str(body);
                if done {
                    break;
                }
            }
        }

        Ok(Reply { code, text })
    }

    /// Send a command and read its reply
    pub async fn command(&mut self, ctx: &RunContext, line: &str) -> Result<Reply> {
        self.write_line(ctx, line).await?;
        self.read_reply(ctx).await
    }

    /// Write a line terminated by CRLF
    pub async fn write_line(&mut self, ctx: &RunContext, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.write_all(ctx, &bytes).await
    }

    pub async fn write_all(&mut self, ctx: &RunContext, bytes: &[u8]) -> Result<()> {
        ctx.bounded(async {
            self.reader.write_all(bytes).await?;
            self.reader.flush().await
        })
        .await
    }

    pub async fn read_exact(&mut self, ctx: &RunContext, buf: &mut [u8]) -> Result<()> {
        ctx.bounded(self.reader.read_exact(buf)).await.map(|_| ())
    }

    /// Read everything until the peer closes the connection
    pub async fn read_to_end(&mut self, ctx: &RunContext) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        ctx.bounded(self.reader.read_to_end(&mut data)).await?;
        Ok(data)
    }

    /// Accumulate text until one of `markers` shows up; returns everything read
    pub async fn read_until_any(&mut self, ctx: &RunContext, markers: &[&str]) -> Result<String> {
        let mut collected = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            let read = ctx.bounded(self.reader.read(&mut chunk)).await?;
            if read == 0 {
                bail!("connection closed by {}", self.host);
            }
            collected.extend_from_slice(&chunk[..read]);

            let text = String::from_utf8_lossy(&collected);
            if markers.iter().any(|marker| text.contains(marker)) {
                return Ok(text.into_owned());
            }
            if collected.len() > MAX_RESPONSE_BYTES {
                bail!("response from {} exceeded {MAX_RESPONSE_BYTES} bytes", self.host);
            }
        }
    }
}

fn reply_code(line: &str) -> Option<u16> {
    let code = line.get(..3)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}
