use anyhow::{Result, anyhow, bail};
use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use serde::Deserialize;

use super::{Check, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;
use crate::transport::Conn;

const KIND: &str = "vnc";

const SECURITY_NONE: u8 = 1;
const SECURITY_VNC_AUTH: u8 = 2;

/// Fields of a VNC definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct VncFields {
    /// (required)
    host: String,
    /// (optional, default=5900)
    #[serde(deserialize_with = "de::port")]
    port: String,
    /// (required)
    password: Secret,
}

impl Default for VncFields {
    fn default() -> Self {
        Self { host: String::new(), port: "5900".to_string(), password: Secret::default() }
    }
}

/// Completes an RFB handshake and VNC authentication
#[derive(Debug, Default)]
pub struct VncCheck {
    meta: CheckMeta,
    fields: VncFields,
}

/// DES response to a VNC authentication challenge.
///
/// The password is truncated or zero padded to 8 bytes and each key byte is
/// bit-reversed before use.
fn challenge_response(password: &str, challenge: &[u8; 16]) -> Result<[u8; 16]> {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }

    let cipher = Des::new_from_slice(&key).map_err(|e| anyhow!("invalid DES key: {e}"))?;
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    Ok(response)
}

/// Minor protocol version from a `RFB 003.008\n` banner
fn minor_version(banner: &[u8; 12]) -> Result<u32> {
    let digits = &banner[8..11];
    if !banner.starts_with(b"RFB ") || banner[11] != b'\n' || !digits.iter().all(u8::is_ascii_digit) {
        bail!("malformed RFB banner {:?}", String::from_utf8_lossy(banner));
    }

    Ok(digits.iter().fold(0, |minor, digit| minor * 10 + u32::from(digit - b'0')))
}

async fn read_u32(conn: &mut Conn, ctx: &RunContext) -> Result<u32> {
    let mut buf = [0u8; 4];
    conn.read_exact(ctx, &mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

async fn read_reason(conn: &mut Conn, ctx: &RunContext) -> String {
    let Ok(len) = read_u32(conn, ctx).await else {
        return String::new();
    };
    let mut reason = vec![0u8; len.min(4096) as usize];
    match conn.read_exact(ctx, &mut reason).await {
        Ok(()) => String::from_utf8_lossy(&reason).into_owned(),
        Err(_) => String::new(),
    }
}

impl VncCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let host = &self.fields.host;

        let mut conn = Conn::connect(ctx, host, port, false)
            .await
            .map_err(|e| anyhow!("Could not connect to VNC server {host} : {e}"))?;

        let mut banner = [0u8; 12];
        conn.read_exact(ctx, &mut banner).await?;
        let minor = minor_version(&banner)?;

        let version: &[u8] = match minor {
            8.. => b"RFB 003.008\n",
            7 => b"RFB 003.007\n",
            _ => b"RFB 003.003\n",
        };
        conn.write_all(ctx, version).await?;

        let security = if minor >= 7 {
            let mut count = [0u8; 1];
            conn.read_exact(ctx, &mut count).await?;
            if count[0] == 0 {
                bail!("Server refused connection : {}", read_reason(&mut conn, ctx).await);
            }

            let mut offered = vec![0u8; count[0] as usize];
            conn.read_exact(ctx, &mut offered).await?;

            let chosen = [SECURITY_VNC_AUTH, SECURITY_NONE]
                .into_iter()
                .find(|kind| offered.contains(kind))
                .ok_or_else(|| anyhow!("No supported security type offered : {offered:?}"))?;
            conn.write_all(ctx, &[chosen]).await?;
            chosen
        } else {
            match read_u32(&mut conn, ctx).await? {
                0 => bail!("Server refused connection : {}", read_reason(&mut conn, ctx).await),
                kind @ (1 | 2) => kind as u8,
                other => bail!("Unsupported security type {other}"),
            }
        };

        if security == SECURITY_VNC_AUTH {
            let mut challenge = [0u8; 16];
            conn.read_exact(ctx, &mut challenge).await?;
            let response = challenge_response(self.fields.password.expose(), &challenge)?;
            conn.write_all(ctx, &response).await?;
        }

        // RFB 3.3 and 3.7 skip the result for security type None
        if (security == SECURITY_VNC_AUTH || minor >= 8) && read_u32(&mut conn, ctx).await? != 0 {
            let reason = if minor >= 8 { read_reason(&mut conn, ctx).await } else { String::new() };
            bail!("Authentication failed : {reason}");
        }

        Ok(format!("Authenticated to VNC server {host} (RFB 3.{minor})"))
    }
}

#[async_trait::async_trait]
impl Check for VncCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: VncFields = parse_fields(&self.meta, KIND, definition)?;

        require(
            &self.meta,
            KIND,
            &[("Host", !fields.host.is_empty()), ("Password", !fields.password.is_empty())],
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
