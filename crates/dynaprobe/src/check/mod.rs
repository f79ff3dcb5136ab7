/// Check variants - one module per probed protocol
///
/// Every variant:
/// - takes its identity from the definition record, never from the payload
/// - fills optional fields with defaults before the payload is parsed
/// - validates required fields in a fixed order and reports only the first gap
/// - returns exactly one result from `run`, whatever happens on the wire
pub mod dns;
pub mod ftp;
pub mod http;
pub mod icmp;
pub mod imap;
pub mod ldap;
pub mod noop;
pub mod smtp;
pub mod ssh;
pub mod vnc;
pub mod winrm;
pub mod xmpp;

pub use dns::DnsCheck;
pub use ftp::FtpCheck;
pub use http::HttpCheck;
pub use icmp::IcmpCheck;
pub use imap::ImapCheck;
pub use ldap::LdapCheck;
pub use noop::NoopCheck;
pub use smtp::SmtpCheck;
pub use ssh::SshCheck;
pub use vnc::VncCheck;
pub use winrm::WinRmCheck;
pub use xmpp::XmppCheck;

use std::fmt::Debug;

use anyhow::{Result, anyhow, bail};
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::context::RunContext;
use crate::error::{DefinitionError, ValidationError};
use crate::model::{CheckMeta, CheckResult};

/// Message reported when content matching is on and the output does not match
pub const CONTENT_NOT_FOUND: &str = "Matching content not found";

/// A unit of probing logic
#[async_trait::async_trait]
pub trait Check: Send + Sync + Debug {
    /// Variant tag, e.g. `ssh`
    fn kind(&self) -> &'static str;

    /// Identity fields set by [`Check::init`]
    fn meta(&self) -> &CheckMeta;

    /// Load identity and a rendered definition payload, then validate it
    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError>;

    /// Probe the target once and report the outcome
    async fn run(&self, ctx: &RunContext) -> CheckResult;
}

/// Parse a rendered payload into a variant's field set.
///
/// The field set's `Default` supplies the optional values, so anything the
/// payload leaves out keeps its default.
pub(crate) fn parse_fields<T: DeserializeOwned>(
    meta: &CheckMeta,
    kind: &str,
    definition: &str,
) -> Result<T, DefinitionError> {
    serde_json::from_str(definition).map_err(|source| DefinitionError::Parse {
        id: meta.id.clone(),
        check_type: kind.to_string(),
        source,
    })
}

/// Fail on the first required field that is absent, in the order given
pub(crate) fn require(
    meta: &CheckMeta,
    kind: &str,
    fields: &[(&'static str, bool)],
) -> Result<(), ValidationError> {
    match fields.iter().find(|(_, present)| !present) {
        Some((field, _)) => Err(ValidationError {
            id: meta.id.clone(),
            check_type: kind.to_string(),
            field: field.to_string(),
        }),
        None => Ok(()),
    }
}

pub(crate) fn parse_port(port: &str) -> Result<u16> {
    port.trim()
        .parse::<u16>()
        .map_err(|e| anyhow!("Failed to convert port '{port}' to int : {e}"))
}

/// Optional regular-expression match on a probe's output
#[derive(Debug, Clone, Copy)]
pub struct ContentMatch<'a> {
    pub enabled: bool,
    pub pattern: &'a str,
}

impl<'a> ContentMatch<'a> {
    pub fn new(enabled: bool, pattern: &'a str) -> Self {
        Self { enabled, pattern }
    }

    /// Check the output; disabled matching accepts anything
    pub fn evaluate(&self, output: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let regex = Regex::new(self.pattern)
            .map_err(|e| anyhow!("Error compiling regex string {} : {}", self.pattern, e))?;

        if !regex.is_match(output) {
            bail!(CONTENT_NOT_FOUND);
        }

        Ok(())
    }
}

/// Serde helpers shared by the field sets
pub(crate) mod de {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrNumber {
        Text(String),
        Number(u64),
    }

    /// Ports are written both as `"22"` and `22`
    pub fn port<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match TextOrNumber::deserialize(deserializer)? {
            TextOrNumber::Text(text) => text,
            TextOrNumber::Number(number) => number.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CheckMeta {
        CheckMeta { id: "c1".to_string(), ..CheckMeta::default() }
    }

    #[test]
    fn test_require_reports_first_gap_only() {
        let error = require(
            &meta(),
            "ssh",
            &[("IP", true), ("Username", false), ("Password", false)],
        )
        .unwrap_err();

        assert_eq!(error.field, "Username");
        assert_eq!(error.check_type, "ssh");
        assert_eq!(error.id, "c1");
    }

    #[test]
    fn test_require_accepts_complete_fields() {
        assert!(require(&meta(), "ssh", &[("IP", true), ("Cmd", true)]).is_ok());
    }

    #[test]
    fn test_content_match_disabled_accepts_anything() {
        let matcher = ContentMatch::new(false, "^OK$");
        assert!(matcher.evaluate("FAIL").is_ok());
        assert!(matcher.evaluate("").is_ok());
    }

    #[test]
    fn test_content_match_enabled() {
        let matcher = ContentMatch::new(true, "^OK$");
        assert!(matcher.evaluate("OK").is_ok());

        let error = matcher.evaluate("FAIL").unwrap_err();
        assert_eq!(error.to_string(), "Matching content not found");
    }

    #[test]
    fn test_content_match_bad_regex_is_failure() {
        let error = ContentMatch::new(true, "(unclosed").evaluate("anything").unwrap_err();
        assert!(error.to_string().starts_with("Error compiling regex string (unclosed"));
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("22").unwrap(), 22);
        assert_eq!(parse_port(" 5986 ").unwrap(), 5986);
        assert!(parse_port("ssh").is_err());
        assert!(parse_port("70000").is_err());
    }
}
