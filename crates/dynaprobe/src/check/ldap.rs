use anyhow::{Result, anyhow};
use ldap3::{LdapConnAsync, LdapConnSettings};
use serde::Deserialize;
use tracing::debug;

use super::{Check, de, parse_fields, parse_port, require};
use crate::context::RunContext;
use crate::error::DefinitionError;
use crate::model::{CheckMeta, CheckResult};
use crate::secret::Secret;

const KIND: &str = "ldap";

/// Fields of an LDAP definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct LdapFields {
    /// (required) bind user in DN syntax
    user: String,
    /// (required)
    password: Secret,
    /// (required) FQDN of the directory server
    fqdn: String,
    /// (optional, default=false) upgrade the connection with StartTLS
    ldaps: bool,
    /// (optional, default=389)
    #[serde(deserialize_with = "de::port")]
    port: String,
}

impl Default for LdapFields {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: Secret::default(),
            fqdn: String::new(),
            ldaps: false,
            port: "389".to_string(),
        }
    }
}

/// Dials a directory server and performs a simple bind
#[derive(Debug, Default)]
pub struct LdapCheck {
    meta: CheckMeta,
    fields: LdapFields,
}

impl LdapCheck {
    async fn execute(&self, ctx: &RunContext) -> Result<String> {
        let port = parse_port(&self.fields.port)?;
        let url = format!("ldap://{}:{}", self.fields.fqdn, port);

        let settings = LdapConnSettings::new()
            .set_conn_timeout(ctx.step_timeout())
            .set_starttls(self.fields.ldaps)
            .set_no_tls_verify(true);

        let (conn, mut ldap) = ctx
            .bounded(LdapConnAsync::with_settings(settings, &url))
            .await
            .map_err(|e| {
                if self.fields.ldaps {
                    anyhow!("TLS session creation failed : {e}")
                } else {
                    anyhow!("Could not dial server {} : {e}", self.fields.fqdn)
                }
            })?;

        let driver = tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                debug!("LDAP connection closed: {e}");
            }
        });

        let bind = ctx
            .bounded(async {
                ldap.with_timeout(ctx.step_timeout())
                    .simple_bind(&self.fields.user, self.fields.password.expose())
                    .await?
                    .success()
            })
            .await;

        let _ = ldap.unbind().await;
        driver.abort();

        bind.map_err(|e| anyhow!("Failed to login with user {} : {e}", self.fields.user))?;

        Ok(format!("Bound to {} as {}", self.fields.fqdn, self.fields.user))
    }
}

#[async_trait::async_trait]
impl Check for LdapCheck {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn meta(&self) -> &CheckMeta {
        &self.meta
    }

    fn init(&mut self, meta: CheckMeta, definition: &str) -> Result<(), DefinitionError> {
        self.meta = meta;
        let fields: LdapFields = parse_fields(&self.meta, KIND, definition)?;

        require(
            &self.meta,
            KIND,
            &[
                ("User", !fields.user.is_empty()),
                ("Password", !fields.password.is_empty()),
                ("Fqdn", !fields.fqdn.is_empty()),
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
