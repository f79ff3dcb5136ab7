use std::collections::HashMap;
use std::fmt;

use crate::check::{
    Check, DnsCheck, FtpCheck, HttpCheck, IcmpCheck, ImapCheck, LdapCheck, NoopCheck, SmtpCheck, SshCheck, VncCheck,
    WinRmCheck, XmppCheck,
};
use crate::error::DefinitionError;
use crate::model::CheckDefinition;

/// Builds an empty check of one variant
pub type Constructor = fn() -> Box<dyn Check>;

fn new_boxed<C: Check + Default + 'static>() -> Box<dyn Check> {
    Box::new(C::default())
}

/// Maps type tags to check constructors
#[derive(Clone)]
pub struct CheckRegistry {
    constructors: HashMap<String, Constructor>,
}

impl CheckRegistry {
    /// A registry with no variants at all
    pub fn empty() -> Self {
        Self { constructors: HashMap::new() }
    }

    /// Add a variant, replacing any constructor already registered under `kind`
    pub fn register(&mut self, kind: impl Into<String>, constructor: Constructor) -> &mut Self {
        self.constructors.insert(kind.into(), constructor);
        self
    }

    /// Registered type tags, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Resolve the definition's variant and initialize it with the rendered payload
    pub fn instantiate(&self, definition: &CheckDefinition, rendered: &str) -> Result<Box<dyn Check>, DefinitionError> {
        let constructor = self
            .constructors
            .get(&definition.check_type)
            .ok_or_else(|| DefinitionError::UnknownType {
                id: definition.id.clone(),
                check_type: definition.check_type.clone(),
            })?;

        let mut check = constructor();
        check.init(definition.meta(), rendered)?;
        Ok(check)
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register("noop", new_boxed::<NoopCheck>)
            .register("http", new_boxed::<HttpCheck>)
            .register("icmp", new_boxed::<IcmpCheck>)
            .register("ssh", new_boxed::<SshCheck>)
            .register("dns", new_boxed::<DnsCheck>)
            .register("ftp", new_boxed::<FtpCheck>)
            .register("ldap", new_boxed::<LdapCheck>)
            .register("vnc", new_boxed::<VncCheck>)
            .register("imap", new_boxed::<ImapCheck>)
            .register("smtp", new_boxed::<SmtpCheck>)
            .register("winrm", new_boxed::<WinRmCheck>)
            .register("xmpp", new_boxed::<XmppCheck>);
        registry
    }
}

impl fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRegistry").field("kinds", &self.kinds()).finish()
    }
}
