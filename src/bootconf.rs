//! Boot-time configuration handed to each machine.
//!
//! This is plain textual substitution, not a template engine. The harness
//! only fills in `$discovery` and `$name`; metadata placeholders such as
//! `$private_ipv4` and `$public_ipv4` are left for the guest to resolve.

use std::fmt;

/// Placeholder replaced with the cluster discovery token.
pub const DISCOVERY_TOKEN: &str = "$discovery";

/// Placeholder replaced with the per-instance name.
pub const NAME_TOKEN: &str = "$name";

/// A boot configuration document with substitutable placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserData {
    text: String,
}

impl UserData {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Returns `true` if `token` appears anywhere in the document.
    pub fn contains(&self, token: &str) -> bool {
        self.text.contains(token)
    }

    /// Returns a copy with every occurrence of `token` replaced by `value`.
    pub fn subst(&self, token: &str, value: &str) -> Self {
        Self {
            text: self.text.replace(token, value),
        }
    }

    /// Renders the document for one cluster member.
    pub fn render(&self, discovery: Option<&str>, name: &str) -> Self {
        let rendered = match discovery {
            Some(token) => self.subst(DISCOVERY_TOKEN, token),
            None => self.clone(),
        };
        rendered.subst(NAME_TOKEN, name)
    }
}

impl From<&str> for UserData {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for UserData {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl fmt::Display for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Label used for the `i`th machine of a cluster.
pub fn instance_name(i: usize) -> String {
    format!("instance{i}")
}
