//! User and group identities emitted into ACLs and group definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A user or group identity qualified by a namespace.
///
/// Equality and hashing ignore case on both the name and the namespace,
/// matching how SharePoint compares account names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    User { name: String, namespace: String },
    Group { name: String, namespace: String },
}

impl Principal {
    /// Creates a user principal.
    pub fn user(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Principal::User {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Creates a group principal.
    pub fn group(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Principal::Group {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Principal::User { name, .. } | Principal::Group { name, .. } => name,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Principal::User { namespace, .. } | Principal::Group { namespace, .. } => namespace,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Principal::Group { .. })
    }
}

impl PartialEq for Principal {
    fn eq(&self, other: &Self) -> bool {
        self.is_group() == other.is_group()
            && self.name().to_lowercase() == other.name().to_lowercase()
            && self.namespace().to_lowercase() == other.namespace().to_lowercase()
    }
}

impl Eq for Principal {}

impl Hash for Principal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.is_group().hash(state);
        self.name().to_lowercase().hash(state);
        self.namespace().to_lowercase().hash(state);
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_group() { "group" } else { "user" };
        write!(f, "{kind}:{}@{}", self.name(), self.namespace())
    }
}
