//! Access control lists as pushed to the index.
//!
//! ACLs form a tree through inheritance pointers: a document's ACL names a
//! parent document (optionally one of its named fragments) and a combination
//! mode decides how the parent's verdict and the child's verdict combine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{SharePointError, SharePointResult};
use crate::principal::Principal;

/// Named fragment holding site collection administrators.
pub const SITE_COLLECTION_ADMIN_FRAGMENT: &str = "admin";

/// Named fragment holding the read-security half of an item ACL.
pub const READ_SECURITY_FRAGMENT: &str = "readSecurity";

/// Canonical identifier of an indexable object, derived from its URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The virtual server document, which lists every site collection.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How a parent ACL combines with the ACLs that inherit from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceType {
    /// The child's verdict wins when it has one.
    #[default]
    ChildOverrides,
    /// The parent's verdict wins when it has one.
    ParentOverrides,
    /// Access requires a permit from both parent and child.
    AndBothPermit,
}

/// Pointer from an ACL to the ACL it inherits from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InheritFrom {
    pub doc_id: DocId,
    pub fragment: Option<String>,
}

impl fmt::Display for InheritFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fragment {
            Some(fragment) => write!(f, "{}#{}", self.doc_id, fragment),
            None => write!(f, "{}", self.doc_id),
        }
    }
}

/// Verdict for one principal at one level of an ACL chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzDecision {
    Permit,
    Deny,
    Indeterminate,
}

/// An access control list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acl {
    permits: Vec<Principal>,
    denies: Vec<Principal>,
    inherit_from: Option<InheritFrom>,
    inheritance_type: InheritanceType,
    case_insensitive: bool,
}

impl Acl {
    #[must_use]
    pub fn builder() -> AclBuilder {
        AclBuilder::default()
    }

    pub fn permits(&self) -> &[Principal] {
        &self.permits
    }

    pub fn denies(&self) -> &[Principal] {
        &self.denies
    }

    pub fn inherit_from(&self) -> Option<&InheritFrom> {
        self.inherit_from.as_ref()
    }

    pub fn inheritance_type(&self) -> InheritanceType {
        self.inheritance_type
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Verdict of this ACL alone, ignoring anything it inherits.
    #[must_use]
    pub fn local_decision(&self, principal: &Principal) -> AuthzDecision {
        if self.denies.iter().any(|p| self.matches(p, principal)) {
            AuthzDecision::Deny
        } else if self.permits.iter().any(|p| self.matches(p, principal)) {
            AuthzDecision::Permit
        } else {
            AuthzDecision::Indeterminate
        }
    }

    fn matches(&self, listed: &Principal, candidate: &Principal) -> bool {
        if self.case_insensitive {
            listed == candidate
        } else {
            listed.is_group() == candidate.is_group()
                && listed.name() == candidate.name()
                && listed.namespace() == candidate.namespace()
        }
    }
}

/// Builder for [`Acl`].
#[derive(Debug, Clone, Default)]
pub struct AclBuilder {
    permits: Vec<Principal>,
    denies: Vec<Principal>,
    inherit_from: Option<InheritFrom>,
    inheritance_type: InheritanceType,
    case_insensitive: bool,
}

impl AclBuilder {
    pub fn permits(mut self, permits: impl IntoIterator<Item = Principal>) -> Self {
        self.permits = permits.into_iter().collect();
        self
    }

    pub fn add_permit(mut self, principal: Principal) -> Self {
        self.permits.push(principal);
        self
    }

    pub fn denies(mut self, denies: impl IntoIterator<Item = Principal>) -> Self {
        self.denies = denies.into_iter().collect();
        self
    }

    pub fn inherit_from(mut self, doc_id: DocId) -> Self {
        self.inherit_from = Some(InheritFrom {
            doc_id,
            fragment: None,
        });
        self
    }

    pub fn inherit_from_fragment(mut self, doc_id: DocId, fragment: impl Into<String>) -> Self {
        self.inherit_from = Some(InheritFrom {
            doc_id,
            fragment: Some(fragment.into()),
        });
        self
    }

    pub fn inheritance_type(mut self, inheritance_type: InheritanceType) -> Self {
        self.inheritance_type = inheritance_type;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Acl {
        Acl {
            permits: self.permits,
            denies: self.denies,
            inherit_from: self.inherit_from,
            inheritance_type: self.inheritance_type,
            case_insensitive: self.case_insensitive,
        }
    }
}

/// Combines a chain of ACLs ordered from root to leaf into a final verdict.
///
/// Evaluation starts at the leaf; each ancestor then combines its own
/// verdict with the accumulated verdict of its descendants using its
/// inheritance type. Indeterminate at the end means deny.
#[must_use]
pub fn authorize(principal: &Principal, chain: &[&Acl]) -> AuthzDecision {
    let mut ancestors = chain.iter().rev();
    let Some(leaf) = ancestors.next() else {
        return AuthzDecision::Deny;
    };
    let mut decision = leaf.local_decision(principal);
    for acl in ancestors {
        decision = combine(acl.inheritance_type(), acl.local_decision(principal), decision);
    }
    match decision {
        AuthzDecision::Permit => AuthzDecision::Permit,
        _ => AuthzDecision::Deny,
    }
}

fn combine(
    parent_type: InheritanceType,
    parent: AuthzDecision,
    child: AuthzDecision,
) -> AuthzDecision {
    match parent_type {
        InheritanceType::ChildOverrides => {
            if child == AuthzDecision::Indeterminate {
                parent
            } else {
                child
            }
        }
        InheritanceType::ParentOverrides => {
            if parent == AuthzDecision::Indeterminate {
                child
            } else {
                parent
            }
        }
        InheritanceType::AndBothPermit => {
            if parent == AuthzDecision::Permit && child == AuthzDecision::Permit {
                AuthzDecision::Permit
            } else {
                AuthzDecision::Deny
            }
        }
    }
}

/// Key under which an ACL or named fragment is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AclKey {
    pub doc_id: DocId,
    pub fragment: Option<String>,
}

impl AclKey {
    pub fn document(doc_id: DocId) -> Self {
        Self {
            doc_id,
            fragment: None,
        }
    }

    pub fn fragment(doc_id: DocId, fragment: impl Into<String>) -> Self {
        Self {
            doc_id,
            fragment: Some(fragment.into()),
        }
    }
}

impl From<&InheritFrom> for AclKey {
    fn from(inherit: &InheritFrom) -> Self {
        Self {
            doc_id: inherit.doc_id.clone(),
            fragment: inherit.fragment.clone(),
        }
    }
}

/// Walks inheritance pointers from `leaf` up to the root of its tree.
///
/// Returns the chain ordered root first. Fails when a pointer dangles, when
/// a key repeats or when the chain is longer than `max_depth`.
pub fn collect_chain<'a>(
    store: &'a HashMap<AclKey, Acl>,
    leaf: &AclKey,
    max_depth: usize,
) -> SharePointResult<Vec<&'a Acl>> {
    let mut chain = Vec::new();
    let mut seen: Vec<AclKey> = Vec::new();
    let mut key = leaf.clone();
    loop {
        if seen.contains(&key) || chain.len() >= max_depth {
            return Err(SharePointError::AclChain(key.doc_id.to_string()));
        }
        let acl = store
            .get(&key)
            .ok_or_else(|| SharePointError::AclChain(key.doc_id.to_string()))?;
        chain.push(acl);
        seen.push(key);
        match acl.inherit_from() {
            Some(parent) => key = AclKey::from(parent),
            None => break,
        }
    }
    chain.reverse();
    Ok(chain)
}
