//! Remote object shapes returned by the SharePoint content services.
//!
//! These are the decoded forms of the SiteData, UserGroup and People
//! responses: only the fields the connector reads are kept.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A (member id, permission mask) pair from an object's ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub member_id: i32,
    pub mask: u64,
}

impl PermissionGrant {
    pub fn new(member_id: i32, mask: u64) -> Self {
        Self { member_id, mask }
    }
}

/// Web application policy entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUser {
    pub login_name: String,
    pub grant_mask: u64,
    pub deny_mask: u64,
}

/// The web application: content databases plus its policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualServer {
    pub url: String,
    pub content_database_ids: Vec<String>,
    pub policy: Vec<PolicyUser>,
    pub anonymous_deny_mask: u64,
}

/// A content database and the site collections it holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentDatabase {
    pub id: String,
    pub change_id: String,
    pub site_urls: Vec<String>,
}

/// A user as listed on a web or inside a group roster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDescription {
    pub id: i32,
    pub name: String,
    pub login_name: String,
    pub is_domain_group: bool,
    pub is_site_admin: bool,
}

/// A SharePoint group and its members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteGroup {
    pub id: i32,
    pub name: String,
    pub users: Vec<UserDescription>,
}

/// A site collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub url: String,
    pub change_id: String,
    pub groups: Vec<SiteGroup>,
}

/// A web (site or sub-site) with its ACL and children.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Web {
    pub url: String,
    pub title: String,
    pub scope_id: String,
    pub no_index: bool,
    pub allow_anonymous_access: bool,
    pub anonymous_view_list_items: bool,
    pub anonymous_permission_mask: u64,
    pub users: Vec<UserDescription>,
    pub permissions: Vec<PermissionGrant>,
    pub child_web_urls: Vec<String>,
    pub lists: Vec<ListSummary>,
    pub folder_urls: Vec<String>,
    pub file_urls: Vec<String>,
}

/// A list as enumerated on its web.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSummary {
    pub id: String,
    pub default_view_url: String,
}

/// A list with its ACL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct List {
    pub id: String,
    pub title: String,
    pub scope_id: String,
    pub root_folder: String,
    pub default_view_url: String,
    pub default_view_item_url: String,
    pub no_index: bool,
    pub read_security: i32,
    pub allow_anonymous_access: bool,
    pub anonymous_view_list_items: bool,
    pub anonymous_permission_mask: u64,
    pub last_modified: String,
    pub permissions: Vec<PermissionGrant>,
}

/// One `z:row` of a list item: its `ows_*` attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRow {
    pub attributes: BTreeMap<String, String>,
}

impl ItemRow {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            attributes: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Returns the part after `;#` in a lookup-style value like `12;#{GUID}`.
    pub fn lookup_value(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|v| v.split_once(";#"))
            .map(|(_, value)| value)
    }

    /// Returns the numeric id before `;#` in a lookup-style value.
    pub fn lookup_id(&self, name: &str) -> Option<i32> {
        self.get(name)
            .and_then(|v| v.split_once(";#"))
            .and_then(|(id, _)| id.parse().ok())
    }
}

/// A permission scope embedded in an item response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionScope {
    pub id: String,
    pub permissions: Vec<PermissionGrant>,
}

/// A list item (or folder) with its row and scope table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemData {
    pub row: ItemRow,
    pub scopes: Vec<PermissionScope>,
    /// Permissions of the scope named in the item metadata.
    pub metadata_scope_permissions: Vec<PermissionGrant>,
}

/// Result of resolving a URL to its list and item ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlSegments {
    pub list_id: Option<String>,
    pub item_id: Option<String>,
}

/// Result of resolving a URL to its site collection and web.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteAndWeb {
    pub site_url: String,
    pub web_url: String,
}

/// A user from the site user collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteUser {
    pub id: i32,
    pub name: String,
    pub login_name: String,
    pub is_domain_group: bool,
}

/// Kind of principal reported by the People service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    None,
    User,
    DistributionList,
    SecurityGroup,
    SharePointGroup,
}

/// Resolution of one login name by the People service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalInfo {
    pub account_name: String,
    pub display_name: String,
    pub principal_type: PrincipalType,
    pub is_resolved: bool,
}

/// A child of a folder as returned by the folder listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderChild {
    pub server_url: String,
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_helpers() {
        let row = ItemRow::from_pairs([
            ("ows_ScopeId", "2;#{ABC-123}"),
            ("ows_Author", "7;#Alice"),
            ("ows_Title", "plain"),
        ]);
        assert_eq!(row.lookup_value("ows_ScopeId"), Some("{ABC-123}"));
        assert_eq!(row.lookup_id("ows_Author"), Some(7));
        assert_eq!(row.lookup_value("ows_Title"), None);
        assert_eq!(row.lookup_id("ows_Missing"), None);
    }
}
