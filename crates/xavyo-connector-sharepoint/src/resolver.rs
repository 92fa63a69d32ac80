//! Access control resolution.
//!
//! Turns raw permission grants into principals and builds the ACL of each
//! object kind. Every non-root ACL eventually inherits from the site
//! collection's `admin` fragment, which inherits from the virtual server
//! policy unless the deployment is a single site collection.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::acl::{
    Acl, AclBuilder, DocId, InheritanceType, READ_SECURITY_FRAGMENT,
    SITE_COLLECTION_ADMIN_FRAGMENT,
};
use crate::error::{SharePointError, SharePointResult};
use crate::groups::PrincipalNamer;
use crate::identity_cache::IdentityCache;
use crate::member_mapping::MemberIdMapping;
use crate::model::{ItemData, List, PermissionGrant, PrincipalType, VirtualServer, Web};
use crate::permissions::{
    is_permitted, LIST_ITEM_MASK, OPEN, READ_SECURITY_LIST_ITEM_MASK, VIEW_LIST_ITEMS,
};
use crate::principal::Principal;
use crate::rare_cache::{CachedList, CachedVirtualServer, CachedWeb, RareModCache};
use crate::registry::SiteHandle;

pub(crate) const OWS_SCOPE_ID: &str = "ows_ScopeId";
pub(crate) const OWS_FILE_DIR_REF: &str = "ows_FileDirRef";
pub(crate) const OWS_AUTHOR: &str = "ows_Author";

pub fn allow_anonymous_peek_for_web(web: &CachedWeb) -> bool {
    is_permitted(web.anonymous_permission_mask, OPEN)
}

pub fn allow_anonymous_read_for_web(web: &CachedWeb) -> bool {
    web.allow_anonymous_access
        && web.anonymous_view_list_items
        && is_permitted(web.anonymous_permission_mask, LIST_ITEM_MASK)
}

/// Read security always forces per-item checks, so it disables anonymous
/// access regardless of the other flags.
pub fn allow_anonymous_read_for_list(list: &CachedList) -> bool {
    !list.is_read_security_enabled()
        && list.allow_anonymous_access
        && list.anonymous_view_list_items
        && is_permitted(list.anonymous_permission_mask, VIEW_LIST_ITEMS)
}

pub fn deny_anonymous_by_policy(vs: &CachedVirtualServer) -> bool {
    vs.anonymous_deny_mask & LIST_ITEM_MASK != 0 || vs.policy_contains_deny
}

/// ACL of a list plus the named resource for its root folder.
#[derive(Debug, Clone)]
pub struct ListAcls {
    pub acl: Acl,
    pub root_folder: DocId,
    pub root_folder_acl: Acl,
}

/// ACL of a list item plus any fragments it needs.
#[derive(Debug, Clone)]
pub struct ItemAcl {
    pub acl: Acl,
    pub fragments: Vec<(String, Acl)>,
}

/// Resolves permission grants and builds object ACLs.
pub struct AclResolver {
    identities: IdentityCache,
    rare: Arc<RareModCache>,
    namer: PrincipalNamer,
    site_collection_only: bool,
    honor_read_security: bool,
}

impl AclResolver {
    pub fn new(
        identities: IdentityCache,
        rare: Arc<RareModCache>,
        namer: PrincipalNamer,
        site_collection_only: bool,
        honor_read_security: bool,
    ) -> Self {
        Self {
            identities,
            rare,
            namer,
            site_collection_only,
            honor_read_security,
        }
    }

    pub fn identities(&self) -> &IdentityCache {
        &self.identities
    }

    pub fn rare(&self) -> &Arc<RareModCache> {
        &self.rare
    }

    /// Principals of every grant carrying all bits of `required`.
    ///
    /// A member id missing from both mappings triggers at most one refresh of
    /// each mapping for the whole call. Ids that stay unresolved are logged
    /// and dropped.
    pub async fn resolve_permits(
        &self,
        site_url: &str,
        grants: &[PermissionGrant],
        required: u64,
    ) -> SharePointResult<Vec<Principal>> {
        let mut member_ids = self.identities.member_ids().get(site_url).await?;
        let mut member_ids_refreshed = false;
        let mut site_users: Option<Arc<MemberIdMapping>> = None;
        let mut site_users_refreshed = false;
        let mut permits = Vec::new();

        for grant in grants {
            if !is_permitted(grant.mask, required) {
                continue;
            }
            let id = grant.member_id;
            if let Some(principal) = member_ids.get(id) {
                permits.push(principal.clone());
                continue;
            }

            let users = match &site_users {
                Some(users) => users.clone(),
                None => {
                    let users = self.identities.site_users().get(site_url).await?;
                    site_users = Some(users.clone());
                    users
                }
            };
            if let Some(principal) = users.get(id) {
                permits.push(principal.clone());
                continue;
            }

            if !member_ids_refreshed {
                member_ids_refreshed = true;
                match self.identities.member_ids().refresh(site_url, &member_ids).await {
                    Ok(refreshed) => member_ids = refreshed,
                    Err(e) => warn!(site_url = %site_url, error = %e, "Member id mapping refresh failed"),
                }
                if let Some(principal) = member_ids.get(id) {
                    permits.push(principal.clone());
                    continue;
                }
            }

            if !site_users_refreshed {
                site_users_refreshed = true;
                match self.identities.site_users().refresh(site_url, &users).await {
                    Ok(refreshed) => {
                        let found = refreshed.get(id).cloned();
                        site_users = Some(refreshed);
                        if let Some(principal) = found {
                            permits.push(principal);
                            continue;
                        }
                    }
                    Err(e) => warn!(site_url = %site_url, error = %e, "Site user mapping refresh failed"),
                }
            }

            warn!(site_url = %site_url, member_id = id, "Could not resolve member id");
        }
        Ok(permits)
    }

    /// Looks up a single user id without refreshing either mapping.
    pub async fn resolve_user(&self, site_url: &str, user_id: i32) -> SharePointResult<Option<Principal>> {
        if let Some(principal) = self.identities.member_ids().get(site_url).await?.get(user_id) {
            return Ok(Some(principal.clone()));
        }
        let found = self.identities.site_users().get(site_url).await?.get(user_id).cloned();
        if found.is_none() {
            warn!(site_url = %site_url, user_id, "Could not resolve user id");
        }
        Ok(found)
    }

    /// Whether the web application policy vetoes anonymous access.
    pub async fn is_deny_anonymous(&self, site: &SiteHandle) -> SharePointResult<bool> {
        if self.site_collection_only {
            debug!("Ignoring web application policy in site collection mode");
            return Ok(false);
        }
        let vs = self.rare.get_virtual_server(site).await?;
        Ok(deny_anonymous_by_policy(&vs))
    }

    pub async fn web_allows_anonymous(&self, site: &SiteHandle, web: &CachedWeb) -> SharePointResult<bool> {
        Ok(allow_anonymous_read_for_web(web) && !self.is_deny_anonymous(site).await?)
    }

    pub async fn list_allows_anonymous(
        &self,
        site: &SiteHandle,
        list: &CachedList,
        web: &CachedWeb,
    ) -> SharePointResult<bool> {
        Ok(allow_anonymous_read_for_list(list)
            && allow_anonymous_peek_for_web(web)
            && !self.is_deny_anonymous(site).await?)
    }

    /// Items are anonymous only while they still share the list's scope.
    pub async fn item_allows_anonymous(
        &self,
        site: &SiteHandle,
        list: &CachedList,
        web: &CachedWeb,
        item_scope_id: &str,
    ) -> SharePointResult<bool> {
        Ok(item_scope_id.eq_ignore_ascii_case(&list.scope_id)
            && self.list_allows_anonymous(site, list, web).await?)
    }

    /// ACL of the virtual server document, built from the policy.
    pub async fn virtual_server_acl(&self, site: &SiteHandle, vs: &VirtualServer) -> SharePointResult<Acl> {
        let login_names: Vec<String> = vs.policy.iter().map(|p| p.login_name.clone()).collect();
        let resolved = if login_names.is_empty() {
            Vec::new()
        } else {
            site.people().resolve_principals(&login_names).await?
        };

        let mut permits = Vec::new();
        let mut denies = Vec::new();
        for (policy_user, info) in vs.policy.iter().zip(resolved.iter()) {
            if !info.is_resolved {
                warn!(login_name = %policy_user.login_name, "Unable to resolve policy user");
                continue;
            }
            let is_group = match info.principal_type {
                PrincipalType::SecurityGroup => true,
                PrincipalType::User => false,
                other => {
                    warn!(account = %info.account_name, principal_type = ?other, "Unexpected policy principal type");
                    continue;
                }
            };
            let Some(principal) = self
                .namer
                .principal(&info.account_name, &info.display_name, is_group)
                .await
            else {
                continue;
            };
            if is_permitted(policy_user.grant_mask, LIST_ITEM_MASK) {
                permits.push(principal.clone());
            }
            if policy_user.deny_mask & LIST_ITEM_MASK != 0 {
                denies.push(principal);
            }
        }
        if resolved.len() < vs.policy.len() {
            warn!(
                expected = vs.policy.len(),
                resolved = resolved.len(),
                "People service returned fewer entries than requested"
            );
        }

        Ok(Acl::builder()
            .case_insensitive()
            .inheritance_type(InheritanceType::ParentOverrides)
            .permits(permits)
            .denies(denies)
            .build())
    }

    /// The `admin` fragment of a site collection: its administrators.
    pub async fn site_admin_acl(&self, web: &Web) -> Acl {
        let mut admins = Vec::new();
        for user in web.users.iter().filter(|user| user.is_site_admin) {
            if let Some(principal) = self.namer.user_description(user).await {
                admins.push(principal);
            }
        }
        let builder = Acl::builder()
            .case_insensitive()
            .permits(admins)
            .inheritance_type(InheritanceType::ParentOverrides);
        if self.site_collection_only {
            builder.build()
        } else {
            builder.inherit_from(DocId::root()).build()
        }
    }

    /// ACL of a web.
    ///
    /// `parent_scope_id` is `None` for a site collection root, which always
    /// carries its own permissions.
    pub async fn web_acl(
        &self,
        site: &SiteHandle,
        web: &Web,
        parent_scope_id: Option<&str>,
    ) -> SharePointResult<Acl> {
        let inherits = match parent_scope_id {
            Some(parent) if !site.is_site_collection() => parent.eq_ignore_ascii_case(&web.scope_id),
            _ => false,
        };
        let builder = if inherits {
            match site.parent_web_url() {
                Some(parent) => Acl::builder().inherit_from(DocId::new(parent)),
                None => return Err(SharePointError::AclChain(site.web_url().to_string())),
            }
        } else {
            self.explicit_acl(site, &web.permissions, LIST_ITEM_MASK).await?
        };
        Ok(builder.inheritance_type(InheritanceType::ParentOverrides).build())
    }

    /// ACL of a list and of its root folder.
    ///
    /// The list document points at its root folder; the root folder either
    /// inherits from the web or carries the list's own permissions.
    pub async fn list_acls(&self, site: &SiteHandle, list: &List, web_scope_id: &str) -> SharePointResult<ListAcls> {
        let root_folder = site.encode_doc_id(&list.root_folder);
        let builder = if list.scope_id.eq_ignore_ascii_case(web_scope_id) {
            Acl::builder().inherit_from(DocId::new(site.web_url()))
        } else {
            self.explicit_acl(site, &list.permissions, LIST_ITEM_MASK).await?
        };
        Ok(ListAcls {
            acl: Acl::builder()
                .inherit_from(root_folder.clone())
                .inheritance_type(InheritanceType::ParentOverrides)
                .build(),
            root_folder,
            root_folder_acl: builder.inheritance_type(InheritanceType::ParentOverrides).build(),
        })
    }

    /// ACL of a list item or folder.
    pub async fn item_acl(
        &self,
        site: &SiteHandle,
        list_id: &str,
        list: &CachedList,
        item: &ItemData,
        doc_id: &DocId,
    ) -> SharePointResult<ItemAcl> {
        let scope_id = item_scope_id(item, doc_id)?;

        if self.honor_read_security && list.is_read_security_enabled() {
            return self.read_security_acl(site, item, &scope_id, doc_id).await;
        }

        let root_folder = site.encode_doc_id(&list.root_folder);
        if scope_id == list.scope_id {
            return Ok(ItemAcl {
                acl: parent_overrides(Acl::builder().inherit_from(root_folder)),
                fragments: Vec::new(),
            });
        }

        let folder = item
            .row
            .lookup_value(OWS_FILE_DIR_REF)
            .map(|dir| site.encode_doc_id(&format!("/{dir}")));
        if let Some(folder) = folder.filter(|f| *f != root_folder) {
            let folder_scope = self.folder_scope_id(site, list_id, &folder).await?;
            if folder_scope == scope_id {
                return Ok(ItemAcl {
                    acl: parent_overrides(Acl::builder().inherit_from(folder)),
                    fragments: Vec::new(),
                });
            }
        }

        let scope = item
            .scopes
            .iter()
            .find(|scope| scope.id.eq_ignore_ascii_case(&scope_id))
            .ok_or_else(|| SharePointError::ScopeNotFound(doc_id.to_string()))?;
        let builder = self.explicit_acl(site, &scope.permissions, LIST_ITEM_MASK).await?;
        Ok(ItemAcl {
            acl: parent_overrides(builder),
            fragments: Vec::new(),
        })
    }

    /// Item ACL under read security: the item's own permits AND a stricter
    /// fragment that always admits the author.
    async fn read_security_acl(
        &self,
        site: &SiteHandle,
        item: &ItemData,
        scope_id: &str,
        doc_id: &DocId,
    ) -> SharePointResult<ItemAcl> {
        let permissions = item
            .scopes
            .iter()
            .find(|scope| scope.id.eq_ignore_ascii_case(scope_id))
            .map(|scope| scope.permissions.as_slice())
            .unwrap_or(item.metadata_scope_permissions.as_slice());

        let base = self
            .resolve_permits(site.site_url(), permissions, LIST_ITEM_MASK)
            .await?;
        let mut strict = self
            .resolve_permits(site.site_url(), permissions, READ_SECURITY_LIST_ITEM_MASK)
            .await?;
        if let Some(author_id) = item.row.lookup_id(OWS_AUTHOR) {
            if let Some(author) = self.resolve_user(site.site_url(), author_id).await? {
                strict.push(author);
            }
        }

        let acl = Acl::builder()
            .case_insensitive()
            .permits(base)
            .inherit_from_fragment(doc_id.clone(), READ_SECURITY_FRAGMENT)
            .inheritance_type(InheritanceType::ParentOverrides)
            .build();
        let fragment = Acl::builder()
            .case_insensitive()
            .permits(strict)
            .inherit_from_fragment(site.site_doc_id(), SITE_COLLECTION_ADMIN_FRAGMENT)
            .inheritance_type(InheritanceType::AndBothPermit)
            .build();
        Ok(ItemAcl {
            acl,
            fragments: vec![(READ_SECURITY_FRAGMENT.to_string(), fragment)],
        })
    }

    async fn explicit_acl(
        &self,
        site: &SiteHandle,
        grants: &[PermissionGrant],
        required: u64,
    ) -> SharePointResult<AclBuilder> {
        let permits = self.resolve_permits(site.site_url(), grants, required).await?;
        Ok(Acl::builder()
            .case_insensitive()
            .permits(permits)
            .inherit_from_fragment(site.site_doc_id(), SITE_COLLECTION_ADMIN_FRAGMENT))
    }

    async fn folder_scope_id(&self, site: &SiteHandle, list_id: &str, folder: &DocId) -> SharePointResult<String> {
        let segments = site
            .site_data()
            .get_url_segments(folder.as_str())
            .await?
            .ok_or_else(|| SharePointError::NotFound(folder.to_string()))?;
        let (Some(folder_list), Some(folder_item)) = (segments.list_id, segments.item_id) else {
            return Err(SharePointError::NotFound(folder.to_string()));
        };
        if !folder_list.eq_ignore_ascii_case(list_id) {
            return Err(SharePointError::Remote(format!(
                "parent folder {folder} belongs to list {folder_list}, expected {list_id}"
            )));
        }
        let data = site.site_data().get_content_item(list_id, &folder_item).await?;
        item_scope_id(&data, folder)
    }
}

fn parent_overrides(builder: AclBuilder) -> Acl {
    builder.inheritance_type(InheritanceType::ParentOverrides).build()
}

/// Scope id of an item row, lowercased. `ows_ScopeId` reads `N;#{GUID}`.
pub(crate) fn item_scope_id(item: &ItemData, doc_id: &DocId) -> SharePointResult<String> {
    item.row
        .lookup_value(OWS_SCOPE_ID)
        .map(str::to_lowercase)
        .ok_or_else(|| SharePointError::ScopeNotFound(doc_id.to_string()))
}
