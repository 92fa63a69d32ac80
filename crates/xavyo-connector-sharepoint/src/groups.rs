//! Principal construction from SharePoint users and groups.
//!
//! Domain users and domain groups live in the default namespace. SharePoint
//! groups are local to their site collection, so their namespace carries the
//! site URL as a suffix.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::claims::{decode_claim, windows_group_sid};
use crate::error::SharePointResult;
use crate::identity_cache::MappingLoader;
use crate::member_mapping::MemberIdMapping;
use crate::model::{SiteGroup, SiteUser, UserDescription};
use crate::principal::Principal;
use crate::registry::SiteRegistry;
use crate::sid::SidResolver;

/// Group definitions to push: group principal to its members.
pub type GroupDefinitions = HashMap<Principal, Vec<Principal>>;

/// Namespace of the SharePoint groups defined in `site_url`.
pub fn site_group_namespace(default_namespace: &str, site_url: &str) -> String {
    format!("{default_namespace}_{site_url}")
}

/// Turns SharePoint login names into principals.
///
/// Domain groups reported by SID are translated through the directory when
/// one is configured, falling back to their display name.
#[derive(Clone)]
pub struct PrincipalNamer {
    default_namespace: String,
    sids: Option<Arc<dyn SidResolver>>,
}

impl PrincipalNamer {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
            sids: None,
        }
    }

    #[must_use]
    pub fn with_sid_resolver(mut self, sids: Arc<dyn SidResolver>) -> Self {
        self.sids = Some(sids);
        self
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Returns `None` (after logging) when the login name is an
    /// unrecognized claim.
    pub async fn principal(
        &self,
        login_name: &str,
        display_name: &str,
        is_domain_group: bool,
    ) -> Option<Principal> {
        let name = match self.account_name(login_name, display_name, is_domain_group).await {
            Ok(name) => name,
            Err(e) => {
                warn!(login_name = %login_name, error = %e, "Unable to determine login name");
                return None;
            }
        };
        Some(if is_domain_group {
            Principal::group(name, &self.default_namespace)
        } else {
            Principal::user(name, &self.default_namespace)
        })
    }

    async fn account_name(
        &self,
        login_name: &str,
        display_name: &str,
        is_domain_group: bool,
    ) -> SharePointResult<String> {
        let sid = windows_group_sid(login_name).filter(|_| is_domain_group);
        let (Some(sids), Some(sid)) = (&self.sids, sid) else {
            return decode_claim(login_name, display_name);
        };
        match sids.account_for_sid(sid).await {
            Ok(Some(account)) => Ok(account),
            Ok(None) => {
                warn!(sid = %sid, display_name = %display_name, "No account for SID, using display name");
                Ok(display_name.to_string())
            }
            Err(e) => {
                warn!(sid = %sid, display_name = %display_name, error = %e, "SID lookup failed, using display name");
                Ok(display_name.to_string())
            }
        }
    }

    pub async fn user_description(&self, user: &UserDescription) -> Option<Principal> {
        self.principal(&user.login_name, &user.name, user.is_domain_group)
            .await
    }

    /// Builds the membership of every SharePoint group of a site collection.
    ///
    /// Empty groups are kept so that a group emptied on the server is
    /// emptied in the index too.
    pub async fn members_for_groups(&self, groups: &[SiteGroup], site_url: &str) -> GroupDefinitions {
        let group_namespace = site_group_namespace(&self.default_namespace, site_url);
        let mut defs = GroupDefinitions::new();
        for group in groups {
            let mut members = Vec::with_capacity(group.users.len());
            for user in &group.users {
                if let Some(principal) = self.user_description(user).await {
                    members.push(principal);
                }
            }
            defs.insert(Principal::group(&group.name, &group_namespace), members);
        }
        defs
    }

    /// Builds the member id mapping from the site groups and the web users.
    pub async fn member_id_mapping(
        &self,
        groups: &[SiteGroup],
        users: &[UserDescription],
        site_url: &str,
    ) -> MemberIdMapping {
        let group_namespace = site_group_namespace(&self.default_namespace, site_url);
        let mut members = HashMap::new();
        for group in groups {
            members.insert(group.id, Principal::group(&group.name, &group_namespace));
        }
        for user in users {
            if let Some(principal) = self.user_description(user).await {
                members.insert(user.id, principal);
            }
        }
        MemberIdMapping::new(members)
    }

    pub async fn site_user_mapping(&self, users: &[SiteUser]) -> MemberIdMapping {
        let mut members = HashMap::new();
        for user in users {
            if let Some(principal) = self
                .principal(&user.login_name, &user.name, user.is_domain_group)
                .await
            {
                members.insert(user.id, principal);
            }
        }
        MemberIdMapping::new(members)
    }
}

/// Loads the explicit member mapping of a site collection.
pub struct MemberIdLoader {
    registry: Arc<SiteRegistry>,
    namer: PrincipalNamer,
}

impl MemberIdLoader {
    pub fn new(registry: Arc<SiteRegistry>, namer: PrincipalNamer) -> Self {
        Self { registry, namer }
    }
}

#[async_trait]
impl MappingLoader for MemberIdLoader {
    async fn load(&self, site_url: &str) -> SharePointResult<MemberIdMapping> {
        let handle = self.registry.get_site(site_url, site_url)?;
        let site = handle.site_data().get_content_site().await?;
        let web = handle.site_data().get_content_web().await?;
        let mapping = self
            .namer
            .member_id_mapping(&site.groups, &web.users, handle.site_url())
            .await;
        debug!(site_url = %site_url, members = mapping.len(), "Loaded member id mapping");
        Ok(mapping)
    }
}

/// Loads every valid user of a site collection.
pub struct SiteUserLoader {
    registry: Arc<SiteRegistry>,
    namer: PrincipalNamer,
}

impl SiteUserLoader {
    pub fn new(registry: Arc<SiteRegistry>, namer: PrincipalNamer) -> Self {
        Self { registry, namer }
    }
}

#[async_trait]
impl MappingLoader for SiteUserLoader {
    async fn load(&self, site_url: &str) -> SharePointResult<MemberIdMapping> {
        let handle = self.registry.get_site(site_url, site_url)?;
        let users = handle.user_group().get_user_collection_from_site().await?;
        let mapping = self.namer.site_user_mapping(&users).await;
        debug!(site_url = %site_url, members = mapping.len(), "Loaded site user mapping");
        Ok(mapping)
    }
}
