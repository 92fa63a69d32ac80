//! Short-lived cache of object metadata that rarely changes.
//!
//! Web, list and virtual server flags are read on nearly every document
//! request; caching them for a few minutes avoids refetching the full
//! object each time.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SharePointResult;
use crate::model::{List, VirtualServer, Web};
use crate::permissions::{LIST_ITEM_MASK, LIST_READ_SECURITY_ENABLED};
use crate::registry::SiteHandle;

/// Cached web flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedWeb {
    pub no_index: bool,
    pub allow_anonymous_access: bool,
    pub anonymous_view_list_items: bool,
    pub anonymous_permission_mask: u64,
    pub scope_id: String,
    pub title: String,
}

impl From<&Web> for CachedWeb {
    fn from(web: &Web) -> Self {
        Self {
            no_index: web.no_index,
            allow_anonymous_access: web.allow_anonymous_access,
            anonymous_view_list_items: web.anonymous_view_list_items,
            anonymous_permission_mask: web.anonymous_permission_mask,
            scope_id: web.scope_id.to_lowercase(),
            title: web.title.clone(),
        }
    }
}

/// Cached list flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedList {
    pub no_index: bool,
    pub read_security: i32,
    pub allow_anonymous_access: bool,
    pub anonymous_view_list_items: bool,
    pub anonymous_permission_mask: u64,
    pub scope_id: String,
    pub root_folder: String,
    pub default_view_url: String,
    pub default_view_item_url: String,
    pub title: String,
}

impl CachedList {
    pub fn is_read_security_enabled(&self) -> bool {
        self.read_security == LIST_READ_SECURITY_ENABLED
    }
}

impl From<&List> for CachedList {
    fn from(list: &List) -> Self {
        Self {
            no_index: list.no_index,
            read_security: list.read_security,
            allow_anonymous_access: list.allow_anonymous_access,
            anonymous_view_list_items: list.anonymous_view_list_items,
            anonymous_permission_mask: list.anonymous_permission_mask,
            scope_id: list.scope_id.to_lowercase(),
            root_folder: list.root_folder.clone(),
            default_view_url: list.default_view_url.clone(),
            default_view_item_url: list.default_view_item_url.clone(),
            title: list.title.clone(),
        }
    }
}

/// Cached virtual server anonymous-access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedVirtualServer {
    pub anonymous_deny_mask: u64,
    pub policy_contains_deny: bool,
}

impl From<&VirtualServer> for CachedVirtualServer {
    fn from(vs: &VirtualServer) -> Self {
        Self {
            anonymous_deny_mask: vs.anonymous_deny_mask,
            policy_contains_deny: vs
                .policy
                .iter()
                .any(|user| user.deny_mask & LIST_ITEM_MASK != 0),
        }
    }
}

/// TTL cache for [`CachedWeb`], [`CachedList`] and [`CachedVirtualServer`].
pub struct RareModCache {
    webs: Cache<String, Arc<CachedWeb>>,
    lists: Cache<(String, String), Arc<CachedList>>,
    virtual_server: Cache<(), Arc<CachedVirtualServer>>,
}

impl RareModCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            webs: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
            lists: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
            virtual_server: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
        }
    }

    pub async fn get_web(&self, site: &SiteHandle) -> SharePointResult<Arc<CachedWeb>> {
        let key = site.web_url().to_string();
        if let Some(cached) = self.webs.get(&key).await {
            return Ok(cached);
        }
        let web = site.site_data().get_content_web().await?;
        Ok(self.put_web(&key, &web).await)
    }

    /// Stores a freshly fetched web so later lookups skip the remote call.
    pub async fn put_web(&self, web_url: &str, web: &Web) -> Arc<CachedWeb> {
        let cached = Arc::new(CachedWeb::from(web));
        self.webs.insert(web_url.to_string(), Arc::clone(&cached)).await;
        cached
    }

    pub async fn get_list(&self, site: &SiteHandle, list_id: &str) -> SharePointResult<Arc<CachedList>> {
        let key = (site.web_url().to_string(), list_id.to_lowercase());
        if let Some(cached) = self.lists.get(&key).await {
            return Ok(cached);
        }
        let list = site.site_data().get_content_list(list_id).await?;
        let cached = Arc::new(CachedList::from(&list));
        self.lists.insert(key, Arc::clone(&cached)).await;
        Ok(cached)
    }

    pub async fn get_virtual_server(&self, site: &SiteHandle) -> SharePointResult<Arc<CachedVirtualServer>> {
        if let Some(cached) = self.virtual_server.get(&()).await {
            return Ok(cached);
        }
        let vs = site.site_data().get_content_virtual_server().await?;
        let cached = Arc::new(CachedVirtualServer::from(&vs));
        self.virtual_server.insert((), Arc::clone(&cached)).await;
        Ok(cached)
    }

    pub fn invalidate_all(&self) {
        self.webs.invalidate_all();
        self.lists.invalidate_all();
        self.virtual_server.invalidate_all();
    }
}
