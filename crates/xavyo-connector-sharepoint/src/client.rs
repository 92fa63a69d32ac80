//! Content service interfaces consumed by the connector.
//!
//! One set of clients exists per web; the SOAP transport behind them is
//! supplied by the embedding application through [`ClientFactory`].

use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use crate::changes::ChangePaginator;
use crate::config::SidLookupConfig;
use crate::error::SharePointResult;
use crate::model::{
    ContentDatabase, FolderChild, ItemData, List, PrincipalInfo, Site, SiteAndWeb, SiteUser,
    UrlSegments, VirtualServer, Web,
};
use crate::sid::SidResolver;

/// Site data service bound to one web.
#[async_trait]
pub trait SiteDataClient: Send + Sync {
    async fn get_content_virtual_server(&self) -> SharePointResult<VirtualServer>;

    async fn get_content_content_database(
        &self,
        id: &str,
        retrieve_children: bool,
    ) -> SharePointResult<ContentDatabase>;

    async fn get_content_site(&self) -> SharePointResult<Site>;

    async fn get_content_web(&self) -> SharePointResult<Web>;

    async fn get_content_list(&self, list_id: &str) -> SharePointResult<List>;

    async fn get_content_item(&self, list_id: &str, item_id: &str) -> SharePointResult<ItemData>;

    /// Children of a folder; `folder_path` is relative to the list root.
    async fn get_folder_children(
        &self,
        list_id: &str,
        folder_path: &str,
    ) -> SharePointResult<Vec<FolderChild>>;

    /// Resolves a URL to its list and item ids, `None` when not found.
    async fn get_url_segments(&self, url: &str) -> SharePointResult<Option<UrlSegments>>;

    /// Resolves a URL to the site collection and web containing it.
    async fn get_site_and_web(&self, url: &str) -> SharePointResult<Option<SiteAndWeb>>;

    async fn get_changes_content_database(
        &self,
        content_database_id: &str,
        since: &str,
    ) -> SharePointResult<Box<dyn ChangePaginator>>;

    async fn get_changes_site(
        &self,
        site_id: &str,
        since: &str,
    ) -> SharePointResult<Box<dyn ChangePaginator>>;
}

/// User group service bound to one site collection.
#[async_trait]
pub trait UserGroupClient: Send + Sync {
    async fn get_user_collection_from_site(&self) -> SharePointResult<Vec<SiteUser>>;
}

/// People service used to resolve policy login names.
#[async_trait]
pub trait PeopleClient: Send + Sync {
    async fn resolve_principals(&self, login_names: &[String]) -> SharePointResult<Vec<PrincipalInfo>>;
}

/// Clients for one web.
#[derive(Clone)]
pub struct SiteClients {
    pub site_data: Arc<dyn SiteDataClient>,
    pub user_group: Arc<dyn UserGroupClient>,
    pub people: Arc<dyn PeopleClient>,
}

/// Creates the clients for a web.
pub trait ClientFactory: Send + Sync {
    /// `site_url` and `web_url` are canonical; `endpoint` is the web's
    /// encoded base URI.
    fn create(&self, site_url: &str, web_url: &str, endpoint: &Url) -> SharePointResult<SiteClients>;

    /// Directory client for a configured SID lookup. `Ok(None)` means the
    /// application cannot reach a directory.
    fn sid_resolver(
        &self,
        _config: &SidLookupConfig,
    ) -> SharePointResult<Option<Arc<dyn SidResolver>>> {
        Ok(None)
    }
}
