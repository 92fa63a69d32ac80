//! Memoized per-web client handles.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::acl::DocId;
use crate::auth::AuthContext;
use crate::client::{ClientFactory, PeopleClient, SiteDataClient, UserGroupClient};
use crate::error::SharePointResult;
use crate::url::{canonical_url, encode_doc_id, parent_web_url, sp_url_to_uri};

/// Clients and identity of one web inside a site collection.
pub struct SiteHandle {
    site_url: String,
    web_url: String,
    site_data: Arc<dyn SiteDataClient>,
    user_group: Arc<dyn UserGroupClient>,
    people: Arc<dyn PeopleClient>,
}

impl std::fmt::Debug for SiteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteHandle")
            .field("site_url", &self.site_url)
            .field("web_url", &self.web_url)
            .finish_non_exhaustive()
    }
}

impl SiteHandle {
    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    pub fn web_url(&self) -> &str {
        &self.web_url
    }

    /// Document id of the site collection root.
    pub fn site_doc_id(&self) -> DocId {
        DocId::new(self.site_url.clone())
    }

    pub fn is_site_collection(&self) -> bool {
        self.site_url == self.web_url
    }

    pub fn parent_web_url(&self) -> Option<String> {
        parent_web_url(&self.web_url)
    }

    /// Resolves a possibly relative URL from this web into a document id.
    pub fn encode_doc_id(&self, url: &str) -> DocId {
        encode_doc_id(&self.web_url, url)
    }

    pub fn site_data(&self) -> &Arc<dyn SiteDataClient> {
        &self.site_data
    }

    pub fn user_group(&self) -> &Arc<dyn UserGroupClient> {
        &self.user_group
    }

    pub fn people(&self) -> &Arc<dyn PeopleClient> {
        &self.people
    }
}

/// Creates site handles lazily, one per canonical web URL.
pub struct SiteRegistry {
    sites: DashMap<String, Arc<SiteHandle>>,
    factory: Arc<dyn ClientFactory>,
    auth: Arc<AuthContext>,
}

impl SiteRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, auth: Arc<AuthContext>) -> Self {
        Self {
            sites: DashMap::new(),
            factory,
            auth,
        }
    }

    pub fn auth(&self) -> &Arc<AuthContext> {
        &self.auth
    }

    /// Returns the handle for `web_url`, creating it on first use.
    ///
    /// Concurrent first calls may each build a handle; only the one that
    /// lands in the map is returned to everybody.
    pub fn get_site(&self, site_url: &str, web_url: &str) -> SharePointResult<Arc<SiteHandle>> {
        let web_url = canonical_url(web_url);
        if let Some(handle) = self.sites.get(&web_url) {
            return Ok(handle.clone());
        }

        let site_url = canonical_url(site_url);
        let endpoint = sp_url_to_uri(&web_url)?;
        self.auth.permit_host(&endpoint)?;
        let clients = self.factory.create(&site_url, &web_url, &endpoint)?;
        let candidate = Arc::new(SiteHandle {
            site_url,
            web_url: web_url.clone(),
            site_data: clients.site_data,
            user_group: clients.user_group,
            people: clients.people,
        });

        let winner = self.sites.entry(web_url).or_insert(candidate).clone();
        debug!(web_url = %winner.web_url, "Site handle ready");
        Ok(winner)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn clear(&self) {
        self.sites.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangePaginator;
    use crate::client::SiteClients;
    use crate::error::SharePointError;
    use crate::model::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    struct Unused;

    #[async_trait]
    impl SiteDataClient for Unused {
        async fn get_content_virtual_server(&self) -> SharePointResult<VirtualServer> {
            Err(SharePointError::NotFound("vs".into()))
        }
        async fn get_content_content_database(&self, id: &str, _: bool) -> SharePointResult<ContentDatabase> {
            Err(SharePointError::NotFound(id.into()))
        }
        async fn get_content_site(&self) -> SharePointResult<Site> {
            Err(SharePointError::NotFound("site".into()))
        }
        async fn get_content_web(&self) -> SharePointResult<Web> {
            Err(SharePointError::NotFound("web".into()))
        }
        async fn get_content_list(&self, id: &str) -> SharePointResult<List> {
            Err(SharePointError::NotFound(id.into()))
        }
        async fn get_content_item(&self, _: &str, id: &str) -> SharePointResult<ItemData> {
            Err(SharePointError::NotFound(id.into()))
        }
        async fn get_folder_children(&self, _: &str, _: &str) -> SharePointResult<Vec<FolderChild>> {
            Ok(Vec::new())
        }
        async fn get_url_segments(&self, _: &str) -> SharePointResult<Option<UrlSegments>> {
            Ok(None)
        }
        async fn get_site_and_web(&self, _: &str) -> SharePointResult<Option<SiteAndWeb>> {
            Ok(None)
        }
        async fn get_changes_content_database(&self, id: &str, _: &str) -> SharePointResult<Box<dyn ChangePaginator>> {
            Err(SharePointError::NotFound(id.into()))
        }
        async fn get_changes_site(&self, id: &str, _: &str) -> SharePointResult<Box<dyn ChangePaginator>> {
            Err(SharePointError::NotFound(id.into()))
        }
    }

    #[async_trait]
    impl UserGroupClient for Unused {
        async fn get_user_collection_from_site(&self) -> SharePointResult<Vec<SiteUser>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl PeopleClient for Unused {
        async fn resolve_principals(&self, _: &[String]) -> SharePointResult<Vec<PrincipalInfo>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl ClientFactory for CountingFactory {
        fn create(&self, _: &str, _: &str, _: &Url) -> SharePointResult<SiteClients> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let unused = Arc::new(Unused);
            Ok(SiteClients {
                site_data: unused.clone(),
                user_group: unused.clone(),
                people: unused,
            })
        }
    }

    fn registry() -> (SiteRegistry, Arc<CountingFactory>, Arc<AuthContext>) {
        let factory = Arc::new(CountingFactory::default());
        let auth = Arc::new(AuthContext::new(None, None));
        (SiteRegistry::new(factory.clone(), auth.clone()), factory, auth)
    }

    #[test]
    fn test_handles_are_memoized_by_canonical_web_url() {
        let (registry, factory, _) = registry();
        let a = registry.get_site("http://sp/sites/a/", "http://sp/sites/a/").unwrap();
        let b = registry.get_site("http://sp/sites/a", "http://sp/sites/a").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(a.is_site_collection());
        assert_eq!(a.site_doc_id().as_str(), "http://sp/sites/a");
    }

    #[test]
    fn test_handle_registers_host() {
        let (registry, _, auth) = registry();
        registry.get_site("http://sp:8080/sites/a", "http://sp:8080/sites/a/sub").unwrap();
        assert!(auth.is_permitted_host(&Url::parse("http://sp:8080/").unwrap()));
        assert!(!auth.is_permitted_host(&Url::parse("http://sp/").unwrap()));
    }

    #[test]
    fn test_sub_web_handle() {
        let (registry, _, _) = registry();
        let web = registry.get_site("http://sp/sites/a", "http://sp/sites/a/sub").unwrap();
        assert!(!web.is_site_collection());
        assert_eq!(web.parent_web_url().as_deref(), Some("http://sp/sites/a"));
        assert_eq!(web.encode_doc_id("Lists/Tasks").as_str(), "http://sp/sites/a/sub/Lists/Tasks");
    }

    #[tokio::test]
    async fn test_racing_creation_converges() {
        let (registry, _, _) = registry();
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_site("http://sp/sites/race", "http://sp/sites/race").unwrap()
            }));
        }
        let mut sites = Vec::new();
        for handle in handles {
            sites.push(handle.await.unwrap());
        }
        assert!(sites.iter().all(|s| Arc::ptr_eq(s, &sites[0])));
        assert_eq!(registry.len(), 1);
    }
}
