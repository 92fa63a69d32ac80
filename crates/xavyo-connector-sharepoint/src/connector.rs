//! Crawl orchestration: full enumeration, incremental cycles and per-document
//! content.
//!
//! In virtual server mode the root document lists every site collection and
//! change tracking runs per content database. In site collection mode the
//! root document does not exist and the site collection itself is the only
//! change scope.

use chrono::FixedOffset;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;
use tracing::{debug, error, info, instrument, warn};

use crate::acl::{DocId, SITE_COLLECTION_ADMIN_FRAGMENT};
use crate::auth::AuthContext;
use crate::changes::ChangeSet;
use crate::claims::decode_claim;
use crate::client::ClientFactory;
use crate::config::{SharePointConfig, SharePointUrl};
use crate::cursor_store::CursorStore;
use crate::dates::{parse_list_last_modified, parse_modified, utc};
use crate::error::{SharePointError, SharePointResult};
use crate::groups::{GroupDefinitions, MemberIdLoader, PrincipalNamer, SiteUserLoader};
use crate::identity_cache::IdentityCache;
use crate::listing::{LinkListing, ObjectType, CONTENT_TYPE};
use crate::metadata::{
    add_row_metadata, METADATA_LIST_GUID, METADATA_OBJECT_TYPE, METADATA_PARENT_WEB_TITLE,
};
use crate::model::{SiteGroup, VirtualServer};
use crate::permissions::FULL_READ_PERMISSION_MASK;
use crate::pusher::{DocIdPusher, Record};
use crate::redirect::RedirectResolver;
use crate::rare_cache::{CachedList, CachedWeb, RareModCache};
use crate::registry::{SiteHandle, SiteRegistry};
use crate::resolver::{item_scope_id, AclResolver};
use crate::response::{DocContent, DocRequest, DocResponse};
use crate::tracker::ChangeTracker;
use crate::url::{canonical_url, encode_sharepoint_url, parent_web_url, root_url, sp_url_to_uri};
use crate::worker::WorkerPool;

const OWS_MODIFIED: &str = "ows_Modified";
const OWS_SERVER_URL: &str = "ows_ServerUrl";
const OWS_FS_OBJ_TYPE: &str = "ows_FSObjType";
const OWS_CONTENT_TYPE_ID: &str = "ows_ContentTypeId";
const OWS_FILE_REF: &str = "ows_FileRef";
const OWS_TITLE: &str = "ows_Title";

const CONTENT_TYPE_ID_DOCUMENT_PREFIX: &str = "0x0101";
const FILE_REF_LIST_ITEM_SUFFIX: &str = "_.000";

/// How the crawl account appears in the web application policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyCheck {
    NotInPolicy,
    /// Listed with a grant other than exactly "Full Read".
    OtherThanFullRead,
    FullRead,
}

/// Looks up `username` in the policy of `vs`.
///
/// Forms accounts are listed as `provider:user`; the provider is ignored.
pub fn check_full_read_policy(vs: &VirtualServer, username: &str) -> PolicyCheck {
    let policy_user = vs.policy.iter().find(|policy_user| {
        let Ok(name) = decode_claim(&policy_user.login_name, &policy_user.login_name) else {
            return false;
        };
        let name = name.split_once(':').map_or(name.as_str(), |(_, user)| user);
        name.eq_ignore_ascii_case(username)
    });
    match policy_user {
        None => PolicyCheck::NotInPolicy,
        Some(user) if user.grant_mask == FULL_READ_PERMISSION_MASK => PolicyCheck::FullRead,
        Some(_) => PolicyCheck::OtherThanFullRead,
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = SharePointResult<T>>,
) -> SharePointResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SharePointError::Cancelled),
        result = operation => result,
    }
}

/// SharePoint connector.
pub struct SharePointConnector {
    config: SharePointConfig,
    urls: SharePointUrl,
    registry: Arc<SiteRegistry>,
    resolver: AclResolver,
    namer: PrincipalNamer,
    tracker: ChangeTracker,
    pool: WorkerPool,
    pusher: Arc<dyn DocIdPusher>,
    redirects: Option<RedirectResolver>,
    zone: FixedOffset,
}

impl std::fmt::Debug for SharePointConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharePointConnector")
            .field("urls", &self.urls)
            .field("sites", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl SharePointConnector {
    /// Validates `config`, builds the connector and checks that the server
    /// answers.
    ///
    /// In virtual server mode a failure to fetch the virtual server aborts
    /// initialization. In site collection mode the configured URL is
    /// replaced by the exact site collection URL the server reports.
    #[instrument(skip_all, fields(server_url = %config.server_url))]
    pub async fn init(
        config: SharePointConfig,
        factory: Arc<dyn ClientFactory>,
        pusher: Arc<dyn DocIdPusher>,
        store: Arc<dyn CursorStore>,
    ) -> SharePointResult<Self> {
        config.validate()?;
        let mut urls = SharePointUrl::from_config(&config)?;

        let mut namer = PrincipalNamer::new(&config.default_namespace);
        if let Some(lookup) = &config.sid_lookup {
            let sids = factory.sid_resolver(lookup)?.ok_or_else(|| {
                SharePointError::Config(format!(
                    "sid_lookup is configured for {} but no directory client is available",
                    lookup.host
                ))
            })?;
            info!(host = %lookup.host, port = lookup.port, "Resolving domain group SIDs through directory");
            namer = namer.with_sid_resolver(sids);
        }

        let auth = Arc::new(AuthContext::from_config(&config));
        auth.permit_host(&sp_url_to_uri(urls.virtual_server_url())?)?;
        let registry = Arc::new(SiteRegistry::new(factory, auth));
        let pool = WorkerPool::new(&config.worker_pool);
        let redirects = config
            .effective_max_redirects()?
            .map(|max| {
                RedirectResolver::new(
                    registry.auth().clone(),
                    max,
                    config.connect_timeout(),
                    config.read_timeout(),
                )
            })
            .transpose()?;

        let identities = IdentityCache::from_config(
            &config,
            Arc::new(MemberIdLoader::new(registry.clone(), namer.clone())),
            Arc::new(SiteUserLoader::new(registry.clone(), namer.clone())),
            pool.clone(),
        );
        let rare = Arc::new(RareModCache::new(config.rare_cache_ttl()));
        let tracker = ChangeTracker::load(store).await?;

        if urls.is_site_collection_only() {
            let handle = registry.get_site(urls.sharepoint_url(), urls.sharepoint_url())?;
            let site = handle.site_data().get_content_site().await.map_err(|e| {
                error!(error = %e, "Unable to fetch site collection");
                e
            })?;
            let site_url = canonical_url(&site.url);
            if !site_url.is_empty() && site_url != urls.sharepoint_url() {
                info!(configured = %urls.sharepoint_url(), actual = %site_url, "Using site collection URL reported by server");
                urls = SharePointUrl::new(&site_url, Some(true), &[])?;
            }
        } else {
            let root = registry.get_site(urls.virtual_server_url(), urls.virtual_server_url())?;
            let vs = root.site_data().get_content_virtual_server().await.map_err(|e| {
                error!(error = %e, "Unable to fetch virtual server");
                e
            })?;
            if !config.username.is_empty() {
                match check_full_read_policy(&vs, &config.username) {
                    PolicyCheck::FullRead => debug!("Crawl account has full read policy"),
                    PolicyCheck::OtherThanFullRead => warn!(
                        username = %config.username,
                        "Crawl account policy differs from full read; crawling may be affected"
                    ),
                    PolicyCheck::NotInPolicy => info!(
                        username = %config.username,
                        "Crawl account not found in web application policy"
                    ),
                }
            }
        }

        let resolver = AclResolver::new(
            identities,
            rare,
            namer.clone(),
            urls.is_site_collection_only(),
            config.honor_read_security,
        );
        info!(
            sharepoint_url = %urls.sharepoint_url(),
            site_collection_only = urls.is_site_collection_only(),
            "SharePoint connector initialized"
        );
        Ok(Self {
            config,
            urls,
            registry,
            resolver,
            namer,
            tracker,
            pool,
            pusher,
            redirects,
            zone: utc(),
        })
    }

    /// Zone the server reports timestamps in.
    #[must_use]
    pub fn with_time_zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }

    pub fn config(&self) -> &SharePointConfig {
        &self.config
    }

    pub fn urls(&self) -> &SharePointUrl {
        &self.urls
    }

    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &AclResolver {
        &self.resolver
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Final location of `url`.
    ///
    /// In lenient mode redirects are followed up to the configured bound and
    /// `None` means the server has no such URL. Otherwise the URL is only
    /// encoded.
    pub async fn resolve_content_url(&self, url: &str) -> SharePointResult<Option<Url>> {
        match &self.redirects {
            Some(redirects) => redirects.resolve(url).await,
            None => encode_sharepoint_url(url, false).map(Some),
        }
    }

    fn root_site(&self) -> SharePointResult<Arc<SiteHandle>> {
        let root = self.urls.virtual_server_url();
        self.registry.get_site(root, root)
    }

    fn site_collection(&self) -> SharePointResult<Arc<SiteHandle>> {
        let site = self.urls.sharepoint_url();
        self.registry.get_site(site, site)
    }

    /// Pushes every top-level document id and all group definitions.
    #[instrument(skip_all)]
    pub async fn get_doc_ids(&self, cancel: &CancellationToken) -> SharePointResult<()> {
        if self.urls.is_site_collection_only() {
            let site = self.site_collection()?;
            let data = cancellable(cancel, site.site_data().get_content_site()).await?;
            self.pusher.push_doc_ids(vec![site.site_doc_id()]).await?;
            let definitions = self.namer.members_for_groups(&data.groups, site.site_url()).await;
            self.pusher.push_group_definitions(definitions, false).await?;
            info!(site_url = %site.site_url(), "Full enumeration finished");
            return Ok(());
        }

        let root = self.root_site()?;
        self.pusher.push_doc_ids(vec![DocId::root()]).await?;
        let vs = cancellable(cancel, root.site_data().get_content_virtual_server()).await?;

        let mut definitions = GroupDefinitions::new();
        let mut excluded = BTreeSet::new();
        let mut sites = 0usize;
        for db_id in &vs.content_database_ids {
            let db = match cancellable(cancel, root.site_data().get_content_content_database(db_id, true)).await {
                Ok(db) => db,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(content_database = %db_id, error = %e, "Failed to list sites of content database");
                    continue;
                }
            };
            for raw_url in &db.site_urls {
                let site_url = canonical_url(raw_url);
                if !self.urls.is_site_collection_included(&site_url) {
                    excluded.insert(site_url);
                    continue;
                }
                let site = self.registry.get_site(&site_url, &site_url)?;
                let data = match cancellable(cancel, site.site_data().get_content_site()).await {
                    Ok(data) => data,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(site_url = %site_url, error = %e, "Failed to fetch site collection groups");
                        continue;
                    }
                };
                sites += 1;
                definitions.extend(self.namer.members_for_groups(&data.groups, site.site_url()).await);
                if definitions.len() >= self.config.feed_max_urls {
                    self.pusher
                        .push_group_definitions(std::mem::take(&mut definitions), false)
                        .await?;
                }
            }
        }
        if !excluded.is_empty() {
            info!(excluded = ?excluded, "Site collections excluded from enumeration");
        }
        if !definitions.is_empty() {
            self.pusher.push_group_definitions(definitions, false).await?;
        }
        info!(sites, "Full enumeration finished");
        Ok(())
    }

    /// Runs one incremental cycle.
    ///
    /// Changes gathered before a cancellation are still pushed, then
    /// `Cancelled` is returned. Cursors only ever cover pages whose changes
    /// are part of this cycle's push.
    #[instrument(skip_all)]
    pub async fn get_modified_doc_ids(&self, cancel: &CancellationToken) -> SharePointResult<()> {
        let (changes, interrupted) = if self.urls.is_site_collection_only() {
            self.poll_site_collection(cancel).await?
        } else {
            self.poll_virtual_server(cancel).await?
        };
        self.push_changes(&changes).await?;
        match interrupted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn poll_virtual_server(
        &self,
        cancel: &CancellationToken,
    ) -> SharePointResult<(ChangeSet, Option<SharePointError>)> {
        let root = self.root_site()?;
        let reported: BTreeSet<String> =
            match cancellable(cancel, root.site_data().get_content_virtual_server()).await {
                Ok(vs) => vs.content_database_ids.into_iter().collect(),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Failed to fetch virtual server, polling known content databases");
                    self.tracker.known_scopes()
                }
            };

        let delta = self.tracker.reconcile(&reported);
        let mut changes = ChangeSet::default();
        if delta.is_changed() {
            info!(added = ?delta.added, removed = ?delta.removed, "Content databases changed");
            changes.changed.insert(DocId::root());
        }
        self.tracker.forget(&delta.removed).await?;

        for scope in &delta.added {
            let db = match cancellable(cancel, root.site_data().get_content_content_database(scope, true)).await {
                Ok(db) => db,
                Err(e) if e.is_cancelled() => return Ok((changes, Some(e))),
                Err(e) => {
                    warn!(content_database = %scope, error = %e, "Failed to fetch new content database");
                    continue;
                }
            };
            for raw_url in &db.site_urls {
                let site_url = canonical_url(raw_url);
                if self.urls.is_site_collection_included(&site_url) {
                    changes.changed.insert(DocId::new(site_url.clone()));
                    changes.sites.insert(site_url);
                }
            }
            self.tracker.seed(scope, &db.change_id).await?;
        }

        let urls = &self.urls;
        let is_included = |url: &str| urls.is_site_collection_included(url);
        for scope in &delta.retained {
            let Some(cursor) = self.tracker.cursor(scope) else {
                continue;
            };
            let mut paginator =
                match cancellable(cancel, root.site_data().get_changes_content_database(scope, &cursor)).await {
                    Ok(paginator) => paginator,
                    Err(e) if e.is_cancelled() => return Ok((changes, Some(e))),
                    Err(e) => {
                        warn!(content_database = %scope, error = %e, "Failed to open change feed");
                        continue;
                    }
                };
            let outcome = self
                .tracker
                .poll(scope, paginator.as_mut(), &is_included, cancel)
                .await;
            changes.extend(outcome.changes);
            if outcome.cancelled {
                return Ok((changes, Some(SharePointError::Cancelled)));
            }
            if let Some(e) = outcome.error {
                warn!(content_database = %scope, error = %e, "Change poll ended early");
            }
        }
        Ok((changes, None))
    }

    async fn poll_site_collection(
        &self,
        cancel: &CancellationToken,
    ) -> SharePointResult<(ChangeSet, Option<SharePointError>)> {
        let site = self.site_collection()?;
        let data = cancellable(cancel, site.site_data().get_content_site()).await?;

        let scopes = BTreeSet::from([data.id.clone()]);
        self.tracker.forget(&self.tracker.reconcile(&scopes).removed).await?;
        if self.tracker.seed(&data.id, &data.change_id).await? {
            info!(site_url = %site.site_url(), "Seeded site collection change cursor");
        }
        let Some(cursor) = self.tracker.cursor(&data.id) else {
            return Ok((ChangeSet::default(), None));
        };

        let mut paginator = cancellable(cancel, site.site_data().get_changes_site(&data.id, &cursor)).await?;
        let urls = &self.urls;
        let is_included = |url: &str| urls.is_site_collection_included(url);
        let outcome = self
            .tracker
            .poll(&data.id, paginator.as_mut(), &is_included, cancel)
            .await;
        if let Some(e) = &outcome.error {
            warn!(site_url = %site.site_url(), error = %e, "Change poll ended early");
        }
        let interrupted = outcome.cancelled.then_some(SharePointError::Cancelled);
        Ok((outcome.changes, interrupted))
    }

    async fn push_changes(&self, changes: &ChangeSet) -> SharePointResult<()> {
        for site_url in &changes.sites {
            match sp_url_to_uri(site_url) {
                Ok(uri) => self.registry.auth().permit_host(&uri)?,
                Err(e) => warn!(site_url = %site_url, error = %e, "Skipping host of malformed site URL"),
            }
        }
        if !changes.changed.is_empty() {
            let records: Vec<Record> = changes
                .changed
                .iter()
                .cloned()
                .map(|doc_id| Record::new(doc_id).crawl_immediately())
                .collect();
            info!(count = records.len(), "Pushing changed documents");
            self.pusher.push_records(records).await?;
        }

        let mut definitions = GroupDefinitions::new();
        for site_url in &changes.security_changed {
            self.resolver.identities().invalidate(site_url).await;
            let site = self.registry.get_site(site_url, site_url)?;
            match site.site_data().get_content_site().await {
                Ok(data) => definitions.extend(self.namer.members_for_groups(&data.groups, site.site_url()).await),
                Err(e) => warn!(site_url = %site_url, error = %e, "Failed to fetch groups of changed site"),
            }
            if definitions.len() >= self.config.feed_max_urls {
                self.pusher
                    .push_group_definitions(std::mem::take(&mut definitions), false)
                    .await?;
            }
        }
        if !definitions.is_empty() {
            self.pusher.push_group_definitions(definitions, false).await?;
        }
        Ok(())
    }

    /// Produces the response for one document.
    ///
    /// Documents that cannot be resolved yield a not-found response; other
    /// failures are returned for this document only.
    #[instrument(skip_all, fields(doc_id = %request.doc_id))]
    pub async fn get_doc_content(&self, request: &DocRequest) -> SharePointResult<DocResponse> {
        let result = if request.doc_id.is_root() {
            if self.urls.is_site_collection_only() {
                debug!("No root document in site collection mode");
                return Ok(DocResponse::not_found());
            }
            self.virtual_server_content(request).await
        } else {
            match self.site_for_doc_id(&request.doc_id).await {
                Ok(Some(site)) => self.site_content(&site, request).await,
                Ok(None) => return Ok(DocResponse::not_found()),
                Err(e) => Err(e),
            }
        };
        match result {
            Err(SharePointError::NotFound(what)) => {
                debug!(what = %what, "Responding not found");
                Ok(DocResponse::not_found())
            }
            other => other,
        }
    }

    /// Finds the web holding `doc_id`, or `None` if it is outside the crawl.
    async fn site_for_doc_id(&self, doc_id: &DocId) -> SharePointResult<Option<Arc<SiteHandle>>> {
        let uri = match sp_url_to_uri(doc_id.as_str()) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(error = %e, "Malformed document id");
                return Ok(None);
            }
        };
        if !self.registry.auth().is_permitted_host(&uri) {
            warn!(url = %uri, "Host not permitted");
            return Ok(None);
        }
        let root_url = root_url(doc_id.as_str());
        let root = self.registry.get_site(&root_url, &root_url)?;
        let Some(location) = root.site_data().get_site_and_web(doc_id.as_str()).await? else {
            debug!("No site collection contains document");
            return Ok(None);
        };
        let site = self.registry.get_site(&location.site_url, &location.web_url)?;
        // Exact comparison; a casing mismatch would break the ACL chain.
        if self.urls.is_site_collection_only() && site.site_url() != self.urls.sharepoint_url() {
            debug!(site_url = %site.site_url(), "Document outside configured site collection");
            return Ok(None);
        }
        if !self.urls.is_site_collection_included(site.site_url()) {
            debug!(site_url = %site.site_url(), "Document outside included site collections");
            return Ok(None);
        }
        Ok(Some(site))
    }

    async fn virtual_server_content(&self, request: &DocRequest) -> SharePointResult<DocResponse> {
        let root = self.root_site()?;
        let vs = root.site_data().get_content_virtual_server().await?;
        let mut response = DocResponse {
            acl: Some(self.resolver.virtual_server_acl(&root, &vs).await?),
            ..DocResponse::default()
        };
        response.add_metadata(METADATA_OBJECT_TYPE, ObjectType::VirtualServer.as_str());

        let mut listing = LinkListing::new(&request.doc_id, ObjectType::VirtualServer, Some(vs.url.as_str()));
        listing.start_section(ObjectType::Site);
        let mut excluded = BTreeSet::new();
        for db_id in &vs.content_database_ids {
            let db = match root.site_data().get_content_content_database(db_id, true).await {
                Ok(db) => db,
                Err(e) => {
                    warn!(content_database = %db_id, error = %e, "Failed to list sites of content database");
                    continue;
                }
            };
            for raw_url in &db.site_urls {
                let site_url = canonical_url(raw_url);
                if !self.urls.is_site_collection_included(&site_url) {
                    excluded.insert(site_url);
                    continue;
                }
                listing.add_link(&DocId::new(site_url), None);
            }
        }
        if !excluded.is_empty() {
            info!(excluded = ?excluded, "Site collections excluded from root listing");
        }
        response.content_type = Some(CONTENT_TYPE.to_string());
        response.content = DocContent::Body(listing.finish());
        Ok(response)
    }

    async fn site_content(&self, site: &SiteHandle, request: &DocRequest) -> SharePointResult<DocResponse> {
        let url = request.doc_id.as_str();
        if url.ends_with('/') {
            warn!("Document id ends with a slash");
            return Ok(DocResponse::not_found());
        }
        let Some(segments) = site.site_data().get_url_segments(url).await? else {
            if url.to_lowercase().ends_with(".aspx") {
                debug!("Standalone pages are not indexed");
            }
            return Ok(DocResponse::not_found());
        };
        match (segments.list_id, segments.item_id) {
            (Some(list_id), Some(item_id)) => self.item_content(site, request, &list_id, &item_id).await,
            (Some(list_id), None) => self.list_content(site, request, &list_id).await,
            (None, Some(item_id)) => {
                warn!(item_id = %item_id, "Item without a list");
                Ok(DocResponse::not_found())
            }
            (None, None) => self.web_content(site, request).await,
        }
    }

    /// True if the web or any web above it up to the site collection is
    /// marked no-index.
    async fn is_web_no_index(&self, site: &SiteHandle, web: &CachedWeb) -> SharePointResult<bool> {
        if web.no_index {
            return Ok(true);
        }
        let mut current = site.web_url().to_string();
        while current.len() > site.site_url().len() {
            let Some(parent_url) = parent_web_url(&current) else {
                break;
            };
            let parent = self.registry.get_site(site.site_url(), &parent_url)?;
            if self.resolver.rare().get_web(&parent).await?.no_index {
                return Ok(true);
            }
            current = parent_url;
        }
        Ok(false)
    }

    fn submit_background<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = SharePointResult<()>> + Send + 'static,
    {
        if let Err(e) = self.pool.submit(name, task) {
            warn!(task = name, error = %e, "Background push not scheduled");
        }
    }

    fn push_groups_in_background(&self, site_url: String, groups: Vec<SiteGroup>) {
        let pusher = self.pusher.clone();
        let namer = self.namer.clone();
        self.submit_background("push_site_groups", async move {
            let definitions = namer.members_for_groups(&groups, &site_url).await;
            pusher.push_group_definitions(definitions, false).await
        });
    }

    async fn web_content(&self, site: &SiteHandle, request: &DocRequest) -> SharePointResult<DocResponse> {
        let web = site.site_data().get_content_web().await?;
        let cached = self.resolver.rare().put_web(site.web_url(), &web).await;
        if self.is_web_no_index(site, &cached).await? {
            debug!("Web marked no-index");
            return Ok(DocResponse::not_found());
        }

        let mut response = DocResponse::default();
        if site.is_site_collection() {
            response.put_named_resource(SITE_COLLECTION_ADMIN_FRAGMENT, self.resolver.site_admin_acl(&web).await);
            let data = site.site_data().get_content_site().await?;
            self.push_groups_in_background(site.site_url().to_string(), data.groups);
        }

        if !self.resolver.web_allows_anonymous(site, &cached).await? {
            let parent_scope = if site.is_site_collection() {
                None
            } else {
                let parent_url = site
                    .parent_web_url()
                    .ok_or_else(|| SharePointError::AclChain(site.web_url().to_string()))?;
                let parent = self.registry.get_site(site.site_url(), &parent_url)?;
                Some(self.resolver.rare().get_web(&parent).await?.scope_id.clone())
            };
            response.acl = Some(self.resolver.web_acl(site, &web, parent_scope.as_deref()).await?);
        }

        response.add_metadata(METADATA_OBJECT_TYPE, ObjectType::Site.as_str());
        response.add_metadata(METADATA_PARENT_WEB_TITLE, web.title.clone());
        response.display_url = Some(sp_url_to_uri(&web.url)?.to_string());

        let mut listing = LinkListing::new(&request.doc_id, ObjectType::Site, Some(web.title.as_str()));
        if !web.child_web_urls.is_empty() {
            listing.start_section(ObjectType::Site);
            for child in &web.child_web_urls {
                let child = canonical_url(child);
                listing.add_link(&site.encode_doc_id(&child), Some(child.as_str()));
            }
        }
        if !web.lists.is_empty() {
            listing.start_section(ObjectType::List);
            for list in &web.lists {
                if list.default_view_url.is_empty() {
                    info!(list_id = %list.id, web_url = %site.web_url(), "Ignoring list without default view");
                    continue;
                }
                listing.add_link(&site.encode_doc_id(&list.default_view_url), Some(list.default_view_url.as_str()));
            }
        }
        if !web.folder_urls.is_empty() {
            listing.start_section(ObjectType::Folder);
            // "Lists" is always reported but never exists.
            for folder in web.folder_urls.iter().filter(|f| f.as_str() != "Lists") {
                listing.add_link(&site.encode_doc_id(folder), None);
            }
        }
        if !web.file_urls.is_empty() {
            listing.start_section(ObjectType::ListItem);
            for file in &web.file_urls {
                listing.add_link(&site.encode_doc_id(file), None);
            }
        }
        response.content_type = Some(CONTENT_TYPE.to_string());
        response.content = DocContent::Body(listing.finish());
        Ok(response)
    }

    async fn list_content(
        &self,
        site: &SiteHandle,
        request: &DocRequest,
        list_id: &str,
    ) -> SharePointResult<DocResponse> {
        let list = site.site_data().get_content_list(list_id).await?;
        let web = self.resolver.rare().get_web(site).await?;
        if list.no_index || self.is_web_no_index(site, &web).await? {
            debug!("List marked no-index");
            return Ok(DocResponse::not_found());
        }

        let mut response = DocResponse::default();
        if !self
            .resolver
            .list_allows_anonymous(site, &CachedList::from(&list), &web)
            .await?
        {
            let acls = self.resolver.list_acls(site, &list, &web.scope_id).await?;
            response.acl = Some(acls.acl);
            let pusher = self.pusher.clone();
            let resources = HashMap::from([(acls.root_folder, acls.root_folder_acl)]);
            self.submit_background("push_root_folder_acl", async move {
                pusher.push_named_resources(resources).await
            });
        }

        response.add_metadata(METADATA_OBJECT_TYPE, ObjectType::List.as_str());
        response.add_metadata(METADATA_PARENT_WEB_TITLE, web.title.clone());
        response.add_metadata(METADATA_LIST_GUID, list.id.clone());
        let display = if list.default_view_url == "/" {
            &list.root_folder
        } else {
            &list.default_view_url
        };
        response.display_url = Some(sp_url_to_uri(site.encode_doc_id(display).as_str())?.to_string());
        response.last_modified = parse_list_last_modified(&list.last_modified, &self.zone);
        if response.last_modified.is_none() {
            info!(value = %list.last_modified, "Could not parse list LastModified");
        }

        let mut listing = LinkListing::new(&request.doc_id, ObjectType::List, Some(list.title.as_str()));
        self.add_folder_children(site, list_id, "", &mut listing).await?;
        response.content_type = Some(CONTENT_TYPE.to_string());
        response.content = DocContent::Body(listing.finish());
        Ok(response)
    }

    async fn add_folder_children(
        &self,
        site: &SiteHandle,
        list_id: &str,
        folder_path: &str,
        listing: &mut LinkListing,
    ) -> SharePointResult<()> {
        let children = site.site_data().get_folder_children(list_id, folder_path).await?;
        listing.start_section(ObjectType::ListItem);
        for child in &children {
            listing.add_link(
                &site.encode_doc_id(&canonical_url(&child.server_url)),
                child.title.as_deref(),
            );
        }
        Ok(())
    }

    async fn item_content(
        &self,
        site: &SiteHandle,
        request: &DocRequest,
        list_id: &str,
        item_id: &str,
    ) -> SharePointResult<DocResponse> {
        let list = self.resolver.rare().get_list(site, list_id).await?;
        let web = self.resolver.rare().get_web(site).await?;
        if list.no_index || self.is_web_no_index(site, &web).await? {
            debug!("Item's list marked no-index");
            return Ok(DocResponse::not_found());
        }

        let item = site.site_data().get_content_item(list_id, item_id).await?;
        let doc_id = &request.doc_id;
        let mut response = DocResponse::default();
        let last_modified = item.row.get(OWS_MODIFIED).and_then(|value| {
            let parsed = parse_modified(value, &self.zone);
            if parsed.is_none() {
                info!(value = %value, "Could not parse ows_Modified");
            }
            parsed
        });
        response.last_modified = last_modified;

        let scope_id = item_scope_id(&item, doc_id)?;
        if !self
            .resolver
            .item_allows_anonymous(site, &list, &web, &scope_id)
            .await?
        {
            let item_acl = self.resolver.item_acl(site, list_id, &list, &item, doc_id).await?;
            response.acl = Some(item_acl.acl);
            for (fragment, acl) in item_acl.fragments {
                response.put_named_resource(fragment, acl);
            }
        }

        add_row_metadata(&mut response, &item.row);
        response.add_metadata(METADATA_PARENT_WEB_TITLE, web.title.clone());
        response.add_metadata(METADATA_LIST_GUID, list_id);
        let not_modified = request.can_respond_with_no_content(last_modified);
        let server_url = item.row.get(OWS_SERVER_URL).unwrap_or_default();

        if item.row.lookup_value(OWS_FS_OBJ_TYPE) == Some("1") {
            response.add_metadata(METADATA_OBJECT_TYPE, ObjectType::Folder.as_str());
            if server_url.contains(|c| matches!(c, '&' | '=' | '%')) {
                warn!(server_url = %server_url, "Folder URL cannot be used as a view parameter");
            } else {
                let mut display = sp_url_to_uri(site.encode_doc_id(&list.default_view_url).as_str())?;
                display.set_query(Some(&format!("RootFolder={server_url}")));
                response.display_url = Some(display.to_string());
            }
            if not_modified {
                response.content = DocContent::NotModified;
                return Ok(response);
            }
            let root = format!("{}/", site.encode_doc_id(&list.root_folder));
            let folder = site.encode_doc_id(server_url);
            let relative = folder.as_str().strip_prefix(root.as_str()).ok_or_else(|| {
                SharePointError::Remote(format!("folder {folder} is outside list root {root}"))
            })?;
            let mut listing = LinkListing::new(doc_id, ObjectType::Folder, item.row.get(OWS_TITLE));
            self.add_folder_children(site, list_id, relative, &mut listing).await?;
            listing.add_metadata(&response.metadata);
            response.content_type = Some(CONTENT_TYPE.to_string());
            response.content = DocContent::Body(listing.finish());
            return Ok(response);
        }

        let is_file = item
            .row
            .get(OWS_CONTENT_TYPE_ID)
            .is_some_and(|id| id.starts_with(CONTENT_TYPE_ID_DOCUMENT_PREFIX))
            || item
                .row
                .get(OWS_FILE_REF)
                .is_some_and(|file_ref| !file_ref.ends_with(FILE_REF_LIST_ITEM_SUFFIX));
        let kind = if is_file {
            let file = site.encode_doc_id(server_url);
            response.display_url = Some(sp_url_to_uri(file.as_str())?.to_string());
            ObjectType::Document
        } else {
            let mut display = sp_url_to_uri(site.encode_doc_id(&list.default_view_item_url).as_str())?;
            display.set_query(Some(&format!("ID={item_id}")));
            response.display_url = Some(display.to_string());
            ObjectType::ListItem
        };
        response.add_metadata(METADATA_OBJECT_TYPE, kind.as_str());
        if not_modified {
            response.content = DocContent::NotModified;
            return Ok(response);
        }

        let mut listing = LinkListing::new(doc_id, kind, item.row.get(OWS_TITLE));
        if is_file {
            listing.start_section(ObjectType::Document);
            listing.add_link(&site.encode_doc_id(server_url), None);
        }
        listing.add_metadata(&response.metadata);
        response.content_type = Some(CONTENT_TYPE.to_string());
        response.content = DocContent::Body(listing.finish());
        Ok(response)
    }

    /// Stops background work and drops per-session state.
    ///
    /// Returns false if background tasks were still running at the timeout.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> bool {
        let drained = self.pool.shutdown().await;
        self.resolver.rare().invalidate_all();
        self.registry.clear();
        self.registry.auth().clear();
        info!(drained, "SharePoint connector stopped");
        drained
    }
}
