//! Common test utilities for SharePoint connector integration tests.
//!
//! Provides an in-memory SharePoint deployment behind the client traits,
//! plus helpers to build a connector against it.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use xavyo_connector_sharepoint::changes::{ChangeEntry, ChangeNode, ChangePage, ChangePaginator, ChangeState};
use xavyo_connector_sharepoint::model::{
    ContentDatabase, FolderChild, ItemData, List, PermissionGrant, PrincipalInfo, PrincipalType,
    Site, SiteAndWeb, SiteGroup, SiteUser, UrlSegments, UserDescription, VirtualServer, Web,
};
use xavyo_connector_sharepoint::{
    ClientFactory, CursorStore, PeopleClient, RecordingPusher, SharePointConfig, SharePointConnector,
    SharePointError, SharePointResult, SidLookupConfig, SidResolver, SiteClients, SiteDataClient,
    UserGroupClient,
};

pub const SERVER: &str = "http://sp.example.com";
pub const HR_SITE: &str = "http://sp.example.com/sites/hr";
pub const FINANCE_SITE: &str = "http://sp.example.com/sites/finance";

/// One page of a scripted change feed.
#[derive(Clone)]
pub struct ScriptedPage {
    /// Cursor the page is served from.
    pub from: String,
    /// Cursor after the page.
    pub to: String,
    pub result: Result<ChangeNode, String>,
    /// Token to cancel once the page has been served.
    pub cancel: Option<CancellationToken>,
}

/// Mutable state of a fake deployment.
#[derive(Default)]
pub struct DeploymentState {
    pub virtual_server: Option<VirtualServer>,
    pub content_databases: HashMap<String, ContentDatabase>,
    pub sites: HashMap<String, Site>,
    pub webs: HashMap<String, Web>,
    /// Keyed by web URL and list id.
    pub lists: HashMap<(String, String), List>,
    /// Keyed by list id and item id.
    pub items: HashMap<(String, String), ItemData>,
    /// Keyed by list id and folder path relative to the list root.
    pub folder_children: HashMap<(String, String), Vec<FolderChild>>,
    pub segments: HashMap<String, UrlSegments>,
    /// Keyed by site collection URL.
    pub site_users: HashMap<String, Vec<SiteUser>>,
    /// Keyed by login name.
    pub principals: HashMap<String, PrincipalInfo>,
    /// Keyed by content database id or site collection id.
    pub change_pages: HashMap<String, Vec<ScriptedPage>>,
    /// Directory accounts keyed by SID; `None` when no directory is reachable.
    pub directory: Option<HashMap<String, String>>,
}

/// In-memory SharePoint deployment recording every client call.
#[derive(Default)]
pub struct Deployment {
    pub state: Mutex<DeploymentState>,
    calls: Mutex<Vec<String>>,
}

impl Deployment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update(&self, f: impl FnOnce(&mut DeploymentState)) {
        f(&mut self.state.lock().unwrap());
    }

    fn read<T>(&self, f: impl FnOnce(&DeploymentState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn set_virtual_server(&self, vs: VirtualServer) {
        self.update(|s| s.virtual_server = Some(vs));
    }

    pub fn add_content_database(&self, id: &str, change_id: &str, site_urls: &[&str]) {
        self.update(|s| {
            s.content_databases.insert(
                id.to_string(),
                ContentDatabase {
                    id: id.to_string(),
                    change_id: change_id.to_string(),
                    site_urls: site_urls.iter().map(|u| u.to_string()).collect(),
                },
            );
            if let Some(vs) = s.virtual_server.as_mut() {
                if !vs.content_database_ids.iter().any(|db| db == id) {
                    vs.content_database_ids.push(id.to_string());
                }
            }
        });
    }

    pub fn add_site(&self, site: Site) {
        self.update(|s| {
            s.sites.insert(site.url.clone(), site);
        });
    }

    pub fn add_web(&self, web: Web) {
        self.update(|s| {
            s.webs.insert(web.url.clone(), web);
        });
    }

    pub fn add_list(&self, web_url: &str, list: List) {
        self.update(|s| {
            s.lists.insert((web_url.to_string(), list.id.clone()), list);
        });
    }

    pub fn add_item(&self, list_id: &str, item_id: &str, item: ItemData) {
        self.update(|s| {
            s.items.insert((list_id.to_string(), item_id.to_string()), item);
        });
    }

    pub fn add_segments(&self, url: &str, list_id: Option<&str>, item_id: Option<&str>) {
        self.update(|s| {
            s.segments.insert(
                url.to_string(),
                UrlSegments {
                    list_id: list_id.map(str::to_string),
                    item_id: item_id.map(str::to_string),
                },
            );
        });
    }

    pub fn set_site_users(&self, site_url: &str, users: Vec<SiteUser>) {
        self.update(|s| {
            s.site_users.insert(site_url.to_string(), users);
        });
    }

    pub fn add_change_page(&self, scope: &str, from: &str, to: &str, node: ChangeNode) {
        self.push_page(scope, ScriptedPage {
            from: from.to_string(),
            to: to.to_string(),
            result: Ok(node),
            cancel: None,
        });
    }

    pub fn add_failing_page(&self, scope: &str, from: &str, message: &str) {
        self.push_page(scope, ScriptedPage {
            from: from.to_string(),
            to: from.to_string(),
            result: Err(message.to_string()),
            cancel: None,
        });
    }

    pub fn push_page(&self, scope: &str, page: ScriptedPage) {
        self.update(|s| s.change_pages.entry(scope.to_string()).or_default().push(page));
    }

    /// Drops the scripted pages served from `from` in `scope`.
    pub fn remove_pages_from(&self, scope: &str, from: &str) {
        self.update(|s| {
            if let Some(pages) = s.change_pages.get_mut(scope) {
                pages.retain(|p| p.from != from);
            }
        });
    }

    /// Longest key of `keys` equal to `url` or a path prefix of it.
    fn longest_prefix<'a>(keys: impl Iterator<Item = &'a String>, url: &str) -> Option<String> {
        keys.filter(|key| url == key.as_str() || url.starts_with(&format!("{key}/")))
            .max_by_key(|key| key.len())
            .cloned()
    }
}

fn not_found(what: impl Into<String>) -> SharePointError {
    SharePointError::NotFound(what.into())
}

/// Site data client bound to one web of a [`Deployment`].
pub struct FakeSiteData {
    deployment: Arc<Deployment>,
    site_url: String,
    web_url: String,
}

#[async_trait]
impl SiteDataClient for FakeSiteData {
    async fn get_content_virtual_server(&self) -> SharePointResult<VirtualServer> {
        self.deployment.record(format!("get_content_virtual_server {}", self.web_url));
        self.deployment
            .read(|s| s.virtual_server.clone())
            .ok_or_else(|| SharePointError::Transport("connection refused".to_string()))
    }

    async fn get_content_content_database(&self, id: &str, _retrieve_children: bool) -> SharePointResult<ContentDatabase> {
        self.deployment.record(format!("get_content_content_database {id}"));
        self.deployment
            .read(|s| s.content_databases.get(id).cloned())
            .ok_or_else(|| not_found(id))
    }

    async fn get_content_site(&self) -> SharePointResult<Site> {
        self.deployment.record(format!("get_content_site {}", self.site_url));
        self.deployment
            .read(|s| s.sites.get(&self.site_url).cloned())
            .ok_or_else(|| not_found(&self.site_url))
    }

    async fn get_content_web(&self) -> SharePointResult<Web> {
        self.deployment.record(format!("get_content_web {}", self.web_url));
        self.deployment
            .read(|s| s.webs.get(&self.web_url).cloned())
            .ok_or_else(|| not_found(&self.web_url))
    }

    async fn get_content_list(&self, list_id: &str) -> SharePointResult<List> {
        self.deployment.record(format!("get_content_list {list_id}"));
        self.deployment
            .read(|s| s.lists.get(&(self.web_url.clone(), list_id.to_string())).cloned())
            .ok_or_else(|| not_found(list_id))
    }

    async fn get_content_item(&self, list_id: &str, item_id: &str) -> SharePointResult<ItemData> {
        self.deployment.record(format!("get_content_item {list_id} {item_id}"));
        self.deployment
            .read(|s| s.items.get(&(list_id.to_string(), item_id.to_string())).cloned())
            .ok_or_else(|| not_found(item_id))
    }

    async fn get_folder_children(&self, list_id: &str, folder_path: &str) -> SharePointResult<Vec<FolderChild>> {
        self.deployment.record(format!("get_folder_children {list_id} {folder_path}"));
        Ok(self.deployment.read(|s| {
            s.folder_children
                .get(&(list_id.to_string(), folder_path.to_string()))
                .cloned()
                .unwrap_or_default()
        }))
    }

    async fn get_url_segments(&self, url: &str) -> SharePointResult<Option<UrlSegments>> {
        self.deployment.record(format!("get_url_segments {url}"));
        Ok(self.deployment.read(|s| {
            if let Some(segments) = s.segments.get(url) {
                return Some(segments.clone());
            }
            // Webs resolve to neither a list nor an item.
            s.webs.contains_key(url).then(UrlSegments::default)
        }))
    }

    async fn get_site_and_web(&self, url: &str) -> SharePointResult<Option<SiteAndWeb>> {
        self.deployment.record(format!("get_site_and_web {url}"));
        Ok(self.deployment.read(|s| {
            let site_url = Deployment::longest_prefix(s.sites.keys(), url)?;
            let web_url = Deployment::longest_prefix(s.webs.keys(), url)?;
            Some(SiteAndWeb { site_url, web_url })
        }))
    }

    async fn get_changes_content_database(
        &self,
        content_database_id: &str,
        since: &str,
    ) -> SharePointResult<Box<dyn ChangePaginator>> {
        self.deployment
            .record(format!("get_changes_content_database {content_database_id} {since}"));
        Ok(Box::new(ScriptedFeed::new(self.deployment.clone(), content_database_id, since)))
    }

    async fn get_changes_site(&self, site_id: &str, since: &str) -> SharePointResult<Box<dyn ChangePaginator>> {
        self.deployment.record(format!("get_changes_site {site_id} {since}"));
        Ok(Box::new(ScriptedFeed::new(self.deployment.clone(), site_id, since)))
    }
}

/// Walks the scripted pages of a scope by following their cursors.
pub struct ScriptedFeed {
    deployment: Arc<Deployment>,
    scope: String,
    cursor: String,
}

impl ScriptedFeed {
    fn new(deployment: Arc<Deployment>, scope: &str, since: &str) -> Self {
        Self {
            deployment,
            scope: scope.to_string(),
            cursor: since.to_string(),
        }
    }
}

#[async_trait]
impl ChangePaginator for ScriptedFeed {
    async fn next_page(&mut self) -> SharePointResult<Option<ChangePage>> {
        let page = self.deployment.read(|s| {
            s.change_pages
                .get(&self.scope)
                .and_then(|pages| pages.iter().find(|p| p.from == self.cursor).cloned())
        });
        let Some(page) = page else {
            return Ok(None);
        };
        self.deployment
            .record(format!("change_page {} {}", self.scope, page.from));
        let node = page.result.map_err(SharePointError::Transport)?;
        self.cursor = page.to;
        if let Some(cancel) = page.cancel {
            cancel.cancel();
        }
        Ok(Some(ChangePage::Changes(node)))
    }

    fn cursor(&self) -> &str {
        &self.cursor
    }
}

pub struct FakeUserGroup {
    deployment: Arc<Deployment>,
    site_url: String,
}

#[async_trait]
impl UserGroupClient for FakeUserGroup {
    async fn get_user_collection_from_site(&self) -> SharePointResult<Vec<SiteUser>> {
        self.deployment
            .record(format!("get_user_collection_from_site {}", self.site_url));
        Ok(self
            .deployment
            .read(|s| s.site_users.get(&self.site_url).cloned().unwrap_or_default()))
    }
}

pub struct FakePeople {
    deployment: Arc<Deployment>,
}

#[async_trait]
impl PeopleClient for FakePeople {
    async fn resolve_principals(&self, login_names: &[String]) -> SharePointResult<Vec<PrincipalInfo>> {
        self.deployment.record(format!("resolve_principals {}", login_names.len()));
        Ok(self.deployment.read(|s| {
            login_names
                .iter()
                .map(|login| {
                    s.principals.get(login).cloned().unwrap_or(PrincipalInfo {
                        account_name: login.clone(),
                        display_name: login.clone(),
                        principal_type: PrincipalType::None,
                        is_resolved: false,
                    })
                })
                .collect()
        }))
    }
}

/// Directory answering SID lookups from [`DeploymentState::directory`].
pub struct FakeDirectory {
    deployment: Arc<Deployment>,
}

#[async_trait]
impl SidResolver for FakeDirectory {
    async fn account_for_sid(&self, sid: &str) -> SharePointResult<Option<String>> {
        self.deployment.record(format!("sid {sid}"));
        Ok(self.deployment.read(|s| {
            s.directory
                .as_ref()
                .and_then(|accounts| accounts.get(sid).cloned())
        }))
    }
}

/// Builds fake clients for any web of a [`Deployment`].
pub struct FakeFactory {
    deployment: Arc<Deployment>,
}

impl FakeFactory {
    pub fn new(deployment: Arc<Deployment>) -> Arc<Self> {
        Arc::new(Self { deployment })
    }
}

impl ClientFactory for FakeFactory {
    fn create(&self, site_url: &str, web_url: &str, _endpoint: &Url) -> SharePointResult<SiteClients> {
        self.deployment.record(format!("create {web_url}"));
        Ok(SiteClients {
            site_data: Arc::new(FakeSiteData {
                deployment: self.deployment.clone(),
                site_url: site_url.to_string(),
                web_url: web_url.to_string(),
            }),
            user_group: Arc::new(FakeUserGroup {
                deployment: self.deployment.clone(),
                site_url: site_url.to_string(),
            }),
            people: Arc::new(FakePeople {
                deployment: self.deployment.clone(),
            }),
        })
    }

    fn sid_resolver(&self, _config: &SidLookupConfig) -> SharePointResult<Option<Arc<dyn SidResolver>>> {
        if self.deployment.read(|s| s.directory.is_none()) {
            return Ok(None);
        }
        Ok(Some(Arc::new(FakeDirectory {
            deployment: self.deployment.clone(),
        })))
    }
}

/// A connector wired to a fake deployment and a recording pusher.
pub struct Harness {
    pub deployment: Arc<Deployment>,
    pub pusher: Arc<RecordingPusher>,
    pub connector: SharePointConnector,
}

pub async fn connect(
    config: SharePointConfig,
    deployment: Arc<Deployment>,
    store: Arc<dyn CursorStore>,
) -> SharePointResult<Harness> {
    let pusher = Arc::new(RecordingPusher::new());
    let connector = SharePointConnector::init(
        config,
        FakeFactory::new(deployment.clone()),
        pusher.clone(),
        store,
    )
    .await?;
    Ok(Harness {
        deployment,
        pusher,
        connector,
    })
}

pub fn user(id: i32, login: &str) -> UserDescription {
    UserDescription {
        id,
        name: login.rsplit('\\').next().unwrap_or(login).to_string(),
        login_name: format!("i:0#.w|{login}"),
        is_domain_group: false,
        is_site_admin: false,
    }
}

pub fn site_admin(id: i32, login: &str) -> UserDescription {
    UserDescription {
        is_site_admin: true,
        ..user(id, login)
    }
}

pub fn site(id: &str, url: &str, change_id: &str) -> Site {
    Site {
        id: id.to_string(),
        url: url.to_string(),
        change_id: change_id.to_string(),
        groups: vec![SiteGroup {
            id: 50,
            name: "Members".to_string(),
            users: vec![user(11, "CORP\\member")],
        }],
    }
}

pub fn web(url: &str, title: &str, scope_id: &str) -> Web {
    Web {
        url: url.to_string(),
        title: title.to_string(),
        scope_id: scope_id.to_string(),
        ..Web::default()
    }
}

pub fn grant(member_id: i32, mask: u64) -> PermissionGrant {
    PermissionGrant::new(member_id, mask)
}

/// A virtual server with one content database holding the HR and finance
/// site collections.
pub fn standard_deployment() -> Arc<Deployment> {
    let deployment = Deployment::new();
    deployment.set_virtual_server(VirtualServer {
        url: SERVER.to_string(),
        ..VirtualServer::default()
    });
    deployment.add_content_database("db1", "c1-0", &[HR_SITE, FINANCE_SITE]);
    deployment.add_site(site("hr-id", HR_SITE, "s-hr-0"));
    deployment.add_site(site("fin-id", FINANCE_SITE, "s-fin-0"));
    deployment.add_web(Web {
        users: vec![site_admin(1, "CORP\\admin"), user(11, "CORP\\member")],
        ..web(HR_SITE, "Human Resources", "{HR-SCOPE}")
    });
    deployment.add_web(web(FINANCE_SITE, "Finance", "{FIN-SCOPE}"));
    deployment
}

pub fn entry(change: &str, url: &str, children: Vec<ChangeNode>) -> ChangeEntry {
    ChangeEntry {
        change: ChangeState::parse(change),
        server_url: SERVER.to_string(),
        display_url: url.trim_start_matches(SERVER).to_string(),
        children,
    }
}

/// A content database page with one site change holding `children`.
pub fn site_page(site_url: &str, site_change: &str, children: Vec<ChangeNode>) -> ChangeNode {
    ChangeNode::ContentDatabase(entry(
        "Unchanged",
        "",
        vec![ChangeNode::Site(entry(site_change, site_url, children))],
    ))
}

pub fn list_change(change: &str, url: &str) -> ChangeNode {
    ChangeNode::List(entry(change, url, Vec::new()))
}
