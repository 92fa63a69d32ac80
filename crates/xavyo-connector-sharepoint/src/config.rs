//! SharePoint connector configuration.
//!
//! `SharePointConfig` is what operators write; `SharePointUrl` is the
//! deployment shape derived from it once validation passes.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{SharePointError, SharePointResult};
use crate::url::{canonical_url, path_depth, root_url, sp_url_to_uri};

/// Redirect bound used in lenient mode when none is configured.
pub const DEFAULT_MAX_REDIRECTS: u32 = 20;

/// Refresh and expiry of one identity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTiming {
    /// Entries older than this are reloaded in the background on access.
    #[serde(default = "default_refresh_after_secs")]
    pub refresh_after_secs: u64,
    /// Entries older than this are dropped and reloaded synchronously.
    #[serde(default = "default_expire_after_secs")]
    pub expire_after_secs: u64,
}

fn default_refresh_after_secs() -> u64 {
    30 * 60
}

fn default_expire_after_secs() -> u64 {
    45 * 60
}

impl Default for CacheTiming {
    fn default() -> Self {
        Self {
            refresh_after_secs: default_refresh_after_secs(),
            expire_after_secs: default_expire_after_secs(),
        }
    }
}

impl CacheTiming {
    pub fn new(refresh_after: Duration, expire_after: Duration) -> Self {
        Self {
            refresh_after_secs: refresh_after.as_secs(),
            expire_after_secs: expire_after.as_secs(),
        }
    }

    pub fn refresh_after(&self) -> Duration {
        Duration::from_secs(self.refresh_after_secs)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_after_secs)
    }

    fn validate(&self, name: &str) -> SharePointResult<()> {
        if self.expire_after_secs == 0 {
            return Err(SharePointError::Config(format!(
                "{name}: expire_after_secs must be positive"
            )));
        }
        if self.refresh_after_secs >= self.expire_after_secs {
            return Err(SharePointError::Config(format!(
                "{name}: refresh_after_secs must be shorter than expire_after_secs"
            )));
        }
        Ok(())
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_queued() -> usize {
    1000
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queued: default_max_queued(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// How the directory used for SID lookup is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidLookupMethod {
    #[default]
    Standard,
    Ssl,
}

/// Directory used to translate Windows group SIDs into account names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidLookupConfig {
    pub host: String,
    #[serde(default = "default_sid_lookup_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_password", skip_serializing)]
    pub password: SecretString,
    #[serde(default)]
    pub method: SidLookupMethod,
}

fn default_sid_lookup_port() -> u16 {
    3268
}

impl SidLookupConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_sid_lookup_port(),
            username: username.into(),
            password: SecretString::from(password.into()),
            method: SidLookupMethod::default(),
        }
    }

    fn validate(&self) -> SharePointResult<()> {
        if self.host.trim().is_empty() {
            return Err(SharePointError::Config("sid_lookup.host is required".to_string()));
        }
        if self.username.trim().is_empty() || self.password.expose_secret().is_empty() {
            return Err(SharePointError::Config(
                "sid_lookup requires a username and password".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(SharePointError::Config("sid_lookup.port must be positive".to_string()));
        }
        Ok(())
    }
}

/// Configuration for the SharePoint connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharePointConfig {
    /// Virtual server or site collection URL.
    pub server_url: String,

    /// Crawl a single site collection. Detected from the URL when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_collection_only: Option<bool>,

    /// Site collections to crawl; empty means all.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_site_list"
    )]
    pub site_collections_to_include: Vec<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default = "default_password", skip_serializing)]
    pub password: SecretString,

    /// Namespace for users and domain groups.
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Follow redirects manually and tolerate unencoded query strings.
    #[serde(default = "default_true")]
    pub lenient_url_rules: bool,

    /// Redirect bound in lenient mode. Must be unset otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_redirects_to_follow: Option<i64>,

    /// Apply per-item read security on lists that enable it.
    #[serde(default = "default_true")]
    pub honor_read_security: bool,

    #[serde(default)]
    pub member_id_cache: CacheTiming,

    #[serde(default)]
    pub site_user_cache: CacheTiming,

    /// TTL of cached web, list and virtual server metadata.
    #[serde(default = "default_rare_cache_ttl_secs")]
    pub rare_cache_ttl_secs: u64,

    /// Group definitions pushed per batch during full enumeration.
    #[serde(default = "default_feed_max_urls")]
    pub feed_max_urls: usize,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Translate domain group SIDs through a directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid_lookup: Option<SidLookupConfig>,
}

fn default_password() -> SecretString {
    SecretString::from(String::new())
}

fn default_namespace() -> String {
    "Default".to_string()
}

/// Accepts either a list of URLs or one comma separated string.
fn deserialize_site_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SiteList {
        Joined(String),
        List(Vec<String>),
    }

    let urls = match SiteList::deserialize(deserializer)? {
        SiteList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        SiteList::List(list) => list,
    };
    Ok(urls
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect())
}

fn default_true() -> bool {
    true
}

fn default_rare_cache_ttl_secs() -> u64 {
    5 * 60
}

fn default_feed_max_urls() -> usize {
    5000
}

fn default_timeout_secs() -> u64 {
    30
}

impl SharePointConfig {
    /// Create a config for `server_url` with defaults everywhere else.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            site_collection_only: None,
            site_collections_to_include: Vec::new(),
            username: String::new(),
            password: default_password(),
            default_namespace: default_namespace(),
            lenient_url_rules: true,
            max_redirects_to_follow: None,
            honor_read_security: true,
            member_id_cache: CacheTiming::default(),
            site_user_cache: CacheTiming::default(),
            rare_cache_ttl_secs: default_rare_cache_ttl_secs(),
            feed_max_urls: default_feed_max_urls(),
            worker_pool: WorkerPoolConfig::default(),
            connect_timeout_secs: default_timeout_secs(),
            read_timeout_secs: default_timeout_secs(),
            user_agent: None,
            sid_lookup: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = SecretString::from(password.into());
        self
    }

    pub fn with_site_collection_only(mut self, only: bool) -> Self {
        self.site_collection_only = Some(only);
        self
    }

    /// Set the include-list from a comma separated string.
    pub fn with_site_collections_to_include(mut self, list: &str) -> Self {
        self.site_collections_to_include = list.split(',').map(str::to_string).collect();
        self
    }

    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn with_lenient_url_rules(mut self, lenient: bool) -> Self {
        self.lenient_url_rules = lenient;
        self
    }

    pub fn with_max_redirects(mut self, max: i64) -> Self {
        self.max_redirects_to_follow = Some(max);
        self
    }

    pub fn with_read_security(mut self, honor: bool) -> Self {
        self.honor_read_security = honor;
        self
    }

    pub fn with_member_id_cache(mut self, timing: CacheTiming) -> Self {
        self.member_id_cache = timing;
        self
    }

    pub fn with_site_user_cache(mut self, timing: CacheTiming) -> Self {
        self.site_user_cache = timing;
        self
    }

    pub fn with_feed_max_urls(mut self, max: usize) -> Self {
        self.feed_max_urls = max;
        self
    }

    pub fn with_sid_lookup(mut self, sid_lookup: SidLookupConfig) -> Self {
        self.sid_lookup = Some(sid_lookup);
        self
    }

    pub fn with_worker_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.worker_pool = pool;
        self
    }

    pub fn rare_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rare_cache_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Redirect bound to apply, or `None` when redirects are left to the
    /// HTTP client.
    pub fn effective_max_redirects(&self) -> SharePointResult<Option<u32>> {
        match (self.lenient_url_rules, self.max_redirects_to_follow) {
            (true, None) => Ok(Some(DEFAULT_MAX_REDIRECTS)),
            (true, Some(max)) => u32::try_from(max).map(Some).map_err(|_| {
                SharePointError::Config(format!(
                    "max_redirects_to_follow must be a non-negative number, got {max}"
                ))
            }),
            (false, None) => Ok(None),
            (false, Some(_)) => Err(SharePointError::Config(
                "max_redirects_to_follow requires lenient_url_rules".to_string(),
            )),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SharePointResult<()> {
        if self.server_url.trim().is_empty() {
            return Err(SharePointError::Config("server_url is required".to_string()));
        }
        sp_url_to_uri(&self.server_url)
            .map_err(|e| SharePointError::Config(format!("invalid server_url: {e}")))?;
        self.effective_max_redirects()?;
        self.member_id_cache.validate("member_id_cache")?;
        self.site_user_cache.validate("site_user_cache")?;
        if self.feed_max_urls == 0 {
            return Err(SharePointError::Config(
                "feed_max_urls must be positive".to_string(),
            ));
        }
        if self.worker_pool.max_concurrent == 0 || self.worker_pool.max_queued == 0 {
            return Err(SharePointError::Config(
                "worker_pool sizes must be positive".to_string(),
            ));
        }
        if self.default_namespace.trim().is_empty() {
            return Err(SharePointError::Config(
                "default_namespace must not be empty".to_string(),
            ));
        }
        if let Some(sid_lookup) = &self.sid_lookup {
            sid_lookup.validate()?;
        }
        SharePointUrl::from_config(self)?;
        Ok(())
    }
}

/// Resolved deployment shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePointUrl {
    sharepoint_url: String,
    virtual_server_url: String,
    site_collection_only: bool,
    included_site_collections: BTreeSet<String>,
}

impl SharePointUrl {
    pub fn from_config(config: &SharePointConfig) -> SharePointResult<Self> {
        Self::new(
            &config.server_url,
            config.site_collection_only,
            &config.site_collections_to_include,
        )
    }

    pub fn new(
        server_url: &str,
        site_collection_only: Option<bool>,
        include: &[String],
    ) -> SharePointResult<Self> {
        let sharepoint_url = canonical_url(server_url.trim());
        let included_site_collections: BTreeSet<String> = include
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| canonical_url(&s.to_lowercase()))
            .collect();

        let is_root = path_depth(&sharepoint_url) <= 2;
        if !included_site_collections.is_empty() {
            if site_collection_only == Some(true) {
                return Err(SharePointError::Config(
                    "site_collections_to_include cannot be combined with site_collection_only"
                        .to_string(),
                ));
            }
            if !is_root {
                return Err(SharePointError::Config(format!(
                    "site_collections_to_include requires a virtual server URL, got {sharepoint_url}"
                )));
            }
        }

        Ok(Self {
            virtual_server_url: root_url(&sharepoint_url),
            site_collection_only: site_collection_only.unwrap_or(!is_root),
            sharepoint_url,
            included_site_collections,
        })
    }

    pub fn sharepoint_url(&self) -> &str {
        &self.sharepoint_url
    }

    pub fn virtual_server_url(&self) -> &str {
        &self.virtual_server_url
    }

    pub fn is_site_collection_only(&self) -> bool {
        self.site_collection_only
    }

    pub fn included_site_collections(&self) -> &BTreeSet<String> {
        &self.included_site_collections
    }

    /// Case-insensitive include-list check on the canonical URL.
    pub fn is_site_collection_included(&self, site_url: &str) -> bool {
        self.included_site_collections.is_empty()
            || self
                .included_site_collections
                .contains(&canonical_url(&site_url.to_lowercase()))
    }
}
