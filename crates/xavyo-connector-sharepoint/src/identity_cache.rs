//! Refreshing caches of member id mappings.
//!
//! Each site collection has two mappings: one built from the web's users and
//! its SharePoint groups, one from the full site user collection. Entries go
//! stale after `refresh_after` and are reloaded in the background on the next
//! access; after `expire_after` they are dropped and reloaded synchronously.

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::config::SharePointConfig;
use crate::error::{SharePointError, SharePointResult};
use crate::member_mapping::MemberIdMapping;
use crate::worker::WorkerPool;

/// Loads a complete member id mapping for a site collection.
#[async_trait]
pub trait MappingLoader: Send + Sync {
    async fn load(&self, site_url: &str) -> SharePointResult<MemberIdMapping>;
}

#[derive(Debug)]
struct Snapshot {
    mapping: Arc<MemberIdMapping>,
    loaded_at: Instant,
}

impl Snapshot {
    fn new(mapping: MemberIdMapping) -> Self {
        Self {
            mapping: Arc::new(mapping),
            loaded_at: Instant::now(),
        }
    }
}

struct MappingCacheInner {
    name: &'static str,
    loader: Arc<dyn MappingLoader>,
    entries: Cache<String, Arc<Snapshot>>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    background: DashMap<String, ()>,
    refresh_after: Duration,
    pool: WorkerPool,
}

impl MappingCacheInner {
    async fn snapshot(&self, site_url: &str) -> SharePointResult<Arc<Snapshot>> {
        let loader = self.loader.clone();
        let key = site_url.to_string();
        self.entries
            .try_get_with(key.clone(), async move {
                let mapping = loader.load(&key).await?;
                Ok::<_, SharePointError>(Arc::new(Snapshot::new(mapping)))
            })
            .await
            .map_err(|e| SharePointError::MappingLoad {
                site_url: site_url.to_string(),
                message: e.to_string(),
            })
    }

    /// Reloads unless another caller already replaced `observed`.
    async fn refresh(
        &self,
        site_url: &str,
        observed: &Arc<MemberIdMapping>,
    ) -> SharePointResult<Arc<MemberIdMapping>> {
        let lock = self
            .refresh_locks
            .entry(site_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.reload_unless_replaced(site_url, observed).await
        };
        // Only the map and this caller hold the lock when nobody else waits.
        self.refresh_locks
            .remove_if(site_url, |_, held| Arc::strong_count(held) <= 2);
        result
    }

    async fn reload_unless_replaced(
        &self,
        site_url: &str,
        observed: &Arc<MemberIdMapping>,
    ) -> SharePointResult<Arc<MemberIdMapping>> {
        if let Some(current) = self.entries.get(site_url).await {
            if !Arc::ptr_eq(&current.mapping, observed) {
                debug!(cache = self.name, site_url = %site_url, "Mapping already refreshed");
                return Ok(current.mapping.clone());
            }
        }

        let mapping = self
            .loader
            .load(site_url)
            .await
            .map_err(|e| SharePointError::MappingLoad {
                site_url: site_url.to_string(),
                message: e.to_string(),
            })?;
        let snapshot = Arc::new(Snapshot::new(mapping));
        self.entries
            .insert(site_url.to_string(), snapshot.clone())
            .await;
        debug!(cache = self.name, site_url = %site_url, members = snapshot.mapping.len(), "Mapping reloaded");
        Ok(snapshot.mapping.clone())
    }
}

/// One refreshing cache of member id mappings keyed by site collection URL.
#[derive(Clone)]
pub struct MappingCache {
    inner: Arc<MappingCacheInner>,
}

impl MappingCache {
    pub fn new(
        name: &'static str,
        loader: Arc<dyn MappingLoader>,
        refresh_after: Duration,
        expire_after: Duration,
        pool: WorkerPool,
    ) -> Self {
        let entries = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(expire_after)
            .build();
        Self {
            inner: Arc::new(MappingCacheInner {
                name,
                loader,
                entries,
                refresh_locks: DashMap::new(),
                background: DashMap::new(),
                refresh_after,
                pool,
            }),
        }
    }

    /// Returns the current mapping, loading it if absent or expired.
    ///
    /// A stale mapping is returned as-is and a reload is queued on the
    /// worker pool.
    pub async fn get(&self, site_url: &str) -> SharePointResult<Arc<MemberIdMapping>> {
        let snapshot = self.inner.snapshot(site_url).await?;
        if snapshot.loaded_at.elapsed() >= self.inner.refresh_after {
            self.schedule_refresh(site_url, &snapshot.mapping);
        }
        Ok(snapshot.mapping.clone())
    }

    /// Forces a reload unless `observed` was already replaced.
    ///
    /// Refreshers of the same site collection are serialized; the lock is
    /// held across the load so that only the first one hits the server.
    #[instrument(skip(self, observed), fields(cache = self.inner.name))]
    pub async fn refresh(
        &self,
        site_url: &str,
        observed: &Arc<MemberIdMapping>,
    ) -> SharePointResult<Arc<MemberIdMapping>> {
        self.inner.refresh(site_url, observed).await
    }

    pub async fn invalidate(&self, site_url: &str) {
        self.inner.entries.invalidate(site_url).await;
    }

    fn schedule_refresh(&self, site_url: &str, observed: &Arc<MemberIdMapping>) {
        if self.inner.background.insert(site_url.to_string(), ()).is_some() {
            return;
        }
        let inner = self.inner.clone();
        let key = site_url.to_string();
        let observed = observed.clone();
        let submitted = self.inner.pool.submit("mapping_refresh", async move {
            let result = inner.refresh(&key, &observed).await.map(|_| ());
            inner.background.remove(&key);
            result
        });
        if submitted.is_err() {
            self.inner.background.remove(site_url);
        }
    }
}

/// The two member id caches backing ACL resolution.
#[derive(Clone)]
pub struct IdentityCache {
    member_ids: MappingCache,
    site_users: MappingCache,
}

impl IdentityCache {
    pub fn new(member_ids: MappingCache, site_users: MappingCache) -> Self {
        Self {
            member_ids,
            site_users,
        }
    }

    pub fn from_config(
        config: &SharePointConfig,
        member_loader: Arc<dyn MappingLoader>,
        site_user_loader: Arc<dyn MappingLoader>,
        pool: WorkerPool,
    ) -> Self {
        Self::new(
            MappingCache::new(
                "member_ids",
                member_loader,
                config.member_id_cache.refresh_after(),
                config.member_id_cache.expire_after(),
                pool.clone(),
            ),
            MappingCache::new(
                "site_users",
                site_user_loader,
                config.site_user_cache.refresh_after(),
                config.site_user_cache.expire_after(),
                pool,
            ),
        )
    }

    /// Mapping seeded from web users and group rosters.
    pub fn member_ids(&self) -> &MappingCache {
        &self.member_ids
    }

    /// Mapping seeded from the full site user list.
    pub fn site_users(&self) -> &MappingCache {
        &self.site_users
    }

    /// Drops both mappings of a site collection.
    pub async fn invalidate(&self, site_url: &str) {
        self.member_ids.invalidate(site_url).await;
        self.site_users.invalidate(site_url).await;
    }
}
