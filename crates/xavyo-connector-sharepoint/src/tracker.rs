//! Per-scope change cursors and change feed polling.
//!
//! A scope is a content database (virtual server mode) or a site collection
//! (single site mode). Its cursor moves only after a page has been handled,
//! and every move is persisted before the next page is requested, so a crash
//! can replay at most the page in flight.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::changes::{collect_changes, ChangePage, ChangePaginator, ChangeSet};
use crate::cursor_store::{CursorMap, CursorStore};
use crate::error::{SharePointError, SharePointResult};

/// Difference between the known scopes and the scopes the server reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeDelta {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub retained: BTreeSet<String>,
}

impl ScopeDelta {
    /// Any scope appeared or disappeared.
    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Result of polling one scope.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub changes: ChangeSet,
    /// Pages whose cursor was committed.
    pub pages: usize,
    pub malformed_pages: usize,
    /// Failure that ended the poll early; committed pages stay committed.
    pub error: Option<SharePointError>,
    pub cancelled: bool,
}

impl PollOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// Owns the scope to cursor table.
pub struct ChangeTracker {
    cursors: DashMap<String, String>,
    store: Arc<dyn CursorStore>,
    persist_lock: Mutex<()>,
}

impl ChangeTracker {
    /// Creates a tracker primed with the cursors found in `store`.
    pub async fn load(store: Arc<dyn CursorStore>) -> SharePointResult<Self> {
        let stored = store.load().await?;
        info!(scopes = stored.len(), "Loaded change cursors");
        Ok(Self {
            cursors: stored.into_iter().collect(),
            store,
            persist_lock: Mutex::new(()),
        })
    }

    pub fn cursor(&self, scope: &str) -> Option<String> {
        self.cursors.get(scope).map(|c| c.value().clone())
    }

    pub fn known_scopes(&self) -> BTreeSet<String> {
        self.cursors.iter().map(|e| e.key().clone()).collect()
    }

    /// Compares the known scopes against `reported` without changing state.
    pub fn reconcile(&self, reported: &BTreeSet<String>) -> ScopeDelta {
        let known = self.known_scopes();
        ScopeDelta {
            added: reported.difference(&known).cloned().collect(),
            removed: known.difference(reported).cloned().collect(),
            retained: known.intersection(reported).cloned().collect(),
        }
    }

    /// Sets the starting cursor of a scope that has none.
    ///
    /// Returns false, leaving the cursor alone, if the scope already had one.
    pub async fn seed(&self, scope: &str, cursor: &str) -> SharePointResult<bool> {
        if self.cursors.contains_key(scope) {
            return Ok(false);
        }
        self.commit(|map| {
            map.entry(scope.to_string()).or_insert_with(|| cursor.to_string());
        })
        .await?;
        debug!(scope = %scope, cursor = %cursor, "Seeded change cursor");
        Ok(true)
    }

    /// Drops the cursors of scopes the server no longer reports.
    pub async fn forget(&self, scopes: &BTreeSet<String>) -> SharePointResult<()> {
        if scopes.is_empty() {
            return Ok(());
        }
        self.commit(|map| {
            for scope in scopes {
                map.remove(scope);
            }
        })
        .await?;
        info!(scopes = ?scopes, "Forgot change cursors");
        Ok(())
    }

    async fn advance(&self, scope: &str, cursor: &str) -> SharePointResult<()> {
        self.commit(|map| {
            map.insert(scope.to_string(), cursor.to_string());
        })
        .await
    }

    /// Applies `update` to a copy of the table, persists it, then publishes
    /// it. The lock keeps concurrent commits from persisting stale copies.
    async fn commit(&self, update: impl FnOnce(&mut CursorMap)) -> SharePointResult<()> {
        let _guard = self.persist_lock.lock().await;
        let mut map: CursorMap = self
            .cursors
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        update(&mut map);
        self.store.save(&map).await?;
        self.cursors.retain(|scope, _| map.contains_key(scope));
        for (scope, cursor) in map {
            self.cursors.insert(scope, cursor);
        }
        Ok(())
    }

    /// Drains `paginator`, committing its cursor after every page.
    ///
    /// Transport failures and cancellation end the poll without touching the
    /// cursor of the page in flight; they are reported in the outcome so
    /// that changes from committed pages are not lost.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn poll(
        &self,
        scope: &str,
        paginator: &mut dyn ChangePaginator,
        is_included: &(dyn Fn(&str) -> bool + Sync),
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                page = paginator.next_page() => page,
            };
            match page {
                Ok(None) => break,
                Ok(Some(ChangePage::Changes(node))) => {
                    collect_changes(&node, is_included, &mut outcome.changes);
                }
                Ok(Some(ChangePage::Empty)) => {}
                Ok(Some(ChangePage::Malformed(message))) => {
                    warn!(error = %message, "Skipping unparseable change page");
                    outcome.malformed_pages += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Change feed request failed, cursor kept");
                    outcome.error = Some(e);
                    break;
                }
            }
            if let Err(e) = self.advance(scope, paginator.cursor()).await {
                warn!(error = %e, "Failed to persist change cursor");
                outcome.error = Some(e);
                break;
            }
            outcome.pages += 1;
        }
        debug!(
            pages = outcome.pages,
            changed = outcome.changes.changed.len(),
            "Poll finished"
        );
        outcome
    }
}
