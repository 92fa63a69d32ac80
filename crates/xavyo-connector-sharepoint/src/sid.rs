//! Directory lookup of Windows group SIDs.
//!
//! Claims-based web applications report domain groups as
//! `c:0+.w|<sid>`. When a directory is configured the SID is translated to
//! the group's `DOMAIN\name` account; otherwise the display name is used.

use async_trait::async_trait;

use crate::error::SharePointResult;

/// Translates security identifiers into account names.
#[async_trait]
pub trait SidResolver: Send + Sync {
    /// `Ok(None)` when the directory has no account for `sid`.
    async fn account_for_sid(&self, sid: &str) -> SharePointResult<Option<String>>;
}
