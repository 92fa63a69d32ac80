//! Per-document request and response.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::acl::{Acl, DocId};

/// A request for one document's content.
#[derive(Debug, Clone)]
pub struct DocRequest {
    pub doc_id: DocId,
    /// When the index last fetched this document, if ever.
    pub last_access_time: Option<DateTime<Utc>>,
}

impl DocRequest {
    pub fn new(doc_id: impl Into<DocId>) -> Self {
        Self {
            doc_id: doc_id.into(),
            last_access_time: None,
        }
    }

    #[must_use]
    pub fn with_last_access_time(mut self, time: DateTime<Utc>) -> Self {
        self.last_access_time = Some(time);
        self
    }

    /// Whether the caller already holds a copy at least as new as `modified`.
    pub fn can_respond_with_no_content(&self, modified: Option<DateTime<Utc>>) -> bool {
        match (self.last_access_time, modified) {
            (Some(accessed), Some(modified)) => modified <= accessed,
            _ => false,
        }
    }
}

/// Outcome of a content request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocContent {
    Body(Vec<u8>),
    NotModified,
    NotFound,
}

/// Everything the index receives for one document.
#[derive(Debug, Clone)]
pub struct DocResponse {
    pub acl: Option<Acl>,
    pub named_resources: Vec<(String, Acl)>,
    /// Multi-valued metadata; values keep insertion order per key.
    pub metadata: BTreeMap<String, Vec<String>>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub display_url: Option<String>,
    pub content: DocContent,
}

impl Default for DocResponse {
    fn default() -> Self {
        Self {
            acl: None,
            named_resources: Vec::new(),
            metadata: BTreeMap::new(),
            content_type: None,
            last_modified: None,
            display_url: None,
            content: DocContent::NotFound,
        }
    }
}

impl DocResponse {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn not_modified() -> Self {
        Self {
            content: DocContent::NotModified,
            ..Self::default()
        }
    }

    pub fn add_metadata(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.metadata.entry(name.into()).or_default().push(value.into());
    }

    /// First value recorded under `name`.
    pub fn metadata_value(&self, name: &str) -> Option<&str> {
        self.metadata
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn put_named_resource(&mut self, fragment: impl Into<String>, acl: Acl) {
        self.named_resources.push((fragment.into(), acl));
    }

    pub fn is_not_found(&self) -> bool {
        self.content == DocContent::NotFound
    }

    pub fn body_text(&self) -> Option<&str> {
        match &self.content {
            DocContent::Body(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}
