//! Change feed model, parsing and traversal.
//!
//! A change page is a tree: content database, then site, web, list and list
//! item entries, each tagged with a change state. Every level is judged on
//! its own state; a modified list inside an unchanged web still counts.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::acl::DocId;
use crate::error::{SharePointError, SharePointResult};
use crate::url::canonical_url;

/// State tag carried by every change entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeState {
    Unchanged,
    Delete,
    UpdateSecurity,
    Other(String),
}

impl ChangeState {
    pub fn parse(value: &str) -> Self {
        match value {
            "Unchanged" => ChangeState::Unchanged,
            "Delete" => ChangeState::Delete,
            "UpdateSecurity" => ChangeState::UpdateSecurity,
            other => ChangeState::Other(other.to_string()),
        }
    }

    /// Deletions are left to the index to expire; they are not re-pushed.
    pub fn is_modified(&self) -> bool {
        !matches!(self, ChangeState::Unchanged | ChangeState::Delete)
    }
}

/// A container-level change entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub change: ChangeState,
    pub server_url: String,
    pub display_url: String,
    pub children: Vec<ChangeNode>,
}

impl ChangeEntry {
    fn url(&self) -> String {
        format!("{}{}", self.server_url, self.display_url)
    }
}

/// A list item change entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub change: ChangeState,
    pub server_url: String,
    /// `ows_ServerUrl` of the item row, a host-relative path.
    pub row_server_url: Option<String>,
}

/// One node of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNode {
    ContentDatabase(ChangeEntry),
    Site(ChangeEntry),
    Web(ChangeEntry),
    List(ChangeEntry),
    Item(ItemChange),
}

/// Documents to re-crawl and sites whose group membership must be re-pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changed: BTreeSet<DocId>,
    pub security_changed: BTreeSet<String>,
    /// Canonical site collection URLs touched by this set.
    pub sites: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.security_changed.is_empty()
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.changed.extend(other.changed);
        self.security_changed.extend(other.security_changed);
        self.sites.extend(other.sites);
    }
}

/// Adds every modified object under `node` to `out`.
///
/// `is_included` filters site collections by canonical URL; a site outside
/// the include-list contributes nothing, including its children.
pub fn collect_changes(node: &ChangeNode, is_included: &dyn Fn(&str) -> bool, out: &mut ChangeSet) {
    match node {
        ChangeNode::ContentDatabase(entry) => {
            if entry.change != ChangeState::Unchanged {
                out.changed.insert(DocId::root());
            }
            for child in &entry.children {
                collect_changes(child, is_included, out);
            }
        }
        ChangeNode::Site(entry) => {
            let site_url = canonical_url(&entry.url());
            if !is_included(&site_url) {
                debug!(site_url = %site_url, "Ignoring changes for excluded site collection");
                return;
            }
            if entry.change.is_modified() {
                out.changed.insert(DocId::new(site_url.clone()));
                out.sites.insert(site_url.clone());
            }
            if entry.change == ChangeState::UpdateSecurity {
                out.security_changed.insert(site_url);
            }
            for child in &entry.children {
                collect_changes(child, is_included, out);
            }
        }
        ChangeNode::Web(entry) => {
            if entry.change.is_modified() {
                out.changed.insert(DocId::new(canonical_url(&entry.url())));
            }
            for child in &entry.children {
                collect_changes(child, is_included, out);
            }
        }
        ChangeNode::List(entry) => {
            if entry.change.is_modified() {
                out.changed.insert(DocId::new(entry.url()));
            }
            for child in &entry.children {
                collect_changes(child, is_included, out);
            }
        }
        ChangeNode::Item(item) => {
            if !item.change.is_modified() {
                return;
            }
            match &item.row_server_url {
                Some(path) => {
                    out.changed.insert(DocId::new(format!("{}{}", item.server_url, path)));
                }
                None => warn!("Could not find server url for list item change"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    ContentDatabase,
    Site,
    Web,
    List,
    Item,
}

fn kind_of(local_name: &[u8]) -> Option<Kind> {
    match local_name {
        b"SPContentDatabase" => Some(Kind::ContentDatabase),
        b"SPSite" => Some(Kind::Site),
        b"SPWeb" => Some(Kind::Web),
        b"SPList" => Some(Kind::List),
        b"SPListItem" => Some(Kind::Item),
        _ => None,
    }
}

struct OpenEntry {
    kind: Kind,
    change: Option<ChangeState>,
    server_url: String,
    display_url: String,
    row_server_url: Option<String>,
    children: Vec<ChangeNode>,
}

impl OpenEntry {
    fn from_start(kind: Kind, e: &BytesStart<'_>) -> SharePointResult<Self> {
        Ok(Self {
            kind,
            change: attribute(e, b"Change")?.map(|v| ChangeState::parse(&v)),
            server_url: attribute(e, b"ServerUrl")?.unwrap_or_default(),
            display_url: attribute(e, b"DisplayUrl")?.unwrap_or_default(),
            row_server_url: None,
            children: Vec::new(),
        })
    }

    /// Entries without a change state are skipped along with their children.
    fn finish(self) -> Option<ChangeNode> {
        let Some(change) = self.change else {
            warn!(kind = ?self.kind, "Skipping change entry without a change state");
            return None;
        };
        if self.kind == Kind::Item {
            return Some(ChangeNode::Item(ItemChange {
                change,
                server_url: self.server_url,
                row_server_url: self.row_server_url,
            }));
        }
        let entry = ChangeEntry {
            change,
            server_url: self.server_url,
            display_url: self.display_url,
            children: self.children,
        };
        Some(match self.kind {
            Kind::ContentDatabase => ChangeNode::ContentDatabase(entry),
            Kind::Site => ChangeNode::Site(entry),
            Kind::Web => ChangeNode::Web(entry),
            Kind::List | Kind::Item => ChangeNode::List(entry),
        })
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> SharePointResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn attach(
    stack: &mut [OpenEntry],
    root: &mut Option<ChangeNode>,
    node: Option<ChangeNode>,
) -> SharePointResult<()> {
    let Some(node) = node else {
        return Ok(());
    };
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    } else if root.is_none() {
        *root = Some(node);
    } else {
        return Err(SharePointError::Xml(
            "change page has more than one root entry".to_string(),
        ));
    }
    Ok(())
}

fn record_row(stack: &mut [OpenEntry], e: &BytesStart<'_>) -> SharePointResult<()> {
    if let Some(open) = stack.last_mut() {
        if open.kind == Kind::Item && open.row_server_url.is_none() {
            open.row_server_url = attribute(e, b"ows_ServerUrl")?;
        }
    }
    Ok(())
}

/// Parses one change page into its root node.
pub fn parse_change_page(xml: &str) -> SharePointResult<ChangeNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<OpenEntry> = Vec::new();
    let mut root: Option<ChangeNode> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                let local = e.local_name();
                if let Some(kind) = kind_of(local.as_ref()) {
                    stack.push(OpenEntry::from_start(kind, e)?);
                } else if local.as_ref() == b"row" {
                    record_row(&mut stack, e)?;
                }
            }
            Event::Empty(ref e) => {
                let local = e.local_name();
                if let Some(kind) = kind_of(local.as_ref()) {
                    let node = OpenEntry::from_start(kind, e)?.finish();
                    attach(&mut stack, &mut root, node)?;
                } else if local.as_ref() == b"row" {
                    record_row(&mut stack, e)?;
                }
            }
            Event::End(ref e) => {
                if kind_of(e.local_name().as_ref()).is_some() {
                    let open = stack.pop().ok_or_else(|| {
                        SharePointError::Xml("unbalanced change entry".to_string())
                    })?;
                    attach(&mut stack, &mut root, open.finish())?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(SharePointError::Xml("unterminated change entry".to_string()));
    }
    root.ok_or_else(|| SharePointError::Xml("change page has no change entries".to_string()))
}

/// One page of a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePage {
    Changes(ChangeNode),
    /// The page was fetched and carried no change entries.
    Empty,
    /// The page was fetched, and its cursor advanced, but it did not parse.
    Malformed(String),
}

/// Cursor-paginated change feed for one scope.
#[async_trait]
pub trait ChangePaginator: Send {
    /// Fetches the next page; `Ok(None)` once the feed is exhausted.
    async fn next_page(&mut self) -> SharePointResult<Option<ChangePage>>;

    /// Position just after the last page returned.
    fn cursor(&self) -> &str;
}

/// Raw response of one change request.
#[derive(Debug, Clone, Default)]
pub struct RawChangePage {
    pub xml: String,
    pub next_cursor: String,
    pub more: bool,
}

/// Transport that fetches raw change pages.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn fetch(&self, scope_id: &str, cursor: &str) -> SharePointResult<RawChangePage>;
}

/// Paginator over a [`ChangeFeedSource`] that parses each page's XML.
pub struct XmlChangePaginator {
    source: Arc<dyn ChangeFeedSource>,
    scope_id: String,
    cursor: String,
    done: bool,
}

impl XmlChangePaginator {
    pub fn new(source: Arc<dyn ChangeFeedSource>, scope_id: impl Into<String>, cursor: impl Into<String>) -> Self {
        Self {
            source,
            scope_id: scope_id.into(),
            cursor: cursor.into(),
            done: false,
        }
    }
}

#[async_trait]
impl ChangePaginator for XmlChangePaginator {
    async fn next_page(&mut self) -> SharePointResult<Option<ChangePage>> {
        if self.done {
            return Ok(None);
        }
        let raw = self.source.fetch(&self.scope_id, &self.cursor).await?;
        self.done = !raw.more;
        if raw.more && raw.next_cursor == self.cursor {
            warn!(scope = %self.scope_id, cursor = %self.cursor, "Change feed did not advance, ending poll");
            self.done = true;
        }
        self.cursor = raw.next_cursor;
        if raw.xml.trim().is_empty() {
            debug!(scope = %self.scope_id, more = raw.more, "Empty change page");
            return Ok(Some(ChangePage::Empty));
        }
        Ok(Some(match parse_change_page(&raw.xml) {
            Ok(node) => ChangePage::Changes(node),
            Err(e) => ChangePage::Malformed(e.to_string()),
        }))
    }

    fn cursor(&self) -> &str {
        &self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<SPContentDatabase Change="Unchanged" ItemCount="0">
  <SPSite Change="Unchanged" ItemCount="0" Id="site-1" ServerUrl="http://sp" DisplayUrl="/sites/a">
    <SPWeb Change="Unchanged" ServerUrl="http://sp" DisplayUrl="/sites/a">
      <SPList Change="Unchanged" ServerUrl="http://sp" DisplayUrl="/sites/a/Lists/Tasks">
        <SPListItem Change="Add" ServerUrl="http://sp" DisplayUrl="/sites/a/Lists/Tasks/1_.000">
          <ListItem><xml><rs:data xmlns:rs="urn:rs"><z:row xmlns:z="urn:z" ows_ServerUrl="/sites/a/Lists/Tasks/1_.000"/></rs:data></xml></ListItem>
        </SPListItem>
        <SPListItem Change="Delete" ServerUrl="http://sp" DisplayUrl="/sites/a/Lists/Tasks/2_.000"/>
      </SPList>
    </SPWeb>
    <SPWeb Change="Rename" ServerUrl="http://sp" DisplayUrl="/sites/a/sub/"/>
  </SPSite>
  <SPSite Change="UpdateSecurity" ServerUrl="http://sp" DisplayUrl="/sites/b"/>
</SPContentDatabase>"#;

    fn all(_: &str) -> bool {
        true
    }

    #[test]
    fn test_parse_nested_page() {
        let node = parse_change_page(PAGE).unwrap();
        let ChangeNode::ContentDatabase(db) = &node else {
            panic!("expected content database root");
        };
        assert_eq!(db.change, ChangeState::Unchanged);
        assert_eq!(db.children.len(), 2);
    }

    #[test]
    fn test_collect_changes_per_level() {
        let node = parse_change_page(PAGE).unwrap();
        let mut out = ChangeSet::default();
        collect_changes(&node, &all, &mut out);

        let changed: Vec<&str> = out.changed.iter().map(DocId::as_str).collect();
        assert_eq!(
            changed,
            vec![
                "http://sp/sites/a/Lists/Tasks/1_.000",
                "http://sp/sites/a/sub",
                "http://sp/sites/b",
            ]
        );
        assert_eq!(
            out.security_changed.iter().collect::<Vec<_>>(),
            vec!["http://sp/sites/b"]
        );
    }

    #[test]
    fn test_excluded_site_contributes_nothing() {
        let node = parse_change_page(PAGE).unwrap();
        let mut out = ChangeSet::default();
        collect_changes(&node, &|url: &str| url.ends_with("/sites/a"), &mut out);
        assert!(!out.changed.contains(&DocId::new("http://sp/sites/b")));
        assert!(out.security_changed.is_empty());
        assert!(out.changed.contains(&DocId::new("http://sp/sites/a/sub")));
    }

    #[test]
    fn test_entry_without_state_is_skipped() {
        let xml = r#"<SPSite Change="Unchanged" ServerUrl="http://sp" DisplayUrl="/s">
            <SPWeb ServerUrl="http://sp" DisplayUrl="/s/broken"/>
            <SPWeb Change="Add" ServerUrl="http://sp" DisplayUrl="/s/ok"/>
        </SPSite>"#;
        let node = parse_change_page(xml).unwrap();
        let mut out = ChangeSet::default();
        collect_changes(&node, &all, &mut out);
        assert_eq!(out.changed.len(), 1);
        assert!(out.changed.contains(&DocId::new("http://sp/s/ok")));
    }

    #[test]
    fn test_malformed_xml_is_error() {
        assert!(parse_change_page("<SPSite Change=\"Add\"><SPWeb></SPSite>").is_err());
        assert!(parse_change_page("").is_err());
    }

    /// Serves raw pages in order and records the cursor of every request.
    struct PagedSource {
        pages: std::sync::Mutex<std::collections::VecDeque<RawChangePage>>,
        requested: std::sync::Mutex<Vec<String>>,
    }

    impl PagedSource {
        fn new(pages: Vec<(&str, &str, bool)>) -> Arc<Self> {
            Arc::new(Self {
                pages: std::sync::Mutex::new(
                    pages
                        .into_iter()
                        .map(|(xml, next, more)| RawChangePage {
                            xml: xml.to_string(),
                            next_cursor: next.to_string(),
                            more,
                        })
                        .collect(),
                ),
                requested: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeFeedSource for PagedSource {
        async fn fetch(&self, _scope_id: &str, cursor: &str) -> SharePointResult<RawChangePage> {
            self.requested.lock().unwrap().push(cursor.to_string());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| SharePointError::Transport("no page scripted".into()))
        }
    }

    const SITE_ADD: &str = r#"<SPSite Change="Add" ServerUrl="http://sp" DisplayUrl="/sites/a"/>"#;

    #[tokio::test]
    async fn test_paginator_stops_when_server_has_no_more() {
        let source = PagedSource::new(vec![(SITE_ADD, "c1", true), (SITE_ADD, "c2", false)]);
        let mut paginator = XmlChangePaginator::new(source.clone(), "db", "c0");

        assert!(matches!(paginator.next_page().await.unwrap(), Some(ChangePage::Changes(_))));
        assert_eq!(paginator.cursor(), "c1");
        assert!(matches!(paginator.next_page().await.unwrap(), Some(ChangePage::Changes(_))));
        assert_eq!(paginator.cursor(), "c2");
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(source.requested(), vec!["c0", "c1"]);
    }

    #[tokio::test]
    async fn test_paginator_reports_malformed_page_and_advances() {
        let source = PagedSource::new(vec![("<SPSite Change=\"Add\"><SPWeb>", "c1", false)]);
        let mut paginator = XmlChangePaginator::new(source, "db", "c0");

        assert!(matches!(paginator.next_page().await.unwrap(), Some(ChangePage::Malformed(_))));
        assert_eq!(paginator.cursor(), "c1");
        assert!(paginator.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_paginator_moves_past_empty_page() {
        let source = PagedSource::new(vec![("", "c1", true), (SITE_ADD, "c2", false)]);
        let mut paginator = XmlChangePaginator::new(source.clone(), "db", "c0");

        assert_eq!(paginator.next_page().await.unwrap(), Some(ChangePage::Empty));
        assert_eq!(paginator.cursor(), "c1");
        let Some(ChangePage::Changes(node)) = paginator.next_page().await.unwrap() else {
            panic!("expected the second page");
        };
        let mut out = ChangeSet::default();
        collect_changes(&node, &all, &mut out);
        assert!(out.changed.contains(&DocId::new("http://sp/sites/a")));
        assert_eq!(paginator.cursor(), "c2");
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(source.requested(), vec!["c0", "c1"]);
    }

    #[tokio::test]
    async fn test_paginator_ends_when_cursor_does_not_move() {
        let source = PagedSource::new(vec![("", "c0", true), ("", "c0", true)]);
        let mut paginator = XmlChangePaginator::new(source.clone(), "db", "c0");

        assert_eq!(paginator.next_page().await.unwrap(), Some(ChangePage::Empty));
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(source.requested(), vec!["c0"]);
    }

    #[test]
    fn test_change_state() {
        assert!(!ChangeState::parse("Unchanged").is_modified());
        assert!(!ChangeState::parse("Delete").is_modified());
        assert!(ChangeState::parse("UpdateSecurity").is_modified());
        assert!(ChangeState::parse("Add").is_modified());
    }
}
