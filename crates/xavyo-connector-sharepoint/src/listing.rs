//! Plain-text bodies for container documents.
//!
//! Webs, lists and folders are indexed as a listing of links to their
//! children so the index can discover them by following the body.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::acl::DocId;

pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Object type names reported in metadata and listing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    VirtualServer,
    Site,
    List,
    Folder,
    ListItem,
    Document,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::VirtualServer => "VirtualServer",
            ObjectType::Site => "Site",
            ObjectType::List => "List",
            ObjectType::Folder => "Folder",
            ObjectType::ListItem => "ListItem",
            ObjectType::Document => "Document",
        }
    }
}

/// Builds a listing body section by section.
#[derive(Debug)]
pub struct LinkListing {
    out: String,
    links: usize,
}

impl LinkListing {
    pub fn new(doc_id: &DocId, kind: ObjectType, title: Option<&str>) -> Self {
        let heading = match title {
            Some(title) if !title.is_empty() => title,
            _ if doc_id.is_root() => "root",
            _ => doc_id.as_str(),
        };
        Self {
            out: format!("{}: {heading}\n", kind.as_str()),
            links: 0,
        }
    }

    pub fn start_section(&mut self, kind: ObjectType) {
        let _ = write!(self.out, "\n[{}]\n", kind.as_str());
    }

    pub fn add_link(&mut self, doc_id: &DocId, label: Option<&str>) {
        self.links += 1;
        match label {
            Some(label) if !label.is_empty() => {
                let _ = writeln!(self.out, "{doc_id}\t{label}");
            }
            _ => {
                let _ = writeln!(self.out, "{doc_id}");
            }
        }
    }

    /// Appends metadata as `name: value` lines so it is searchable as text.
    pub fn add_metadata(&mut self, metadata: &BTreeMap<String, Vec<String>>) {
        if metadata.is_empty() {
            return;
        }
        self.out.push_str("\n[Metadata]\n");
        for (name, values) in metadata {
            for value in values {
                let _ = writeln!(self.out, "{name}: {value}");
            }
        }
    }

    pub fn link_count(&self) -> usize {
        self.links
    }

    pub fn finish(self) -> Vec<u8> {
        self.out.into_bytes()
    }
}
