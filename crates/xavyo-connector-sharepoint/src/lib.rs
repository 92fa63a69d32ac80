//! # SharePoint Connector
//!
//! Crawls a SharePoint deployment (a whole web application or a single site
//! collection) into a search index.
//!
//! ## Features
//!
//! - Full enumeration and incremental crawling driven by per-scope change
//!   cursors that survive restarts
//! - ACL reconstruction with scope inheritance, anonymous access rules,
//!   web application policy and per-item read security
//! - Member id and claim resolution backed by refreshing identity caches
//! - Lazily created per-web client handles with host allow-listing
//!
//! The SOAP transport is not part of this crate: callers supply a
//! [`ClientFactory`] producing [`SiteDataClient`], [`UserGroupClient`] and
//! [`PeopleClient`] implementations, and a [`DocIdPusher`] receiving the
//! crawl output.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use xavyo_connector_sharepoint::{FileCursorStore, SharePointConfig, SharePointConnector};
//!
//! let config = SharePointConfig::new("http://sharepoint.example.com")
//!     .with_credentials("CORP\\crawler", "secret")
//!     .with_site_collections_to_include("http://sharepoint.example.com/sites/hr");
//!
//! let store = Arc::new(FileCursorStore::new("/var/lib/sharepoint/cursors.json"));
//! let connector = SharePointConnector::init(config, factory, pusher, store).await?;
//!
//! let cancel = CancellationToken::new();
//! connector.get_doc_ids(&cancel).await?;
//! connector.get_modified_doc_ids(&cancel).await?;
//! ```

pub mod acl;
pub mod auth;
pub mod changes;
pub mod claims;
pub mod client;
pub mod config;
pub mod connector;
pub mod cursor_store;
pub mod dates;
pub mod error;
pub mod groups;
pub mod identity_cache;
pub mod listing;
pub mod member_mapping;
pub mod metadata;
pub mod model;
pub mod permissions;
pub mod principal;
pub mod pusher;
pub mod rare_cache;
pub mod redirect;
pub mod registry;
pub mod resolver;
pub mod response;
pub mod sid;
pub mod tracker;
pub mod url;
pub mod worker;

// Re-exports
pub use acl::{authorize, collect_chain, Acl, AclBuilder, AclKey, AuthzDecision, DocId, InheritanceType};
pub use auth::{AuthContext, Credentials};
pub use changes::{
    ChangeFeedSource, ChangeNode, ChangePage, ChangePaginator, ChangeSet, ChangeState, RawChangePage,
    XmlChangePaginator,
};
pub use claims::decode_claim;
pub use client::{ClientFactory, PeopleClient, SiteClients, SiteDataClient, UserGroupClient};
pub use config::{
    CacheTiming, SharePointConfig, SharePointUrl, SidLookupConfig, SidLookupMethod, WorkerPoolConfig,
};
pub use connector::{check_full_read_policy, PolicyCheck, SharePointConnector};
pub use cursor_store::{CursorMap, CursorStore, FileCursorStore, MemoryCursorStore};
pub use error::{SharePointError, SharePointResult};
pub use groups::{GroupDefinitions, PrincipalNamer};
pub use identity_cache::{IdentityCache, MappingCache, MappingLoader};
pub use member_mapping::MemberIdMapping;
pub use principal::Principal;
pub use pusher::{DocIdPusher, PushErrorHandler, PushKind, Record, RecordingPusher, RetryTransient, WithErrorHandler};
pub use redirect::RedirectResolver;
pub use registry::{SiteHandle, SiteRegistry};
pub use resolver::AclResolver;
pub use response::{DocContent, DocRequest, DocResponse};
pub use sid::SidResolver;
pub use tracker::{ChangeTracker, PollOutcome, ScopeDelta};
pub use worker::WorkerPool;
