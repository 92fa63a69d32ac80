//! URL canonicalization and encoding.
//!
//! SharePoint hands out URLs whose paths are not percent-encoded (spaces stay
//! spaces). The scheme and authority are assumed valid, so only the path is
//! escaped; encoding the whole string would mangle the host.

use url::Url;

use crate::acl::DocId;
use crate::error::{SharePointError, SharePointResult};

/// Strips exactly one trailing slash.
#[must_use]
pub fn canonical_url(url: &str) -> String {
    url.strip_suffix('/').unwrap_or(url).to_string()
}

/// Turns a raw SharePoint URL into a well-formed URI.
///
/// The first three `/`-separated parts (`scheme:`, empty, authority) are
/// parsed as-is; everything after is the path and is escaped on its own.
pub fn sp_url_to_uri(sp_url: &str) -> SharePointResult<Url> {
    let parts: Vec<&str> = sp_url.splitn(4, '/').collect();
    if parts.len() < 3 {
        return Err(SharePointError::InvalidUrl {
            url: sp_url.to_string(),
            message: "missing scheme or authority".to_string(),
        });
    }
    let host = parts[..3].join("/");
    let mut uri = Url::parse(&host).map_err(|e| SharePointError::InvalidUrl {
        url: sp_url.to_string(),
        message: e.to_string(),
    })?;
    if uri.cannot_be_a_base() {
        return Err(SharePointError::InvalidUrl {
            url: sp_url.to_string(),
            message: "not a hierarchical URL".to_string(),
        });
    }
    if let Some(path) = parts.get(3) {
        uri.set_path(&format!("/{path}"));
    }
    Ok(uri)
}

/// Encodes a URL found in content or a redirect.
///
/// In lenient mode a query string is split off and kept as a query instead
/// of being escaped into the path.
pub fn encode_sharepoint_url(url: &str, lenient: bool) -> SharePointResult<Url> {
    if !lenient {
        return sp_url_to_uri(url);
    }
    match url.split_once('?') {
        Some((base, query)) => {
            let mut uri = sp_url_to_uri(base)?;
            uri.set_query(Some(query));
            Ok(uri)
        }
        None => sp_url_to_uri(url),
    }
}

/// Returns `scheme://authority` of a raw URL.
#[must_use]
pub fn root_url(url: &str) -> String {
    let parts: Vec<&str> = url.splitn(4, '/').collect();
    if parts.len() < 3 {
        return url.to_string();
    }
    parts[..3].join("/")
}

/// Resolves a possibly relative SharePoint URL against `web_url`.
///
/// Absolute URLs are kept, host-relative paths get the web's scheme and
/// authority, and other relative paths are appended to the web URL.
#[must_use]
pub fn encode_doc_id(web_url: &str, url: &str) -> DocId {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") || lower.starts_with("http://") {
        DocId::new(url)
    } else if !url.starts_with('/') {
        DocId::new(format!("{web_url}/{url}"))
    } else {
        DocId::new(format!("{}{url}", root_url(web_url)))
    }
}

/// Returns the URL of the web containing `web_url`, if it has one.
#[must_use]
pub fn parent_web_url(web_url: &str) -> Option<String> {
    let root = root_url(web_url);
    let idx = web_url.rfind('/')?;
    if idx < root.len() {
        return None;
    }
    Some(web_url[..idx].to_string())
}

/// Returns `host:port`, filling in the scheme's default port.
#[must_use]
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host.to_lowercase(), port))
}

/// Number of `/`-separated parts, used to tell root URLs from site URLs.
pub(crate) fn path_depth(url: &str) -> usize {
    url.split('/').filter(|part| !part.is_empty()).count()
}
