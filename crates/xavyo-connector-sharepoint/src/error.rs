//! Error types for the SharePoint connector.

use thiserror::Error;

/// Result type alias using `SharePointError`.
pub type SharePointResult<T> = Result<T, SharePointError>;

/// Errors that can occur while crawling a SharePoint deployment.
#[derive(Debug, Error)]
pub enum SharePointError {
    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A URL could not be turned into a well-formed URI.
    #[error("Invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a status the caller cannot handle.
    #[error("Unexpected HTTP status {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },

    /// Redirect chain exceeded the configured bound.
    #[error("Too many redirects ({max}) while resolving {url}")]
    TooManyRedirects { max: u32, url: String },

    /// The server signalled that it is too busy to answer.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// The remote content service reported an error.
    #[error("Remote service error: {0}")]
    Remote(String),

    /// Transport-level failure reported by a content service client.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Change feed or content payload could not be parsed.
    #[error("XML error: {0}")]
    Xml(String),

    /// A login name could not be decoded into an account name.
    #[error("Unrecognized claim: {0}")]
    Claim(String),

    /// An item references a permission scope that its scope table lacks.
    #[error("Unable to find permission scope for item: {0}")]
    ScopeNotFound(String),

    /// Loading a member id mapping failed.
    #[error("Failed to load member mapping for {site_url}: {message}")]
    MappingLoad { site_url: String, message: String },

    /// ACL inheritance chain could not be walked to its root.
    #[error("Broken ACL inheritance chain at {0}")]
    AclChain(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Pushing to the index failed.
    #[error("Push failed: {0}")]
    Push(String),

    /// Worker pool rejected a task.
    #[error("Worker pool full ({queue_depth} tasks pending)")]
    PoolFull { queue_depth: usize },

    /// Cursor store I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SharePointError {
    /// Returns true if retrying on the next scheduled cycle may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            SharePointError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SharePointError::UnexpectedStatus { status, .. } => *status >= 500,
            SharePointError::ServerBusy(_)
            | SharePointError::Transport(_)
            | SharePointError::MappingLoad { .. }
            | SharePointError::PoolFull { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SharePointError::Cancelled)
    }
}

impl From<quick_xml::Error> for SharePointError {
    fn from(e: quick_xml::Error) -> Self {
        SharePointError::Xml(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for SharePointError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        SharePointError::Xml(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SharePointError::ServerBusy("2".into()).is_transient());
        assert!(SharePointError::Transport("reset".into()).is_transient());
        assert!(SharePointError::UnexpectedStatus {
            status: 503,
            url: "http://sp".into()
        }
        .is_transient());
        assert!(!SharePointError::UnexpectedStatus {
            status: 403,
            url: "http://sp".into()
        }
        .is_transient());
        assert!(!SharePointError::Config("bad".into()).is_transient());
        assert!(!SharePointError::ScopeNotFound("doc".into()).is_transient());
    }

    #[test]
    fn test_cancelled() {
        assert!(SharePointError::Cancelled.is_cancelled());
        assert!(!SharePointError::Xml("x".into()).is_cancelled());
    }
}
