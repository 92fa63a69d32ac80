//! Credentials and the host allow-list for outbound calls.
//!
//! One `AuthContext` is created per connector start and handed to every
//! component that talks to SharePoint. Credentials and session cookies are
//! only ever attached to requests for hosts on the allow-list.

use dashmap::DashSet;
use secrecy::{ExposeSecret, SecretString};
use std::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::config::SharePointConfig;
use crate::error::{SharePointError, SharePointResult};
use crate::url::host_key;

/// Account the connector authenticates as.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// Session cookie obtained from a forms-based login.
#[derive(Debug, Clone)]
struct SessionCookies {
    host: String,
    header: String,
}

/// Authentication state scoped to one connector instance.
#[derive(Debug)]
pub struct AuthContext {
    credentials: Option<Credentials>,
    permitted_hosts: DashSet<String>,
    session: RwLock<Option<SessionCookies>>,
    user_agent: Option<String>,
}

impl AuthContext {
    pub fn new(credentials: Option<Credentials>, user_agent: Option<String>) -> Self {
        Self {
            credentials,
            permitted_hosts: DashSet::new(),
            session: RwLock::new(None),
            user_agent,
        }
    }

    pub fn from_config(config: &SharePointConfig) -> Self {
        let credentials = if config.username.is_empty() {
            None
        } else {
            Some(Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
            })
        };
        Self::new(credentials, config.user_agent.clone())
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }

    /// Adds the host of `url` to the allow-list.
    pub fn permit_host(&self, url: &Url) -> SharePointResult<()> {
        let key = host_key(url).ok_or_else(|| SharePointError::InvalidUrl {
            url: url.to_string(),
            message: "URL has no host".to_string(),
        })?;
        if self.permitted_hosts.insert(key.clone()) {
            debug!(host = %key, "Host added to allow-list");
        }
        Ok(())
    }

    pub fn is_permitted_host(&self, url: &Url) -> bool {
        host_key(url).is_some_and(|key| self.permitted_hosts.contains(&key))
    }

    /// Remembers session cookies issued by `url`'s host.
    pub fn set_session_cookies(&self, url: &Url, header: impl Into<String>) {
        let Some(host) = host_key(url) else {
            return;
        };
        match self.session.write() {
            Ok(mut session) => {
                *session = Some(SessionCookies {
                    host,
                    header: header.into(),
                })
            }
            Err(_) => warn!("Session cookie lock poisoned"),
        }
    }

    /// Cookie header for `url`, only when it targets the issuing host and port.
    pub fn cookies_for(&self, url: &Url) -> Option<String> {
        let host = host_key(url)?;
        let session = self.session.read().ok()?;
        session
            .as_ref()
            .filter(|s| s.host == host)
            .map(|s| s.header.clone())
    }

    /// Attaches credentials, cookies and user agent to a request for `url`.
    pub fn authorize(&self, request: reqwest::RequestBuilder, url: &Url) -> reqwest::RequestBuilder {
        let mut request = request;
        if let Some(agent) = &self.user_agent {
            request = request.header(reqwest::header::USER_AGENT, agent);
        }
        if !self.is_permitted_host(url) {
            return request;
        }
        if let Some(cookies) = self.cookies_for(url) {
            request = request.header(reqwest::header::COOKIE, cookies);
        } else if let Some(credentials) = &self.credentials {
            request = request.basic_auth(
                &credentials.username,
                Some(credentials.password.expose_secret()),
            );
        }
        request
    }

    /// Drops every permitted host and session.
    pub fn clear(&self) {
        self.permitted_hosts.clear();
        if let Ok(mut session) = self.session.write() {
            *session = None;
        }
    }
}
