//! Bounded redirect resolution for lenient URL handling.
//!
//! SharePoint issues redirects whose `Location` is not properly encoded, so
//! in lenient mode redirects are followed here rather than by the HTTP
//! client, re-encoding each hop and stopping after a configured number.

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::auth::AuthContext;
use crate::error::{SharePointError, SharePointResult};
use crate::url::{encode_sharepoint_url, root_url};

/// Header SharePoint sets when it refuses a request.
const SHAREPOINT_ERROR_HEADER: &str = "SharePointError";

/// Follows redirects for a URL up to a bound.
#[derive(Debug, Clone)]
pub struct RedirectResolver {
    client: reqwest::Client,
    auth: Arc<AuthContext>,
    max_redirects: u32,
}

impl RedirectResolver {
    pub fn new(
        auth: Arc<AuthContext>,
        max_redirects: u32,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> SharePointResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            client,
            auth,
            max_redirects,
        })
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    /// Returns the final URL serving `url`, or `None` when it does not exist.
    #[instrument(skip(self), fields(max_redirects = self.max_redirects))]
    pub async fn resolve(&self, url: &str) -> SharePointResult<Option<Url>> {
        let mut current = encode_sharepoint_url(url, true)?;
        let mut redirects = 0u32;
        loop {
            let request = self.auth.authorize(self.client.get(current.clone()), &current);
            let response = request.send().await?;
            check_sharepoint_error(&response)?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if status == StatusCode::OK {
                return Ok(Some(current));
            }
            if status != StatusCode::MOVED_PERMANENTLY && status != StatusCode::FOUND {
                return Err(SharePointError::UnexpectedStatus {
                    status: status.as_u16(),
                    url: current.to_string(),
                });
            }
            if redirects >= self.max_redirects {
                return Err(SharePointError::TooManyRedirects {
                    max: self.max_redirects,
                    url: url.to_string(),
                });
            }
            redirects += 1;

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| SharePointError::Remote(format!("redirect without Location from {current}")))?;
            let next = absolute_location(&current, location)?;
            debug!(from = %current, to = %next, redirects, "Following redirect");
            current = encode_sharepoint_url(&next, true)?;
        }
    }
}

/// Turns a `Location` header into an absolute raw URL.
fn absolute_location(current: &Url, location: &str) -> SharePointResult<String> {
    let lower = location.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(location.to_string());
    }
    if !location.starts_with('/') {
        return Err(SharePointError::Remote(format!(
            "unsupported relative redirect location: {location}"
        )));
    }
    Ok(format!("{}{}", root_url(current.as_str()), location))
}

fn check_sharepoint_error(response: &reqwest::Response) -> SharePointResult<()> {
    let Some(value) = response.headers().get(SHAREPOINT_ERROR_HEADER) else {
        return Ok(());
    };
    let value = value.to_str().unwrap_or_default().trim().to_string();
    if value == "2" {
        Err(SharePointError::ServerBusy(response.url().to_string()))
    } else {
        Err(SharePointError::Remote(format!(
            "SharePoint error {value} for {}",
            response.url()
        )))
    }
}
