//! Decoding of SharePoint claims-encoded login names.
//!
//! Claims-based web applications report login names such as
//! `i:0#.w|DOMAIN\user`. Only strings carrying a claims prefix
//! (`<type>:0<kind>.<origin>|`) are decoded; anything else is already a
//! plain account name.

use tracing::warn;

use crate::error::{SharePointError, SharePointResult};

const WINDOWS_USER_PREFIX: &str = "i:0#.w|";
const WINDOWS_GROUP_PREFIX: &str = "c:0+.w|";
const FORMS_ROLE_PREFIX: &str = "c:0-.f|";
const FORMS_USER_PREFIX: &str = "i:0#.f|";
const EVERYONE_CLAIM: &str = "c:0(.s|true";
const AUTHENTICATED_USERS_CLAIM: &str = "c:0!.s|windows";

/// Principal name SharePoint uses for "all users".
pub const EVERYONE: &str = "Everyone";

/// Principal name for Windows authenticated users.
pub const AUTHENTICATED_USERS: &str = "NT AUTHORITY\\authenticated users";

/// The SID embedded in a Windows group claim.
pub fn windows_group_sid(login_name: &str) -> Option<&str> {
    login_name
        .strip_prefix(WINDOWS_GROUP_PREFIX)
        .filter(|sid| !sid.is_empty())
}

/// Decodes a login name into the account name used in ACLs.
///
/// `display_name` is returned for Windows group claims, which do not embed
/// a usable account name.
pub fn decode_claim(login_name: &str, display_name: &str) -> SharePointResult<String> {
    if !has_claims_prefix(login_name) {
        return Ok(login_name.to_string());
    }

    if let Some(account) = login_name.strip_prefix(WINDOWS_USER_PREFIX) {
        return Ok(account.to_string());
    }
    if login_name.starts_with(WINDOWS_GROUP_PREFIX) {
        return Ok(display_name.to_string());
    }
    if login_name == EVERYONE_CLAIM {
        return Ok(EVERYONE.to_string());
    }
    if login_name == AUTHENTICATED_USERS_CLAIM {
        return Ok(AUTHENTICATED_USERS.to_string());
    }
    if let Some(rest) = login_name
        .strip_prefix(FORMS_ROLE_PREFIX)
        .or_else(|| login_name.strip_prefix(FORMS_USER_PREFIX))
    {
        return Ok(rest.replace('|', ":"));
    }
    if is_trusted_provider_claim(login_name) {
        let parts: Vec<&str> = login_name.splitn(3, '|').collect();
        if parts.len() == 3 {
            return Ok(parts[2].to_string());
        }
    }

    warn!(login_name = %login_name, "Unsupported claims value");
    Err(SharePointError::Claim(login_name.to_string()))
}

fn has_claims_prefix(login_name: &str) -> bool {
    if login_name.starts_with("i:0") || login_name.starts_with("c:0") {
        return true;
    }
    let bytes = login_name.as_bytes();
    bytes.len() >= 7
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2] == b'0'
        && bytes[4] == b'.'
        && bytes[6] == b'|'
}

/// Matches `i:0?.t|...` and `c:0?.t|...`, the trusted identity provider forms.
fn is_trusted_provider_claim(login_name: &str) -> bool {
    let bytes = login_name.as_bytes();
    bytes.len() >= 6
        && (bytes[0] == b'i' || bytes[0] == b'c')
        && bytes[1] == b':'
        && bytes[2] == b'0'
        && bytes[4] == b'.'
        && bytes[5] == b't'
        && bytes.get(6) == Some(&b'|')
}
