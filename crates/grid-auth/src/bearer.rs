//! Bearer token extraction (RFC 6750)
//!
//! ```text
//! Authorization: Bearer <token>
//! ```

use http::header::AUTHORIZATION;
use http::HeaderMap;

pub const AUTHORIZATION_SCHEME: &str = "Bearer";

/// Extract the bearer token from request headers
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case(AUTHORIZATION_SCHEME) {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}
