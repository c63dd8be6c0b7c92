//! # Authentication
//!
//! Bearer-token authentication against the configured key set. The token
//! arrives either as `Authorization: Bearer <token>` or in the alternate
//! header named by `auth.header_name`. Comparison is constant-time so a
//! timing side channel cannot probe key bytes. Authenticated callers get a
//! stable `user_key_id` derived from the token hash, used for per-user
//! rate limiting and logging without ever writing the key itself anywhere.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Identity attached to a request after authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Short stable identifier for the caller credential
    pub user_key_id: String,
}

/// Compare two byte strings without short-circuiting on the first
/// difference. Length differences still fold into the result.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Derive the stable caller id from a credential.
pub fn user_key_id(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut id = String::with_capacity(16 + 4);
    id.push_str("key-");
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Pull the credential out of the request headers.
///
/// The alternate header, when configured, carries the bare token; the
/// Authorization header is accepted with or without the `Bearer` scheme.
pub fn extract_token(headers: &HeaderMap, header_name: Option<&str>) -> Option<String> {
    if let Some(name) = header_name {
        return headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
    }

    let value = headers.get("authorization")?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Validate a credential against the configured key set.
///
/// Every configured key is compared so the work done does not depend on
/// which key matches. An empty key set disables authentication and yields
/// an anonymous caller id.
pub fn authenticate(
    headers: &HeaderMap,
    api_keys: &[String],
    header_name: Option<&str>,
) -> Result<AuthContext, String> {
    if api_keys.is_empty() {
        return Ok(AuthContext {
            user_key_id: "anonymous".to_string(),
        });
    }

    let Some(token) = extract_token(headers, header_name) else {
        return Err("missing credential".to_string());
    };

    let mut matched = false;
    for key in api_keys {
        matched |= constant_time_eq(token.as_bytes(), key.as_bytes());
    }
    if matched {
        Ok(AuthContext {
            user_key_id: user_key_id(&token),
        })
    } else {
        Err("invalid credential".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            name.parse::<axum::http::HeaderName>().unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_token_is_accepted() {
        let keys = vec!["sk-gw-alpha".to_string()];
        let headers = headers_with("authorization", "Bearer sk-gw-alpha");
        let ctx = authenticate(&headers, &keys, None).unwrap();
        assert!(ctx.user_key_id.starts_with("key-"));
    }

    #[test]
    fn bare_token_in_authorization_is_accepted() {
        let keys = vec!["sk-gw-alpha".to_string()];
        let headers = headers_with("authorization", "sk-gw-alpha");
        assert!(authenticate(&headers, &keys, None).is_ok());
    }

    #[test]
    fn configured_header_overrides_authorization() {
        let keys = vec!["sk-gw-alpha".to_string()];
        let headers = headers_with("x-proxy-key", "sk-gw-alpha");
        assert!(authenticate(&headers, &keys, Some("x-proxy-key")).is_ok());
        // With the alternate header configured, Authorization is ignored.
        let headers = headers_with("authorization", "Bearer sk-gw-alpha");
        assert!(authenticate(&headers, &keys, Some("x-proxy-key")).is_err());
    }

    #[test]
    fn wrong_or_missing_tokens_are_rejected() {
        let keys = vec!["sk-gw-alpha".to_string()];
        assert!(authenticate(&HeaderMap::new(), &keys, None).is_err());
        let headers = headers_with("authorization", "Bearer sk-gw-wrong");
        assert!(authenticate(&headers, &keys, None).is_err());
    }

    #[test]
    fn empty_key_set_disables_auth() {
        let ctx = authenticate(&HeaderMap::new(), &[], None).unwrap();
        assert_eq!(ctx.user_key_id, "anonymous");
    }

    #[test]
    fn key_id_is_stable_and_opaque() {
        let a = user_key_id("sk-gw-alpha");
        let b = user_key_id("sk-gw-alpha");
        let c = user_key_id("sk-gw-beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.contains("alpha"));
    }

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
