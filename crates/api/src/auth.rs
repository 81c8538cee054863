//! Caller credentials and request metadata.
//!
//! The relay does not authenticate callers itself. It only carries the
//! caller's `Api-Key` header through to the general-purpose agent, so the
//! helpers here read headers and keep secrets out of the logs.

use axum::http::HeaderMap;
use relay_common::Credential;
use tracing::debug;

/// Header carrying the caller's DIAL key.
pub const API_KEY_HEADER: &str = "api-key";

/// Request headers as `(name, value)` pairs. Non UTF-8 values are dropped.
pub fn request_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                debug!(header = %name, "Dropping non UTF-8 header value");
                None
            }
        })
        .collect()
}

/// The caller's key, if one was sent.
pub fn caller_credential(headers: &HeaderMap) -> Option<Credential> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Credential::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_request_headers_keep_utf8_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-conversation-id", HeaderValue::from_static("conv-1"));
        headers.insert(
            "x-binary",
            HeaderValue::from_bytes(&[0xfa, 0xfb]).unwrap(),
        );

        let pairs = request_headers(&headers);
        assert_eq!(pairs, vec![("x-conversation-id".to_string(), "conv-1".to_string())]);
    }

    #[test]
    fn test_caller_credential_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Api-Key", HeaderValue::from_static("caller-key"));
        assert_eq!(caller_credential(&headers).unwrap().expose(), "caller-key");
    }

    #[test]
    fn test_caller_credential_missing_or_blank() {
        let mut headers = HeaderMap::new();
        assert!(caller_credential(&headers).is_none());
        headers.insert("api-key", HeaderValue::from_static("  "));
        assert!(caller_credential(&headers).is_none());
    }
}
