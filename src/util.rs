//! Shared helpers for building outbound URLs and reading request headers.

use axum::http::HeaderMap;

/// Customer-facing download link for a redemption code.
pub fn download_url(base_url: &str, code: &str) -> String {
    format!(
        "{}/download/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(code)
    )
}

/// Read a header as a trimmed, non-empty string.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
