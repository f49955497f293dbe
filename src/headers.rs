//! The engine's header token table.
//!
//! Response headers are only accepted when their name is one of the tokens
//! below. Names are matched case-insensitively and always come back in the
//! table's canonical lower-case form.

use http::HeaderName;

// Sorted, so lookups can binary search.
static TOKENS: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "accept-ranges",
    "access-control-allow-credentials",
    "access-control-allow-headers",
    "access-control-allow-methods",
    "access-control-allow-origin",
    "access-control-expose-headers",
    "access-control-max-age",
    "access-control-request-headers",
    "access-control-request-method",
    "age",
    "allow",
    "alt-svc",
    "authorization",
    "cache-control",
    "cache-digest",
    "connection",
    "content-disposition",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-range",
    "content-security-policy",
    "content-type",
    "cookie",
    "date",
    "etag",
    "expect",
    "expect-ct",
    "expires",
    "forwarded",
    "from",
    "host",
    "http2-settings",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "keep-alive",
    "last-modified",
    "link",
    "location",
    "max-forwards",
    "origin",
    "proxy-authenticate",
    "proxy-authorization",
    "range",
    "referer",
    "referrer-policy",
    "refresh",
    "retry-after",
    "server",
    "set-cookie",
    "strict-transport-security",
    "te",
    "timing-allow-origin",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "upgrade-insecure-requests",
    "user-agent",
    "vary",
    "via",
    "www-authenticate",
    "x-compress-hint",
    "x-content-type-options",
    "x-forwarded-for",
    "x-frame-options",
    "x-reproxy-url",
    "x-traffic",
    "x-xss-protection",
];

/// Looks up a header name in the token table.
///
/// Returns `None` for names the engine doesn't know, including otherwise
/// valid custom headers such as `x-request-id`.
pub fn lookup_token(name: &[u8]) -> Option<HeaderName> {
    if name.is_empty() || name.len() > 64 {
        return None;
    }
    let lower = name.to_ascii_lowercase();
    let lower = std::str::from_utf8(&lower).ok()?;
    TOKENS
        .binary_search(&lower)
        .ok()
        .map(|index| HeaderName::from_static(TOKENS[index]))
}

/// Returns `true` if `name` is the `content-length` token.
pub fn is_content_length(name: &HeaderName) -> bool {
    *name == http::header::CONTENT_LENGTH
}
