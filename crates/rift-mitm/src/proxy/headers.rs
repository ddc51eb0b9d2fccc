//! Hop-by-hop header handling.

use hyper::header::{HeaderName, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::HeaderMap;

pub static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
pub static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Headers meaningful only between the client and this proxy. They are
/// removed from relayed requests and responses.
pub fn hop_headers() -> [&'static HeaderName; 4] {
    [
        &PROXY_CONNECTION,
        &KEEP_ALIVE,
        &PROXY_AUTHENTICATE,
        &PROXY_AUTHORIZATION,
    ]
}

pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in hop_headers() {
        headers.remove(name);
    }
}

/// Replaces `dst` with a copy of every entry of `src`, repeated values included.
pub fn clone_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    dst.clear();
    dst.reserve(src.len());
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, ACCEPT, CONNECTION};

    #[test]
    fn test_strip_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(&PROXY_CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(&KEEP_ALIVE, HeaderValue::from_static("timeout=5"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        headers.insert(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        strip_hop_headers(&mut headers);
        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(ACCEPT));
        assert!(headers.contains_key(CONNECTION));
    }

    #[test]
    fn test_clone_headers_keeps_repeated_values() {
        let mut src = HeaderMap::new();
        src.append("x-tag", HeaderValue::from_static("a"));
        src.append("x-tag", HeaderValue::from_static("b"));

        let mut dst = HeaderMap::new();
        dst.insert("x-stale", HeaderValue::from_static("1"));
        clone_headers(&src, &mut dst);

        let values: Vec<_> = dst.get_all("x-tag").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
        assert!(!dst.contains_key("x-stale"));
    }
}
