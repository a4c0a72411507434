//! Canonical request paths

use fleet_shared::auth;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Bytes left as-is by query escaping; space becomes `+`
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const SIGNATURE_KEYS: [&str; 3] = [
    auth::QUERY_TS_KEY,
    auth::QUERY_NONCE_KEY,
    auth::QUERY_SIGN_KEY,
];

fn query_escape(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ESCAPE)
        .to_string()
        .replace("%20", "+")
}

/// Reduce a request target (`/path?query`) to the form that is signed
///
/// The path is percent-decoded (`/` when empty). Signature query keys are
/// dropped, the remaining keys are sorted and each key's values are sorted,
/// then everything is re-encoded as `?k=v&k=v`.
pub fn canonical_path(target: &str) -> String {
    let target = target.split_once('#').map_or(target, |(head, _)| head);
    let (raw_path, raw_query) = target.split_once('?').unwrap_or((target, ""));

    let mut path = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();
    if path.is_empty() {
        path.push('/');
    }

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
        if SIGNATURE_KEYS.contains(&&*key) {
            continue;
        }
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    if params.is_empty() {
        return path;
    }

    let mut query = String::new();
    for (key, values) in params.iter_mut() {
        values.sort();
        for value in values.iter() {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&query_escape(key));
            query.push('=');
            query.push_str(&query_escape(value));
        }
    }

    format!("{path}?{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_path() {
        assert_eq!(canonical_path("/api/scripts"), "/api/scripts");
        assert_eq!(canonical_path(""), "/");
        assert_eq!(canonical_path("?"), "/");
    }

    #[test]
    fn test_path_is_decoded() {
        assert_eq!(canonical_path("/api/files/my%20dir"), "/api/files/my dir");
    }

    #[test]
    fn test_signature_keys_stripped() {
        assert_eq!(
            canonical_path("/api/devices?ts=1&nonce=abc&sign=ff"),
            "/api/devices"
        );
        assert_eq!(
            canonical_path("/api/devices?sign=ff&group=a&ts=1"),
            "/api/devices?group=a"
        );
    }

    #[test]
    fn test_reordering_is_neutralized() {
        let a = canonical_path("/api/x?b=2&a=1&a=0");
        let b = canonical_path("/api/x?a=0&b=2&a=1");
        assert_eq!(a, "/api/x?a=0&a=1&b=2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_values_reencoded() {
        assert_eq!(
            canonical_path("/api/x?name=hello%20world&path=a%2Fb~c"),
            "/api/x?name=hello+world&path=a%2Fb~c"
        );
        assert_eq!(canonical_path("/api/x?q=a+b"), "/api/x?q=a+b");
    }

    #[test]
    fn test_fragment_ignored() {
        assert_eq!(canonical_path("/api/x?a=1#frag"), "/api/x?a=1");
    }
}
