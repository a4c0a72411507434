//! Request and message signing
//!
//! Every signed request or message is authenticated by an HMAC-SHA256 over a
//! newline-joined canonical string:
//! ```text
//! HTTP:    "{ts}\n{nonce}\n{method}\n{canonical_path}\n{sha256hex(body)}"
//! Message: "{ts}\n{nonce}\n{type}\n{sha256hex(json_body)}"
//! ```
//! The body hash is the empty string when there is no body.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex SHA-256 of `data`, or the empty string for an empty input
pub fn sha256_hex(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    hex::encode(Sha256::digest(data))
}

/// Hash of a message body as it appears in the signature base
///
/// The body is serialized compactly with sorted object keys, escaping `<`,
/// `>`, `&`, U+2028 and U+2029 the way the reference clients do. An absent
/// or `null` body hashes to the empty string.
pub fn json_body_hash(body: Option<&Value>) -> String {
    match body {
        None | Some(Value::Null) => String::new(),
        Some(value) => match serde_json::to_string(value) {
            Ok(text) => sha256_hex(escape_html(&text).as_bytes()),
            Err(_) => String::new(),
        },
    }
}

// These characters only ever occur inside JSON strings, so a textual
// replacement cannot alter the structure.
fn escape_html(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        match ch {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    out
}

/// Canonical string for an HTTP request
pub fn http_signature_base(
    ts: i64,
    nonce: &str,
    method: &str,
    canonical_path: &str,
    body_hash: &str,
) -> String {
    format!("{ts}\n{nonce}\n{method}\n{canonical_path}\n{body_hash}")
}

/// Canonical string for a channel message
pub fn message_signature_base(ts: i64, nonce: &str, msg_type: &str, body_hash: &str) -> String {
    format!("{ts}\n{nonce}\n{msg_type}\n{body_hash}")
}

/// Hex HMAC-SHA256 of `base` under `secret`
pub fn sign_hex(secret: &[u8], base: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(base.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Compare two signatures without leaking the position of the first mismatch
pub fn timing_safe_eq(expected: &str, actual: &str) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    expected.as_bytes().ct_eq(actual.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex_empty_is_empty() {
        assert_eq!(sha256_hex(b""), "");
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_json_body_hash_sorts_keys_and_escapes() {
        let body = json!({"b": 1, "a": "<x&y>"});
        let expected = sha256_hex(br#"{"a":"\u003cx\u0026y\u003e","b":1}"#);
        assert_eq!(json_body_hash(Some(&body)), expected);
        assert_eq!(json_body_hash(None), "");
        assert_eq!(json_body_hash(Some(&Value::Null)), "");
    }

    #[test]
    fn test_signature_bases() {
        assert_eq!(
            http_signature_base(10, "n", "POST", "/api/x", "h"),
            "10\nn\nPOST\n/api/x\nh"
        );
        assert_eq!(message_signature_base(10, "n", "t", ""), "10\nn\nt\n");
    }

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let sig = sign_hex(b"Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq("abcd", "abcd"));
        assert!(!timing_safe_eq("abcd", "abce"));
        assert!(!timing_safe_eq("abcd", "abc"));
    }
}
