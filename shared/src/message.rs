//! Channel message carried inside every frame

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signing;

/// A JSON message exchanged over a persistent connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// Signing timestamp in seconds; 0 when unsigned
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ts: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sign: String,

    /// Device identifier of the sender or subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl Message {
    /// Create an unsigned message
    pub fn new(msg_type: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            body,
            ..Default::default()
        }
    }

    /// Create an error reply
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            msg_type: crate::msg_type::ERROR.into(),
            error: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Set the device identifier
    pub fn with_udid(mut self, udid: impl Into<String>) -> Self {
        self.udid = Some(udid.into());
        self
    }

    /// Sign this message in place with the given secret, timestamp and nonce
    pub fn sign(&mut self, secret: &[u8], ts: i64, nonce: impl Into<String>) {
        self.ts = ts;
        self.nonce = nonce.into();
        let base = signing::message_signature_base(
            ts,
            &self.nonce,
            &self.msg_type,
            &signing::json_body_hash(self.body.as_ref()),
        );
        self.sign = signing::sign_hex(secret, &base).unwrap_or_default();
    }

    /// Look up a string field of the body
    pub fn body_str(&self, field: &str) -> Option<&str> {
        self.body.as_ref()?.get(field)?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unsigned_message_omits_auth_fields() {
        let msg = Message::new("script/run", Some(json!({"name": "main.lua"})));
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"type":"script/run","body":{"name":"main.lua"}}"#);
    }

    #[test]
    fn test_missing_fields_default() {
        let msg: Message = serde_json::from_str(r#"{"type":"app/hello"}"#).unwrap();
        assert_eq!(msg.msg_type, "app/hello");
        assert_eq!(msg.ts, 0);
        assert!(msg.nonce.is_empty());
        assert!(msg.body.is_none());
    }

    #[test]
    fn test_sign_fills_signature() {
        let mut msg = Message::new("script/push/report", Some(json!({"success": true})));
        msg.sign(b"secret", 1_700_000_000, "n-1");
        assert_eq!(msg.ts, 1_700_000_000);
        assert_eq!(msg.nonce, "n-1");
        assert_eq!(msg.sign.len(), 64);
    }
}
